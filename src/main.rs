//! Host-side flashing tool for 8-bit microcontrollers running a CAN-bus
//! bootloader. See [`canboot_flash`] for the library this binary is a thin
//! `tokio`-based shell around.

use std::fs;
use std::io::{self, Read, Write};

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use canboot_flash::catalog::{self, UNKNOWN_DEVICE};
use canboot_flash::cli::Cli;
use canboot_flash::error::FlashError;
use canboot_flash::frame::CanFrame;
use canboot_flash::hexio;
use canboot_flash::image::Image;
use canboot_flash::linux_can::LinuxCan;
use canboot_flash::pinger::Pinger;
use canboot_flash::session::{OperationMode, Session, SessionConfig};
use canboot_flash::transport::{parse_reset_frame, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    pretty_env_logger::formatted_timed_builder()
        .filter_level(cli.log_level())
        .init();

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(err) => {
            log::error!("{err}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let device = catalog::lookup(&cli.partno);
    if device == UNKNOWN_DEVICE {
        bail!(FlashError::Configuration(format!("unknown part number '{}'", cli.partno)));
    }

    let mode = if cli.is_read_mode() {
        OperationMode::Read
    } else {
        OperationMode::Flash
    };

    let file_path = cli.file.as_deref().context("--file is required")?;

    let image = match mode {
        OperationMode::Read => Image::empty(),
        OperationMode::Flash => {
            let text = read_text_input(file_path)?;
            hexio::parse(&text)?
        }
    };

    let config = SessionConfig {
        mcu_id: cli.mcuid,
        can_id_mcu: cli.can_id_mcu,
        can_id_remote: cli.can_id_remote,
        extended: !cli.sff,
        device,
        mode,
        erase: cli.erase,
        verify: !cli.no_verify,
        force: cli.force,
        read_limit: cli.read_limit(),
    };
    let total_bytes = image.total_bytes();
    let mut session = Session::new(config, image);

    let mut transport = LinuxCan::open(&cli.iface)
        .await
        .with_context(|| format!("opening CAN interface '{}'", cli.iface))?;

    if let Some(reset_spec) = &cli.reset {
        let reset_frame = parse_reset_frame(reset_spec)?;
        transport.send(reset_frame).await?;
    }

    let (ping_tx, mut ping_rx) = mpsc::channel::<CanFrame>(8);
    let mut pinger = cli
        .ping
        .map(|interval_ms| Pinger::spawn(interval_ms, cli.can_id_mcu, !cli.sff, cli.mcuid, ping_tx.clone()));
    drop(ping_tx);

    let progress = build_progress_bar(mode, total_bytes);

    let outcome = loop {
        tokio::select! {
            raw = transport.recv() => {
                let Some(raw) = raw else {
                    break Err(FlashError::Transport("transport closed unexpectedly".into()));
                };
                let step = session.on_frame(&raw);
                let mut send_failed = None;
                for frame in step.frames {
                    if let Err(e) = transport.send(frame).await {
                        send_failed = Some(e);
                        break;
                    }
                }
                if let Some(e) = send_failed {
                    break Err(e);
                }
                if step.stop_pinger {
                    if let Some(p) = pinger.take() {
                        p.stop();
                    }
                }
                progress.set_position(session.bytes_written() as u64);
                if let Some(finished) = step.finished {
                    break finished;
                }
            }
            Some(ping_frame) = ping_rx.recv() => {
                if let Err(e) = transport.send(ping_frame).await {
                    break Err(e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break Err(FlashError::Transport("cancelled by operator".into()));
            }
        }
    };

    if let Some(p) = pinger.take() {
        p.stop();
    }
    let _ = transport.close().await;

    match outcome {
        Ok(output) => {
            progress.finish_with_message("done");
            if cli.is_read_mode() {
                let bytes = output.read_bytes.unwrap_or_default();
                let image = Image::from_single_block(0, bytes);
                let text = hexio::serialize(&image)?;
                write_text_output(file_path, &text)?;
            }
            Ok(())
        }
        Err(err) => {
            progress.abandon_with_message("failed");
            Err(err.into())
        }
    }
}

fn build_progress_bar(mode: OperationMode, total_bytes: usize) -> ProgressBar {
    match mode {
        OperationMode::Flash if total_bytes > 0 => {
            let bar = ProgressBar::new(total_bytes as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        }
        _ => ProgressBar::new_spinner(),
    }
}

fn read_text_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).context("reading hex from stdin")?;
        Ok(buf)
    } else {
        fs::read_to_string(path).with_context(|| format!("reading hex file '{path}'"))
    }
}

fn write_text_output(path: &str, text: &str) -> Result<()> {
    if path == "-" {
        io::stdout().write_all(text.as_bytes()).context("writing hex to stdout")
    } else {
        fs::write(path, text).with_context(|| format!("writing hex file '{path}'"))
    }
}
