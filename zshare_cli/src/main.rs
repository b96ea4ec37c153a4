use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use qrcode::QrCode;
use qrcode::render::unicode;
use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;
use zshare_core::config::default_download_dir;
use zshare_core::crypto::{KeyPair, generate_key_pair};
use zshare_core::transfer::utils::open_secure_file;
use zshare_core::transfer::{format_bitrate, human_file_size, save_received};
use zshare_core::{
    Direction, EngineConfig, FileSource, Session, SessionKeys, TransferEvent, memory_channel,
    signaling,
};

#[derive(Parser)]
#[command(name = "zshare", version, about = "Peer-to-peer file transfer engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a key pair for receiving encrypted files
    Keygen {
        /// Also write the private key (PKCS#8 DER) here
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Compact a session description into a URL-safe token
    EncodeSdp {
        /// File holding the description; stdin when omitted
        input: Option<PathBuf>,
    },
    /// Expand a token back into a session description
    DecodeSdp {
        token: String,
        /// The token came from the answering side
        #[arg(long)]
        answer: bool,
    },
    /// Print a share link (and QR code) for a token
    ShareUrl {
        token: String,
        #[arg(long, default_value = "http://localhost:5173/receive")]
        base: String,
        #[arg(long)]
        no_qr: bool,
    },
    /// Send files between two in-process peers and save what arrives
    Demo {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Where received copies go
        #[arg(long)]
        out: Option<PathBuf>,
        /// Skip end-to-end encryption
        #[arg(long)]
        plain: bool,
    },
    /// Show the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load();
    config.validate().context("invalid configuration")?;

    match cli.command {
        Command::Keygen { out } => keygen(out).await,
        Command::EncodeSdp { input } => {
            let sdp = match input {
                Some(path) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut text = String::new();
                    std::io::stdin().read_to_string(&mut text)?;
                    text
                }
            };
            println!("{}", signaling::encode(&sdp));
            Ok(())
        }
        Command::DecodeSdp { token, answer } => {
            print!("{}", signaling::decode(&token, !answer)?);
            Ok(())
        }
        Command::ShareUrl { token, base, no_qr } => {
            let url = signaling::share_url(&base, &token)?;
            println!("{}", url);
            if !no_qr {
                print_qr(&url);
            }
            Ok(())
        }
        Command::Demo { files, out, plain } => {
            let out = out.unwrap_or_else(default_download_dir);
            demo(config, files, out, !plain).await
        }
        Command::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                let path = config.save()?;
                println!("Saved to {}", path.display());
            }
            Ok(())
        }
    }
}

async fn keygen(out: Option<PathBuf>) -> Result<()> {
    let keys = generate_key_pair().await?;
    println!("{}", keys.public.to_base64()?);
    if let Some(path) = out {
        let der = keys.private.to_pkcs8_der()?;
        let mut file = open_secure_file(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        file.write_all(&der).await?;
        file.flush().await?;
        eprintln!("Private key written to {}", path.display());
    }
    Ok(())
}

fn print_qr(text: &str) {
    match QrCode::new(text.as_bytes()) {
        Ok(code) => {
            let image = code
                .render::<unicode::Dense1x2>()
                .dark_color(unicode::Dense1x2::Light)
                .light_color(unicode::Dense1x2::Dark)
                .build();
            println!("{}", image);
        }
        Err(e) => tracing::warn!("No QR code for this link: {}", e),
    }
}

async fn demo(config: EngineConfig, files: Vec<PathBuf>, out: PathBuf, encrypt: bool) -> Result<()> {
    let keys: Option<KeyPair> = if encrypt {
        Some(generate_key_pair().await?)
    } else {
        None
    };

    let ((a_tx, a_rx), (b_tx, b_rx)) = memory_channel();
    let mut send_config = config.clone();
    send_config.send.is_encrypt = encrypt;
    let mut receive_config = config;
    receive_config.receive.auto_accept = true;

    let (sender, mut sender_events) = Session::spawn(
        a_tx,
        a_rx,
        send_config,
        SessionKeys {
            local: None,
            peer: keys.as_ref().map(|k| k.public.clone()),
        },
    );
    let (receiver, mut receiver_events) = Session::spawn(
        b_tx,
        b_rx,
        receive_config,
        SessionKeys {
            local: keys,
            peer: None,
        },
    );

    let mut outstanding = HashSet::new();
    for path in files {
        let id = sender.send_file(FileSource::from_path(&path)).await?;
        tracing::info!("Sending {} as {}", path.display(), id);
        outstanding.insert(id);
    }

    // A file is done once the sender is finished with it and, if it was
    // sent in full, the receiver has it too.
    let mut awaiting_receiver = HashSet::new();
    let mut failures = 0;
    while !outstanding.is_empty() || !awaiting_receiver.is_empty() {
        tokio::select! {
            Some(event) = sender_events.recv() => match event {
                TransferEvent::Completed(detail) => {
                    outstanding.remove(&detail.id);
                    awaiting_receiver.insert(detail.id);
                }
                TransferEvent::Aborted { detail, cause } => {
                    tracing::error!("Send of {} failed: {}", detail.meta.name, cause);
                    outstanding.remove(&detail.id);
                    failures += 1;
                }
                _ => {}
            },
            Some(event) = receiver_events.recv() => match event {
                TransferEvent::Progress(detail) => {
                    tracing::info!(
                        "{} {:>3}% {}",
                        detail.meta.name,
                        detail.progress,
                        format_bitrate(detail.bitrate)
                    );
                }
                TransferEvent::Received(file) => {
                    let path = save_received(&out, &file).await?;
                    println!(
                        "{} ({}) -> {}",
                        file.meta.name,
                        human_file_size(file.data.len() as u64),
                        path.display()
                    );
                    awaiting_receiver.remove(&file.id);
                }
                TransferEvent::Aborted { detail, cause } if detail.direction == Direction::Receiving => {
                    tracing::error!("Receive of {} failed: {}", detail.meta.name, cause);
                    awaiting_receiver.remove(&detail.id);
                    outstanding.remove(&detail.id);
                    failures += 1;
                }
                _ => {}
            },
            else => break,
        }
    }

    sender.shutdown().await.ok();
    receiver.shutdown().await.ok();
    if failures > 0 {
        bail!("{} transfer(s) failed", failures);
    }
    Ok(())
}
