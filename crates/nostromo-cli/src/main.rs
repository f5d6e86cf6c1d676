//! nostromo CLI
//!
//! Keymap validation, device listing, daemon control, and the remote peer
//! that replays forwarded keystrokes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use nostromo_config::{MappingKind, Mode, NetworkConfig};
use nostromo_daemon::device;
use nostromo_daemon::injector::UinputInjector;
use nostromo_daemon::ipc::{self, DaemonStatus, IpcRequest, IpcResponse};
use nostromo_daemon::remote::replay_frames;

/// Wait between reconnect attempts in `remote`.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "nostromo")]
#[command(about = "Control tool for the nostromo keymap daemon")]
#[command(version)]
struct Cli {
    /// Path to the keymap file
    #[arg(short, long, default_value = "~/.config/nostromo/keymap.kdl")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the keymap file
    Validate,

    /// List Nostromo devices
    Devices {
        /// List every input device, not just Nostromos
        #[arg(short, long)]
        all: bool,
    },

    /// Show daemon status
    Status {
        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Make the daemon re-read its keymap
    Reload,

    /// Make the daemon look for newly attached devices
    Rescan,

    /// Stop the daemon
    Quit,

    /// Replay keystrokes forwarded by a daemon on another machine
    Remote {
        /// Host running nostromod [default: the keymap's network server]
        #[arg(long)]
        host: Option<String>,

        /// [default: the keymap's network port]
        #[arg(short, long)]
        port: Option<u16>,

        /// Exit when the connection ends instead of reconnecting
        #[arg(long)]
        once: bool,
    },
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config_path: PathBuf = shellexpand::tilde(&cli.config).into_owned().into();

    match cli.command {
        Commands::Validate => cmd_validate(&config_path),
        Commands::Devices { all } => cmd_devices(all),
        Commands::Status { json } => cmd_status(json),
        Commands::Reload => cmd_control(IpcRequest::Reload),
        Commands::Rescan => cmd_control(IpcRequest::Rescan),
        Commands::Quit => cmd_control(IpcRequest::Quit),
        Commands::Remote { host, port, once } => cmd_remote(&config_path, host, port, once),
    }
}

fn cmd_validate(config_path: &Path) -> miette::Result<()> {
    println!("Validating keymap: {}", config_path.display());

    let config = nostromo_config::parse_config(config_path).map_err(miette::Report::new)?;

    println!("Keymap is valid!");
    for (index, keymap) in config.configs.iter().enumerate() {
        let marker = if index == config.global.current_config {
            "*"
        } else {
            " "
        };
        println!("  {} {} ({})", marker, keymap.name, keymap.model);
        for mode in Mode::ALL {
            let bound = (0..keymap.model.max_keys())
                .filter_map(|key| keymap.mapping(mode, key))
                .filter(|m| !m.strokes.is_empty() || m.kind != MappingKind::Single)
                .count();
            if bound > 0 {
                println!("      {:<6} {} key(s) bound", mode.as_str(), bound);
            }
        }
    }
    println!("  Start mode: {}", config.global.start_mode);
    if config.global.network.enabled {
        println!("  Forwarding on port {}", config.global.network.port);
    }

    Ok(())
}

fn cmd_devices(all: bool) -> miette::Result<()> {
    if all {
        return list_all_devices();
    }

    let devices = device::enumerate_devices().map_err(|e| miette::miette!("{:#}", e))?;
    if devices.is_empty() {
        println!("No Nostromo devices found");
        return Ok(());
    }

    println!("Nostromo devices:\n");
    for info in devices {
        println!("  {} [{}]", info.name, info.model);
        println!("    Path: {}", info.path.display());
        if info.has_leds {
            println!("    Mode indicator LEDs");
        }
        println!();
    }

    Ok(())
}

fn list_all_devices() -> miette::Result<()> {
    println!("Available input devices:\n");

    let mut paths: Vec<PathBuf> = std::fs::read_dir("/dev/input")
        .into_diagnostic()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("event"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    for path in paths {
        // Skip devices we can't open
        let Ok(dev) = evdev::Device::open(&path) else {
            continue;
        };
        let id = dev.input_id();
        let kind = match device::model_for(id.vendor(), id.product()) {
            Some(model) => model.to_string(),
            None => "other".to_string(),
        };

        println!("  {} [{}]", dev.name().unwrap_or("Unknown"), kind);
        println!("    Path: {}", path.display());
        println!("    ID: {:04x}:{:04x}", id.vendor(), id.product());
        println!();
    }

    Ok(())
}

fn request(request: IpcRequest) -> miette::Result<IpcResponse> {
    ipc::call(&ipc::socket_path(), &request).map_err(|e| miette::miette!("{:#}", e))
}

fn cmd_status(json: bool) -> miette::Result<()> {
    match request(IpcRequest::Status)? {
        IpcResponse::Status(status) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&status).into_diagnostic()?);
            } else {
                print_status(&status);
            }
            Ok(())
        }
        IpcResponse::Error { message } => Err(miette::miette!("{}", message)),
        other => Err(miette::miette!("Unexpected response: {:?}", other)),
    }
}

fn print_status(status: &DaemonStatus) {
    println!("Keymap: {} ({})", status.config, status.model);
    match status.previous_mode {
        Some(previous) => println!("Mode: {} (shifted from {})", status.mode, previous),
        None => println!("Mode: {}", status.mode),
    }
    println!(
        "Remote peer: {}",
        if status.remote_connected {
            "connected"
        } else {
            "none"
        }
    );
    println!("Pending actions: {}", status.pending_actions);

    if status.devices.is_empty() {
        println!("Devices: none");
    } else {
        println!("Devices:");
        for dev in &status.devices {
            let leds = if dev.leds { ", LEDs" } else { "" };
            println!("  {} ({}{}) {}", dev.name, dev.model, leds, dev.path.display());
        }
    }
}

fn cmd_control(req: IpcRequest) -> miette::Result<()> {
    match request(req)? {
        IpcResponse::Success { message } => {
            println!("{}", message.unwrap_or_else(|| "OK".to_string()));
            Ok(())
        }
        IpcResponse::Error { message } => Err(miette::miette!("{}", message)),
        other => Err(miette::miette!("Unexpected response: {:?}", other)),
    }
}

/// Pick the daemon to connect to. Flags win over the keymap's `network`
/// block; without a `--host` forwarding has to be enabled there.
fn remote_endpoint(
    network: &NetworkConfig,
    host: Option<String>,
    port: Option<u16>,
) -> miette::Result<(String, u16)> {
    let port = port.unwrap_or(network.port);
    if let Some(host) = host {
        return Ok((host, port));
    }
    if !network.enabled {
        miette::bail!("Forwarding is disabled in the keymap; pass --host to connect anyway");
    }
    if network.server.is_empty() {
        miette::bail!("No server set in the keymap's network block; pass --host");
    }
    Ok((network.server.clone(), port))
}

fn cmd_remote(
    config_path: &Path,
    host: Option<String>,
    port: Option<u16>,
    once: bool,
) -> miette::Result<()> {
    let (host, port) = if host.is_some() && port.is_some() {
        remote_endpoint(&NetworkConfig::default(), host, port)?
    } else {
        let config = nostromo_config::parse_config(config_path).map_err(miette::Report::new)?;
        remote_endpoint(&config.global.network, host, port)?
    };
    let host = host.as_str();

    let injector = UinputInjector::new("nostromo remote").map_err(|e| miette::miette!("{:#}", e))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    runtime.block_on(async move {
        loop {
            match replay_from(host, port, &injector).await {
                Ok(count) => tracing::info!("Connection closed after {} action(s)", count),
                Err(e) => tracing::warn!("{:#}", e),
            }

            if once {
                return Ok::<(), miette::Report>(());
            }
            tracing::info!("Reconnecting in {}s", RECONNECT_DELAY.as_secs());
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}

async fn replay_from(host: &str, port: u16, injector: &UinputInjector) -> anyhow::Result<u64> {
    use anyhow::Context;

    let mut stream = tokio::net::TcpStream::connect((host, port))
        .await
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
    tracing::info!("Connected to {}:{}", host, port);

    let count = replay_frames(&mut stream, injector)
        .await
        .with_context(|| format!("Connection to {}:{} failed", host, port))?;
    Ok(count)
}
