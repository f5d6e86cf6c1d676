//! nostromod
//!
//! Grabs the Nostromo keypad and plays its keymap.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

use nostromo_daemon::context::DaemonContext;
use nostromo_daemon::control;
use nostromo_daemon::injector::{self, IndicatorControl, LedIndicator, UinputInjector};
use nostromo_daemon::ipc::{self, ControlSocket, IpcRequest};

const VIRTUAL_DEVICE_NAME: &str = "nostromo virtual keyboard";

#[derive(Parser, Debug)]
#[command(name = "nostromod")]
#[command(about = "Keymap daemon for the Belkin Nostromo n50/n52")]
#[command(version)]
struct Args {
    /// Path to the keymap file
    #[arg(short, long, default_value = "~/.config/nostromo/keymap.kdl")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins; otherwise the keymap's log-level is applied once it
    // has been read
    let env_filter = EnvFilter::try_from_default_env().ok();
    let from_env = env_filter.is_some();
    let (filter, filter_handle) =
        reload::Layer::new(env_filter.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    let config_path: PathBuf = shellexpand::tilde(&args.config).into_owned().into();

    let socket_path = ipc::socket_path();
    if ipc::call(&socket_path, &IpcRequest::Reload).is_ok() {
        tracing::info!("nostromod is already running; asked it to reload");
        return Ok(());
    }

    tracing::info!("Loading keymap from {}", config_path.display());
    let config = nostromo_config::parse_config(&config_path)
        .with_context(|| format!("Failed to load keymap from {}", config_path.display()))?;

    if !from_env {
        let level = config.global.log_level.as_str();
        if let Err(e) = filter_handle.modify(|f| *f = EnvFilter::new(level)) {
            tracing::warn!("Could not apply log-level {}: {}", level, e);
        }
    }

    if let Some(keymap) = config.active() {
        tracing::info!(
            "Using keymap '{}' ({}), starting in {} mode",
            keymap.name,
            keymap.model,
            config.global.start_mode
        );
    }
    let light_show = config.global.light_show;

    let injector = Arc::new(UinputInjector::new(VIRTUAL_DEVICE_NAME)?);
    let leds = Arc::new(LedIndicator::new());
    let (ctx, commands) = DaemonContext::new(config_path, config, injector, leds);

    let server = ControlSocket::bind(socket_path)?;

    let mut tasks = vec![
        tokio::spawn(ctx.clone().run_scheduler()),
        tokio::spawn(control::run_control_loop(ctx.clone(), commands)),
        tokio::spawn(control::run_ipc_server(ctx.clone(), server)),
    ];
    tasks.push(control::spawn_signal_handler(ctx.commands.clone())?);

    if let Err(e) = ctx.rescan_devices() {
        tracing::warn!("Device scan failed: {:#}", e);
    }

    if light_show && ctx.leds.is_attached() {
        injector::light_show(ctx.leds.as_ref()).await;
    }
    ctx.resolver.sync_indicator();

    tracing::info!("nostromod running");

    let mut shutdown = ctx.shutdown.subscribe();
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    // The signal handler never finishes on its own
    if let Some(signals) = tasks.pop() {
        signals.abort();
    }
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            tracing::warn!("Task ended abnormally: {}", e);
        }
    }

    if let Err(e) = ctx.leds.set_indicator(0) {
        tracing::debug!("Could not clear indicator: {:#}", e);
    }

    tracing::info!("Shut down");
    Ok(())
}
