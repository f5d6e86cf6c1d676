//! Control plane
//!
//! Everything that changes daemon state from outside the keypad goes
//! through a [`ControlCommand`] on one channel, handled in order by
//! [`run_control_loop`]. Sources are Unix signals, the IPC socket and the
//! remote peer listener.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::DaemonContext;
use crate::ipc::{serve_connection, ControlSocket, IpcRequest, IpcResponse};

#[derive(Debug)]
pub enum ControlCommand {
    /// Re-read the keymap file
    ReloadConfig,
    /// Look for newly attached devices
    RescanDevices,
    /// A forwarding peer connected
    PeerConnected(TcpStream),
    /// The peer from `generation` hung up
    PeerLost { generation: u64 },
    Quit,
}

impl ControlCommand {
    /// The command an IPC request maps to, if it is not answered directly.
    pub fn from_request(request: &IpcRequest) -> Option<Self> {
        match request {
            IpcRequest::Reload => Some(Self::ReloadConfig),
            IpcRequest::Rescan => Some(Self::RescanDevices),
            IpcRequest::Quit => Some(Self::Quit),
            IpcRequest::Status => None,
        }
    }
}

// ============================================================================
// Control loop
// ============================================================================

/// Handle commands until `Quit` or shutdown.
pub async fn run_control_loop(ctx: Arc<DaemonContext>, mut commands: mpsc::Receiver<ControlCommand>) {
    let mut shutdown = ctx.shutdown.subscribe();
    let mut listener = start_peer_listener(&ctx).await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                if !handle_command(&ctx, &mut listener, command).await {
                    break;
                }
            }
        }
    }

    if let Some(handle) = listener.take() {
        handle.abort();
    }
    ctx.link.detach().await;
    ctx.request_shutdown();
    tracing::debug!("Control loop stopped");
}

/// Returns `false` once the daemon should stop.
async fn handle_command(
    ctx: &Arc<DaemonContext>,
    listener: &mut Option<JoinHandle<()>>,
    command: ControlCommand,
) -> bool {
    match command {
        ControlCommand::ReloadConfig => match ctx.reload_config() {
            Ok(network_changed) => {
                tracing::info!("Keymap reloaded");
                if network_changed {
                    tracing::info!("Network settings changed, restarting peer listener");
                    if let Some(handle) = listener.take() {
                        handle.abort();
                    }
                    ctx.link.detach().await;
                    *listener = start_peer_listener(ctx).await;
                }
            }
            Err(e) => tracing::error!("{:#}; keeping the current keymap", e),
        },
        ControlCommand::RescanDevices => match ctx.rescan_devices() {
            Ok(started) => tracing::info!("Rescan found {} new device node(s)", started),
            Err(e) => tracing::warn!("Rescan failed: {:#}", e),
        },
        ControlCommand::PeerConnected(stream) => {
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
            }
            let (reader, writer) = stream.into_split();
            let generation = ctx.link.attach(writer).await;
            tracing::info!("Forwarding to {}", peer);
            tokio::spawn(watch_peer(reader, generation, ctx.commands.clone()));
        }
        ControlCommand::PeerLost { generation } => {
            ctx.link.detach_if(generation).await;
        }
        ControlCommand::Quit => {
            tracing::info!("Shutting down...");
            return false;
        }
    }
    true
}

// ============================================================================
// Remote peer listener
// ============================================================================

async fn start_peer_listener(ctx: &Arc<DaemonContext>) -> Option<JoinHandle<()>> {
    let network = ctx.resolver.with_config(|c| c.global.network.clone());
    if !network.enabled {
        return None;
    }

    match TcpListener::bind(("0.0.0.0", network.port)).await {
        Ok(listener) => {
            tracing::info!("Listening for a forwarding peer on port {}", network.port);
            Some(tokio::spawn(accept_peers(listener, ctx.commands.clone())))
        }
        Err(e) => {
            tracing::error!("Failed to listen on port {}: {}", network.port, e);
            None
        }
    }
}

async fn accept_peers(listener: TcpListener, commands: mpsc::Sender<ControlCommand>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::info!("Peer connected from {}", addr);
                if commands.send(ControlCommand::PeerConnected(stream)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to accept peer: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Wait for the peer to hang up. Peers never send data, so anything read is
/// discarded.
async fn watch_peer(mut reader: OwnedReadHalf, generation: u64, commands: mpsc::Sender<ControlCommand>) {
    let mut buf = [0u8; 64];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("Peer read error: {}", e);
                break;
            }
        }
    }
    let _ = commands.send(ControlCommand::PeerLost { generation }).await;
}

// ============================================================================
// Signals and IPC
// ============================================================================

/// Translate SIGHUP, SIGUSR2, SIGINT and SIGTERM into commands.
///
/// # Errors
///
/// Fails if a signal handler cannot be installed.
pub fn spawn_signal_handler(commands: mpsc::Sender<ControlCommand>) -> Result<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut usr2 =
        signal(SignalKind::user_defined2()).context("Failed to install SIGUSR2 handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    Ok(tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                _ = hangup.recv() => ControlCommand::ReloadConfig,
                _ = usr2.recv() => ControlCommand::RescanDevices,
                _ = interrupt.recv() => ControlCommand::Quit,
                _ = terminate.recv() => ControlCommand::Quit,
            };
            tracing::debug!("Signal received: {:?}", command);
            if commands.send(command).await.is_err() {
                return;
            }
        }
    }))
}

/// Answer one IPC request against the running daemon.
pub fn handle_request(ctx: &DaemonContext, request: IpcRequest) -> IpcResponse {
    let Some(command) = ControlCommand::from_request(&request) else {
        return IpcResponse::Status(ctx.status());
    };

    let message = match &command {
        ControlCommand::ReloadConfig => "Reload requested",
        ControlCommand::RescanDevices => "Rescan requested",
        _ => "Shutdown requested",
    };

    match ctx.commands.try_send(command) {
        Ok(()) => IpcResponse::Success {
            message: Some(message.to_string()),
        },
        Err(e) => IpcResponse::Error {
            message: format!("Daemon is busy: {}", e),
        },
    }
}

/// Serve the IPC socket until shutdown.
pub async fn run_ipc_server(ctx: Arc<DaemonContext>, server: ControlSocket) {
    let mut shutdown = ctx.shutdown.subscribe();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            stream = server.accept() => {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!("{:#}", e);
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, |req| handle_request(&ctx, req)).await {
                        tracing::warn!("IPC connection failed: {:#}", e);
                    }
                });
            }
        }
    }
}
