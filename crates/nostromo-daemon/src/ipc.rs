//! Control socket
//!
//! The `nostromo` CLI talks to the daemon over a Unix socket, one JSON
//! object per line: the client writes an [`IpcRequest`], the daemon answers
//! with one [`IpcResponse`] and the connection ends. A starting daemon also
//! uses [`call`] to find an instance that is already running.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nostromo_config::Mode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

const SOCKET_NAME: &str = "nostromo.sock";
const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Control requests, tagged by `type`: `{"type":"reload"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Re-read the keymap file
    Reload,
    /// Look for newly attached devices
    Rescan,
    Quit,
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Status(DaemonStatus),
    Error {
        message: String,
    },
}

/// Snapshot of the resolver, the peer link and the open devices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonStatus {
    pub mode: Mode,
    /// Mode a shift key will return to
    pub previous_mode: Option<Mode>,
    #[serde(rename = "remote")]
    pub remote_connected: bool,
    pub pending_actions: usize,
    /// Name of the active keymap
    pub config: String,
    pub model: String,
    pub devices: Vec<DeviceStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceStatus {
    pub name: String,
    pub path: PathBuf,
    pub model: String,
    /// This node drives the mode LEDs
    pub leds: bool,
}

/// Where the control socket lives for the current user:
/// `$XDG_RUNTIME_DIR/nostromo.sock`, else `/tmp/nostromo-$UID.sock`.
pub fn socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join(SOCKET_NAME),
        None => PathBuf::from(format!("/tmp/nostromo-{}.sock", nix::unistd::getuid())),
    }
}

/// Serialize `message` as one newline-terminated line.
fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message).context("Failed to encode control message")?;
    line.push(b'\n');
    Ok(line)
}

/// Read one line from `reader`. `None` when the peer closed without
/// sending anything.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end().to_string()))
}

fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line).with_context(|| format!("Malformed control message: {}", line))
}

/// Listening end of the control socket. Removes its socket file on drop.
pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlSocket {
    /// Listen at `path`.
    ///
    /// # Errors
    ///
    /// Fails if another daemon still answers on `path`, or if the socket
    /// cannot be created. A leftover file nobody listens on is replaced.
    pub fn bind(path: PathBuf) -> Result<Self> {
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                bail!("Another nostromod is listening on {}", path.display());
            }
            tracing::debug!("Replacing dead control socket {}", path.display());
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Failed to listen on {}", path.display()))?;
        tracing::info!("Control socket at {}", path.display());

        Ok(Self { listener, path })
    }

    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .context("Failed to accept control connection")?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

/// Answer the single request on `stream` with `handler`.
///
/// A line that is not a valid request gets an [`IpcResponse::Error`]
/// instead of reaching `handler`.
pub async fn serve_connection<F>(stream: UnixStream, handler: F) -> Result<()>
where
    F: FnOnce(IpcRequest) -> IpcResponse,
{
    let (reader, mut writer) = stream.into_split();
    let Some(line) = read_line(&mut BufReader::new(reader)).await? else {
        return Ok(());
    };
    tracing::debug!("control request: {}", line);

    let response = match decode_line::<IpcRequest>(&line) {
        Ok(request) => handler(request),
        Err(e) => {
            tracing::warn!("{:#}", e);
            IpcResponse::Error {
                message: format!("Invalid request: {:#}", e),
            }
        }
    };

    writer.write_all(&encode_line(&response)?).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Send `request` to the daemon at `path` and wait for the answer.
///
/// Blocking, with a short timeout on each direction. Usable before a
/// runtime exists.
///
/// # Errors
///
/// Fails if nothing listens on `path`, the daemon does not answer in time,
/// or the answer is not a valid [`IpcResponse`].
pub fn call(path: &Path, request: &IpcRequest) -> Result<IpcResponse> {
    use std::io::Write;

    let mut stream = std::os::unix::net::UnixStream::connect(path)
        .with_context(|| format!("No daemon at {} (is nostromod running?)", path.display()))?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;
    stream.write_all(&encode_line(request)?)?;

    let mut line = String::new();
    std::io::BufReader::new(stream)
        .read_line(&mut line)
        .context("No answer from daemon")?;
    decode_line(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_request_wire_names() {
        for (request, json) in [
            (IpcRequest::Reload, r#"{"type":"reload"}"#),
            (IpcRequest::Rescan, r#"{"type":"rescan"}"#),
            (IpcRequest::Quit, r#"{"type":"quit"}"#),
            (IpcRequest::Status, r#"{"type":"status"}"#),
        ] {
            assert_eq!(serde_json::to_string(&request).unwrap(), json);
        }
    }

    #[test]
    fn test_encode_line_is_newline_terminated() {
        let line = encode_line(&IpcResponse::Success { message: None }).unwrap();
        assert_eq!(line, b"{\"type\":\"success\"}\n");
    }

    #[test]
    fn test_status_uses_remote_field() {
        let status = DaemonStatus {
            mode: Mode::Blue,
            previous_mode: Some(Mode::Normal),
            remote_connected: true,
            pending_actions: 2,
            config: "Default".to_string(),
            model: "n52".to_string(),
            devices: vec![DeviceStatus {
                name: "Belkin Nostromo N52".to_string(),
                path: PathBuf::from("/dev/input/event7"),
                model: "n52".to_string(),
                leds: true,
            }],
        };
        let json = serde_json::to_string(&IpcResponse::Status(status.clone())).unwrap();
        assert!(json.contains(r#""mode":"blue""#));
        assert!(json.contains(r#""remote":true"#));
        assert!(!json.contains("remote_connected"));

        let parsed: IpcResponse = decode_line(&json).unwrap();
        assert_eq!(parsed, IpcResponse::Status(status));
    }

    #[tokio::test]
    async fn test_socket_file_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SOCKET_NAME);

        let socket = ControlSocket::bind(path.clone()).unwrap();
        assert_eq!(socket.path(), path.as_path());
        assert!(path.exists());

        drop(socket);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_dead_socket_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        std::fs::write(&path, "left over").unwrap();

        let _socket = ControlSocket::bind(path.clone()).unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_live_socket_is_not_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SOCKET_NAME);

        let _first = ControlSocket::bind(path.clone()).unwrap();
        assert!(ControlSocket::bind(path.clone()).is_err());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_call_gets_handler_answer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        let socket = ControlSocket::bind(path.clone()).unwrap();

        let server = tokio::spawn(async move {
            let stream = socket.accept().await.unwrap();
            serve_connection(stream, |request| match request {
                IpcRequest::Rescan => IpcResponse::Success {
                    message: Some("Rescan requested".to_string()),
                },
                _ => IpcResponse::Error {
                    message: "Unexpected request".to_string(),
                },
            })
            .await
            .unwrap();
        });

        let response = tokio::task::spawn_blocking(move || call(&path, &IpcRequest::Rescan))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            response,
            IpcResponse::Success {
                message: Some("Rescan requested".to_string())
            }
        );

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_request_type_gets_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        let socket = ControlSocket::bind(path.clone()).unwrap();

        let server = tokio::spawn(async move {
            let stream = socket.accept().await.unwrap();
            serve_connection(stream, |_| IpcResponse::Success { message: None })
                .await
                .unwrap();
        });

        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(b"{\"type\":\"dance\"}\n").await.unwrap();
        let line = read_line(&mut BufReader::new(client)).await.unwrap().unwrap();

        match decode_line::<IpcResponse>(&line).unwrap() {
            IpcResponse::Error { message } => assert!(message.contains("Invalid request")),
            other => panic!("Expected error, got {:?}", other),
        }

        server.await.unwrap();
    }

    #[test]
    fn test_call_without_daemon_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        assert!(call(&path, &IpcRequest::Status).is_err());
    }
}
