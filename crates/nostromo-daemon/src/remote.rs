//! Remote forwarding link and wire codec
//!
//! The daemon accepts at most one peer. Actions from mappings marked
//! `remote` are written to it as fixed 12-byte frames: three little-endian
//! `i32` values `(stroke_kind, code, press_or_flag)` with no header. There
//! is no way to resynchronize a stream once a frame is split, so a short
//! read ends the connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use nostromo_config::StrokeKind;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::injector::Injector;

pub const FRAME_LEN: usize = 12;

// ============================================================================
// Wire codec
// ============================================================================

/// One forwarded action as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub kind: i32,
    pub code: i32,
    pub flag: i32,
}

impl Frame {
    pub fn new(kind: StrokeKind, code: u16, pressed: bool) -> Self {
        Self {
            kind: kind.wire_tag(),
            code: i32::from(code),
            flag: i32::from(pressed),
        }
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..4].copy_from_slice(&self.kind.to_le_bytes());
        buf[4..8].copy_from_slice(&self.code.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flag.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FRAME_LEN]) -> Self {
        let word = |i: usize| i32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            kind: word(0),
            code: word(4),
            flag: word(8),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream ended {got} byte(s) into a 12-byte frame")]
    Desync { got: usize },

    #[error("unknown stroke kind {0}")]
    UnknownKind(i32),

    #[error("key code {0} out of range")]
    BadCode(i32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
///
/// # Errors
///
/// [`FrameError::Desync`] if the stream ends part-way through a frame,
/// [`FrameError::Io`] for any other read failure.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; FRAME_LEN];
    let mut filled = 0;

    while filled < FRAME_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Desync { got: filled });
        }
        filled += n;
    }

    Ok(Some(Frame::decode(&buf)))
}

/// Replay frames from `reader` through `injector` until the stream ends.
///
/// Returns the number of frames replayed on a clean end of stream.
/// Injection failures are logged and skipped.
///
/// # Errors
///
/// Any error from [`read_frame`], or [`FrameError::UnknownKind`] /
/// [`FrameError::BadCode`] for a frame that names no valid stroke. The
/// caller should drop the connection.
pub async fn replay_frames<R>(reader: &mut R, injector: &dyn Injector) -> Result<u64, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut count = 0;

    while let Some(frame) = read_frame(reader).await? {
        let kind = StrokeKind::from_wire_tag(frame.kind).ok_or(FrameError::UnknownKind(frame.kind))?;
        let code = u16::try_from(frame.code).map_err(|_| FrameError::BadCode(frame.code))?;

        if let Err(e) = injector.inject(kind, code, frame.flag != 0) {
            tracing::warn!("Failed to replay {:?} {}: {:#}", kind, code, e);
        }
        count += 1;
    }

    Ok(count)
}

// ============================================================================
// Link
// ============================================================================

type PeerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The single outbound peer connection.
///
/// `Disconnected` until [`attach`](Self::attach); back to `Disconnected` on
/// [`detach`](Self::detach) or the first failed [`send`](Self::send).
pub struct RemoteLink {
    peer: Mutex<Option<(u64, PeerWriter)>>,
    connected: AtomicBool,
    generation: AtomicU64,
}

impl Default for RemoteLink {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteLink {
    pub fn new() -> Self {
        Self {
            peer: Mutex::new(None),
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Adopt `writer` as the peer, replacing any existing one.
    ///
    /// Returns a generation number for [`detach_if`](Self::detach_if).
    pub async fn attach<W>(&self, writer: W) -> u64
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut peer = self.peer.lock().await;
        if peer.is_some() {
            tracing::info!("Replacing existing remote peer");
        }
        *peer = Some((generation, Box::new(writer)));
        self.connected.store(true, Ordering::Release);
        tracing::info!("Remote peer attached (generation {})", generation);
        generation
    }

    /// Drop the peer, if any.
    pub async fn detach(&self) {
        let mut peer = self.peer.lock().await;
        if peer.take().is_some() {
            tracing::info!("Remote peer detached");
        }
        self.connected.store(false, Ordering::Release);
    }

    /// Drop the peer only if it is still the one from `generation`.
    pub async fn detach_if(&self, generation: u64) -> bool {
        let mut peer = self.peer.lock().await;
        match peer.as_ref() {
            Some((current, _)) if *current == generation => {
                *peer = None;
                self.connected.store(false, Ordering::Release);
                tracing::info!("Remote peer lost (generation {})", generation);
                true
            }
            _ => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Forward one action to the peer.
    ///
    /// # Errors
    ///
    /// Returns `false` if no peer is attached or the write failed. After a
    /// failed write the link is detached and the caller injects locally.
    pub async fn send(&self, kind: StrokeKind, code: u16, pressed: bool) -> bool {
        let mut peer = self.peer.lock().await;
        let Some((generation, writer)) = peer.as_mut() else {
            return false;
        };

        let frame = Frame::new(kind, code, pressed).encode();
        let result = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Lost remote connection (generation {}): {}", generation, e);
                *peer = None;
                self.connected.store(false, Ordering::Release);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::duplex;

    /// Records every injected action.
    #[derive(Default)]
    pub(crate) struct RecordingInjector {
        pub events: StdMutex<Vec<(StrokeKind, u16, bool)>>,
    }

    impl Injector for RecordingInjector {
        fn inject(&self, kind: StrokeKind, code: u16, pressed: bool) -> anyhow::Result<()> {
            self.events.lock().unwrap().push((kind, code, pressed));
            Ok(())
        }
    }

    #[test]
    fn test_frame_layout_is_three_le_i32() {
        let bytes = Frame::new(StrokeKind::Mouse, 0x0102, true).encode();
        assert_eq!(bytes, [1, 0, 0, 0, 0x02, 0x01, 0, 0, 1, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_send_then_read_frames() {
        let (client, mut server) = duplex(64);
        let link = RemoteLink::new();
        assert!(!link.is_connected());
        assert!(!link.send(StrokeKind::Key, 30, true).await);

        link.attach(client).await;
        assert!(link.is_connected());
        assert!(link.send(StrokeKind::Key, 30, true).await);
        assert!(link.send(StrokeKind::Key, 30, false).await);

        assert_eq!(
            read_frame(&mut server).await.unwrap(),
            Some(Frame { kind: 0, code: 30, flag: 1 })
        );
        assert_eq!(
            read_frame(&mut server).await.unwrap(),
            Some(Frame { kind: 0, code: 30, flag: 0 })
        );
    }

    #[tokio::test]
    async fn test_send_failure_disconnects() {
        let (client, server) = duplex(64);
        let link = RemoteLink::new();
        link.attach(client).await;

        drop(server);
        assert!(!link.send(StrokeKind::Key, 30, true).await);
        assert!(!link.is_connected());
        // Stays down until a new attach
        assert!(!link.send(StrokeKind::Key, 30, false).await);
    }

    #[tokio::test]
    async fn test_detach_if_ignores_stale_generation() {
        let link = RemoteLink::new();
        let (first, _keep_first) = duplex(64);
        let (second, _keep_second) = duplex(64);

        let old = link.attach(first).await;
        let new = link.attach(second).await;
        assert_ne!(old, new);

        assert!(!link.detach_if(old).await);
        assert!(link.is_connected());
        assert!(link.detach_if(new).await);
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_clean_eof_on_boundary() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&Frame::new(StrokeKind::Key, 1, true).encode()).await.unwrap();
        drop(client);

        assert!(read_frame(&mut server).await.unwrap().is_some());
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_read_is_desync() {
        let (mut client, mut server) = duplex(64);
        let frame = Frame::new(StrokeKind::Key, 1, true).encode();
        client.write_all(&frame[..7]).await.unwrap();
        drop(client);

        match read_frame(&mut server).await {
            Err(FrameError::Desync { got }) => assert_eq!(got, 7),
            other => panic!("Expected desync, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replay_frames_through_injector() {
        let (mut client, mut server) = duplex(256);
        for frame in [
            Frame::new(StrokeKind::Key, 42, true),
            Frame::new(StrokeKind::Key, 30, true),
            Frame::new(StrokeKind::Key, 30, false),
            Frame::new(StrokeKind::Mouse, 1, true),
        ] {
            client.write_all(&frame.encode()).await.unwrap();
        }
        drop(client);

        let injector = RecordingInjector::default();
        let count = replay_frames(&mut server, &injector).await.unwrap();
        assert_eq!(count, 4);
        assert_eq!(
            *injector.events.lock().unwrap(),
            vec![
                (StrokeKind::Key, 42, true),
                (StrokeKind::Key, 30, true),
                (StrokeKind::Key, 30, false),
                (StrokeKind::Mouse, 1, true),
            ]
        );
    }

    #[tokio::test]
    async fn test_replay_rejects_unknown_kind() {
        let (mut client, mut server) = duplex(64);
        let bad = Frame {
            kind: 7,
            code: 1,
            flag: 1,
        };
        client.write_all(&bad.encode()).await.unwrap();
        drop(client);

        let injector = RecordingInjector::default();
        assert!(matches!(
            replay_frames(&mut server, &injector).await,
            Err(FrameError::UnknownKind(7))
        ));
    }
}
