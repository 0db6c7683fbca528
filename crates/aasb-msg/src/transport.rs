//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Transport boundary and in-process transports."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::stream::{ByteChannel, Lane, PipeChannel, PipeTable, StreamMode};

/// Failures reported by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer is gone or the transport was shut down.
    #[error("transport disconnected")]
    Disconnected,
    /// A frame exceeded the configured size limit.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Size of the rejected frame body.
        len: usize,
        /// Configured limit.
        max: usize,
    },
    /// Underlying I/O failure.
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Inbound side of the transport boundary, implemented by the dispatcher.
///
/// Callbacks arrive on a transport-owned thread, one at a time, in wire order.
pub trait FrameReceiver: Send + Sync {
    /// A complete envelope arrived.
    fn on_receive(&self, bytes: &[u8]);
    /// The peer went away. No further frames follow.
    fn on_disconnect(&self) {}
}

/// Byte-oriented channel between the two broker endpoints.
pub trait Transport: Send + Sync {
    /// Send one encoded envelope.
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;
    /// Install the callback target for inbound envelopes.
    fn set_receiver(&self, receiver: Weak<dyn FrameReceiver>) -> Result<(), TransportError>;
    /// Open the raw byte channel backing `stream_id`.
    fn open_raw_stream(
        &self,
        stream_id: &str,
        mode: StreamMode,
    ) -> Result<Box<dyn ByteChannel>, TransportError>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
    /// Tear the link down. Idempotent.
    fn disconnect(&self) {}
}

/// Transport kinds selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Length-prefixed frames over a Unix domain socket.
    UnixSocket,
    /// In-process channel pair, for tests and single-process wiring.
    InMemory,
}

/// Transport section of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Which transport to build.
    #[serde(default = "TransportConfig::default_kind")]
    pub kind: TransportKind,
    /// Socket path for [`TransportKind::UnixSocket`].
    #[serde(default = "TransportConfig::default_socket_path")]
    pub socket_path: PathBuf,
    /// Largest accepted frame body.
    #[serde(default = "TransportConfig::default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl TransportConfig {
    const fn default_kind() -> TransportKind {
        TransportKind::UnixSocket
    }

    fn default_socket_path() -> PathBuf {
        PathBuf::from("/tmp/aasb.sock")
    }

    const fn default_max_frame_bytes() -> usize {
        4 * 1024 * 1024
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: Self::default_kind(),
            socket_path: Self::default_socket_path(),
            max_frame_bytes: Self::default_max_frame_bytes(),
        }
    }
}

type ReceiverSlot = Arc<Mutex<Option<Weak<dyn FrameReceiver>>>>;

enum Delivery {
    Frame(Vec<u8>),
    Hangup,
}

struct Link {
    connected: AtomicBool,
    pipes: Arc<PipeTable>,
}

/// One endpoint of an in-process transport pair.
///
/// Each endpoint delivers inbound envelopes on its own thread, so the
/// dispatcher sees the same threading as with a real IPC link.
pub struct InMemoryTransport {
    lane: Lane,
    link: Arc<Link>,
    outbound: Mutex<Option<Sender<Delivery>>>,
    hangup: Mutex<Option<Sender<Delivery>>>,
    inbound: Mutex<Option<Receiver<Delivery>>>,
    receiver: ReceiverSlot,
}

impl InMemoryTransport {
    /// Create two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let link = Arc::new(Link {
            connected: AtomicBool::new(true),
            pipes: PipeTable::new(),
        });
        let (to_left, left_inbound) = mpsc::channel();
        let (to_right, right_inbound) = mpsc::channel();
        let left = Self {
            lane: Lane::Forward,
            link: link.clone(),
            outbound: Mutex::new(Some(to_right.clone())),
            hangup: Mutex::new(Some(to_left.clone())),
            inbound: Mutex::new(Some(left_inbound)),
            receiver: Arc::new(Mutex::new(None)),
        };
        let right = Self {
            lane: Lane::Backward,
            link,
            outbound: Mutex::new(Some(to_left)),
            hangup: Mutex::new(Some(to_right)),
            inbound: Mutex::new(Some(right_inbound)),
            receiver: Arc::new(Mutex::new(None)),
        };
        (left, right)
    }

    /// Whether the pair is still linked.
    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::Acquire)
    }

    fn peer_lane(&self) -> Lane {
        match self.lane {
            Lane::Forward => Lane::Backward,
            Lane::Backward => Lane::Forward,
        }
    }

    fn spawn_delivery(inbound: Receiver<Delivery>, slot: ReceiverSlot) -> io::Result<()> {
        thread::Builder::new()
            .name("aasb-inmem-rx".into())
            .spawn(move || {
                for delivery in inbound.iter() {
                    let target = slot.lock().as_ref().and_then(Weak::upgrade);
                    match delivery {
                        Delivery::Frame(bytes) => match target {
                            Some(receiver) => receiver.on_receive(&bytes),
                            None => tracing::warn!(
                                transport = "in_memory",
                                "frame dropped: receiver gone"
                            ),
                        },
                        Delivery::Hangup => {
                            if let Some(receiver) = target {
                                receiver.on_disconnect();
                            }
                            break;
                        }
                    }
                }
            })
            .map(|_| ())
    }
}

impl Transport for InMemoryTransport {
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let outbound = self.outbound.lock();
        let sender = outbound.as_ref().ok_or(TransportError::Disconnected)?;
        sender
            .send(Delivery::Frame(bytes.to_vec()))
            .map_err(|_| TransportError::Disconnected)
    }

    fn set_receiver(&self, receiver: Weak<dyn FrameReceiver>) -> Result<(), TransportError> {
        *self.receiver.lock() = Some(receiver);
        if let Some(inbound) = self.inbound.lock().take() {
            Self::spawn_delivery(inbound, self.receiver.clone())?;
        }
        Ok(())
    }

    fn open_raw_stream(
        &self,
        stream_id: &str,
        mode: StreamMode,
    ) -> Result<Box<dyn ByteChannel>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let read_lane = mode.can_read().then(|| self.peer_lane());
        let write_lane = mode.can_write().then_some(self.lane);
        Ok(Box::new(PipeChannel::new(
            self.link.pipes.clone(),
            stream_id,
            read_lane,
            write_lane,
        )))
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }

    fn disconnect(&self) {
        if !self.link.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        for sender in [self.outbound.lock().take(), self.hangup.lock().take()]
            .into_iter()
            .flatten()
        {
            let _ = sender.send(Delivery::Hangup);
        }
        self.link
            .pipes
            .fail_all(io::ErrorKind::ConnectionReset, "transport disconnected");
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Single-endpoint transport that records outbound frames.
///
/// Inbound frames are injected by the caller and delivered synchronously on
/// the injecting thread. Streams loop back onto themselves.
#[derive(Default)]
pub struct LoopbackTransport {
    sent: Mutex<VecDeque<Vec<u8>>>,
    receiver: Mutex<Option<Weak<dyn FrameReceiver>>>,
    disconnected: AtomicBool,
    pipes: Arc<PipeTable>,
}

impl LoopbackTransport {
    /// Create an empty loopback transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the oldest recorded outbound frame.
    pub fn recv(&self) -> Option<Vec<u8>> {
        self.sent.lock().pop_front()
    }

    /// Drain every recorded outbound frame.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().drain(..).collect()
    }

    /// Number of recorded outbound frames.
    pub fn sent_len(&self) -> usize {
        self.sent.lock().len()
    }

    /// Deliver `bytes` to the receiver as if they arrived from the peer.
    ///
    /// Returns `false` when no receiver is installed.
    pub fn inject(&self, bytes: &[u8]) -> bool {
        let target = self.receiver.lock().as_ref().and_then(Weak::upgrade);
        match target {
            Some(receiver) => {
                receiver.on_receive(bytes);
                true
            }
            None => false,
        }
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        self.sent.lock().push_back(bytes.to_vec());
        Ok(())
    }

    fn set_receiver(&self, receiver: Weak<dyn FrameReceiver>) -> Result<(), TransportError> {
        *self.receiver.lock() = Some(receiver);
        Ok(())
    }

    fn open_raw_stream(
        &self,
        stream_id: &str,
        mode: StreamMode,
    ) -> Result<Box<dyn ByteChannel>, TransportError> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        Ok(Box::new(PipeChannel::new(
            self.pipes.clone(),
            stream_id,
            mode.can_read().then_some(Lane::Forward),
            mode.can_write().then_some(Lane::Forward),
        )))
    }

    fn name(&self) -> &'static str {
        "loopback"
    }

    fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pipes
            .fail_all(io::ErrorKind::ConnectionReset, "transport disconnected");
        let target = self.receiver.lock().as_ref().and_then(Weak::upgrade);
        if let Some(receiver) = target {
            receiver.on_disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Collector {
        frames: Mutex<Vec<Vec<u8>>>,
        disconnects: Mutex<usize>,
        arrived: parking_lot::Condvar,
    }

    impl Collector {
        fn wait_for(&self, count: usize) -> Vec<Vec<u8>> {
            let mut frames = self.frames.lock();
            while frames.len() < count {
                let timed_out = self
                    .arrived
                    .wait_for(&mut frames, Duration::from_secs(2))
                    .timed_out();
                assert!(!timed_out, "frames did not arrive");
            }
            frames.clone()
        }
    }

    impl FrameReceiver for Collector {
        fn on_receive(&self, bytes: &[u8]) {
            self.frames.lock().push(bytes.to_vec());
            self.arrived.notify_all();
        }

        fn on_disconnect(&self) {
            *self.disconnects.lock() += 1;
            self.arrived.notify_all();
        }
    }

    fn attach(transport: &dyn Transport) -> Arc<Collector> {
        let collector = Arc::new(Collector::default());
        let weak: Weak<dyn FrameReceiver> = Arc::downgrade(&collector) as Weak<dyn FrameReceiver>;
        transport.set_receiver(weak).expect("receiver installed");
        collector
    }

    #[test]
    fn pair_delivers_frames_in_order() {
        let (left, right) = InMemoryTransport::pair();
        let collector = attach(&right);
        for i in 0..50u8 {
            left.send(&[i]).expect("send");
        }
        let frames = collector.wait_for(50);
        let order: Vec<u8> = frames.iter().map(|frame| frame[0]).collect();
        assert_eq!(order, (0..50u8).collect::<Vec<_>>());
    }

    #[test]
    fn frames_sent_before_receiver_are_kept() {
        let (left, right) = InMemoryTransport::pair();
        left.send(b"early").expect("send");
        let collector = attach(&right);
        assert_eq!(collector.wait_for(1), vec![b"early".to_vec()]);
    }

    #[test]
    fn disconnect_notifies_both_sides_and_fails_sends() {
        let (left, right) = InMemoryTransport::pair();
        let left_rx = attach(&left);
        let right_rx = attach(&right);
        left.disconnect();
        assert!(matches!(left.send(b"x"), Err(TransportError::Disconnected)));
        assert!(matches!(right.send(b"x"), Err(TransportError::Disconnected)));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while (*left_rx.disconnects.lock() == 0 || *right_rx.disconnects.lock() == 0)
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*left_rx.disconnects.lock(), 1);
        assert_eq!(*right_rx.disconnects.lock(), 1);
    }

    #[test]
    fn pair_streams_cross_between_endpoints() {
        let (left, right) = InMemoryTransport::pair();
        let writer = left.open_raw_stream("s1", StreamMode::Write).expect("writer");
        let reader = right.open_raw_stream("s1", StreamMode::Read).expect("reader");
        writer.write(b"audio").expect("write");
        writer.close().expect("close");
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).expect("read"), 5);
        assert_eq!(&buf[..5], b"audio");
        assert_eq!(reader.read(&mut buf).expect("eof"), 0);
    }

    #[test]
    fn pair_forgets_streams_the_peer_never_opens() {
        let (left, _right) = InMemoryTransport::pair();
        for n in 0..10 {
            let writer = left
                .open_raw_stream(&format!("tts-{n}"), StreamMode::Write)
                .expect("writer");
            writer.write(&[0u8; 1024]).expect("write");
            writer.close().expect("close");
        }
        assert_eq!(left.link.pipes.len(), 10);
        let later = std::time::Instant::now() + crate::stream::UNCLAIMED_GRACE;
        assert_eq!(left.link.pipes.prune_unclaimed(later), 10);
        assert!(left.link.pipes.is_empty());
    }

    #[test]
    fn loopback_records_and_injects() {
        let transport = LoopbackTransport::new();
        assert!(!transport.inject(b"nobody listening"));
        let collector = attach(&transport);
        transport.send(b"one").expect("send");
        transport.send(b"two").expect("send");
        assert_eq!(transport.recv(), Some(b"one".to_vec()));
        assert_eq!(transport.take_sent(), vec![b"two".to_vec()]);
        assert!(transport.inject(b"in"));
        assert_eq!(collector.wait_for(1), vec![b"in".to_vec()]);
        transport.disconnect();
        assert!(matches!(transport.send(b"x"), Err(TransportError::Disconnected)));
        assert_eq!(*collector.disconnects.lock(), 1);
    }

    #[test]
    fn transport_config_defaults() {
        let config: TransportConfig = toml_like_default();
        assert_eq!(config.kind, TransportKind::UnixSocket);
        assert_eq!(config.max_frame_bytes, 4 * 1024 * 1024);
    }

    fn toml_like_default() -> TransportConfig {
        serde_json::from_str(r#"{}"#).expect("defaults apply")
    }
}
