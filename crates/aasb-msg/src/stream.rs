//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Binary stream registry and in-process byte pipes."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
//! Binary streams that travel beside the envelope channel.
//!
//! A stream is addressed by the id carried in an envelope payload. Data moves
//! through a transport-provided [`ByteChannel`]; the registry only enforces
//! one holder per direction and exactly-once release.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aasb_logging::{aasb_debug, log_lifecycle_event, LifecycleOutcome, LogContext};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::transport::{Transport, TransportError};

/// Directions a stream handle is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Consume bytes produced by the peer.
    Read,
    /// Produce bytes for the peer.
    Write,
    /// Both directions.
    ReadWrite,
}

impl StreamMode {
    /// Whether the mode permits reading.
    pub fn can_read(self) -> bool {
        matches!(self, StreamMode::Read | StreamMode::ReadWrite)
    }

    /// Whether the mode permits writing.
    pub fn can_write(self) -> bool {
        matches!(self, StreamMode::Write | StreamMode::ReadWrite)
    }

    /// Wire name of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamMode::Read => "read",
            StreamMode::Write => "write",
            StreamMode::ReadWrite => "read_write",
        }
    }
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream level failures.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Stream ids must be non-empty.
    #[error("stream id must not be empty")]
    InvalidId,
    /// Another local handle already holds this direction of the stream.
    #[error("stream {stream_id} is already open for {direction}")]
    AlreadyOpen {
        /// Stream identifier.
        stream_id: String,
        /// Direction already held.
        direction: &'static str,
    },
    /// The handle has been closed.
    #[error("stream {0} is closed")]
    Closed(String),
    /// The handle was not opened for this operation.
    #[error("stream {stream_id} opened as {mode} does not permit {operation}")]
    ModeMismatch {
        /// Stream identifier.
        stream_id: String,
        /// Mode the handle was opened with.
        mode: StreamMode,
        /// Rejected operation.
        operation: &'static str,
    },
    /// The transport could not provide a channel.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The underlying channel failed.
    #[error("stream i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Raw byte channel provided by a transport for one stream.
///
/// `read` returns `Ok(0)` once the producer has closed and every buffered
/// byte has been consumed.
pub trait ByteChannel: Send + Sync {
    /// Read up to `buf.len()` bytes, blocking until data, EOF or failure.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Write `buf`, returning the number of bytes accepted.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    /// Release the channel.
    fn close(&self) -> io::Result<()>;
}

/// How long a finished pipe waits for a local reader before it is dropped.
pub const UNCLAIMED_GRACE: Duration = Duration::from_secs(10);

#[derive(Default)]
struct PipeState {
    buffer: VecDeque<u8>,
    writer_closed: Option<Instant>,
    reader_closed: bool,
    claimed: bool,
    failure: Option<(io::ErrorKind, String)>,
}

/// One-directional in-process byte buffer.
#[derive(Default)]
pub struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    /// Append bytes for the reader.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if let Some((kind, message)) = &state.failure {
            return Err(io::Error::new(*kind, message.clone()));
        }
        if state.reader_closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream reader closed"));
        }
        if state.writer_closed.is_some() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream writer closed"));
        }
        state.buffer.extend(data);
        self.readable.notify_all();
        Ok(data.len())
    }

    /// Take buffered bytes, blocking while the pipe is empty and still open.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        loop {
            if !state.buffer.is_empty() {
                let count = buf.len().min(state.buffer.len());
                for (slot, byte) in buf.iter_mut().zip(state.buffer.drain(..count)) {
                    *slot = byte;
                }
                return Ok(count);
            }
            if state.writer_closed.is_some() {
                return Ok(0);
            }
            if let Some((kind, message)) = &state.failure {
                return Err(io::Error::new(*kind, message.clone()));
            }
            self.readable.wait(&mut state);
        }
    }

    /// Signal end of data.
    pub fn close_writer(&self) {
        {
            let mut state = self.state.lock();
            if state.writer_closed.is_none() {
                state.writer_closed = Some(Instant::now());
            }
        }
        self.readable.notify_all();
    }

    /// Mark that a local reader has opened the pipe.
    pub fn claim(&self) {
        self.state.lock().claimed = true;
    }

    /// Discard unread data; later writes fail with `BrokenPipe`.
    pub fn close_reader(&self) {
        let mut state = self.state.lock();
        state.reader_closed = true;
        state.buffer.clear();
    }

    /// Fail both ends. Buffered bytes stay readable ahead of the error and a
    /// cleanly closed writer still reads as EOF.
    pub fn fail(&self, kind: io::ErrorKind, message: impl Into<String>) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some((kind, message.into()));
        }
        self.readable.notify_all();
    }

    fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.writer_closed.is_some() && state.reader_closed
    }

    // Writer finished at or before `cutoff` and no reader ever showed up.
    fn is_abandoned(&self, cutoff: Instant) -> bool {
        let state = self.state.lock();
        !state.claimed && state.writer_closed.is_some_and(|closed| closed <= cutoff)
    }
}

/// Distinguishes the two directions of a stream id inside one [`PipeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Written by the first endpoint.
    Forward,
    /// Written by the second endpoint.
    Backward,
}

/// Pipes keyed by stream id and lane, shared by the endpoints of a transport.
#[derive(Default)]
pub struct PipeTable {
    pipes: Mutex<HashMap<(String, Lane), Arc<Pipe>>>,
}

impl PipeTable {
    /// Create an empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pipe for `(stream_id, lane)`, created on first use.
    pub fn pipe(&self, stream_id: &str, lane: Lane) -> Arc<Pipe> {
        let key = (stream_id.to_owned(), lane);
        let mut pipes = self.pipes.lock();
        if !pipes.contains_key(&key) {
            Self::prune_locked(&mut pipes, Instant::now());
        }
        pipes.entry(key).or_default().clone()
    }

    /// Pipe for `(stream_id, lane)` with a local reader attached.
    pub fn claim(&self, stream_id: &str, lane: Lane) -> Arc<Pipe> {
        let pipe = self.pipe(stream_id, lane);
        pipe.claim();
        pipe
    }

    /// Existing pipe for `(stream_id, lane)`.
    pub fn get(&self, stream_id: &str, lane: Lane) -> Option<Arc<Pipe>> {
        self.pipes.lock().get(&(stream_id.to_owned(), lane)).cloned()
    }

    /// Forget the pipe once both of its ends have closed.
    ///
    /// A pipe whose writer closed without any local reader claiming it is
    /// kept for [`UNCLAIMED_GRACE`] and dropped by a later table operation.
    pub fn release(&self, stream_id: &str, lane: Lane) {
        let key = (stream_id.to_owned(), lane);
        let mut pipes = self.pipes.lock();
        if pipes.get(&key).is_some_and(|pipe| pipe.is_finished()) {
            pipes.remove(&key);
        }
        Self::prune_locked(&mut pipes, Instant::now());
    }

    /// Drop unclaimed pipes whose writer closed at least [`UNCLAIMED_GRACE`]
    /// before `now`. Returns how many were dropped.
    pub fn prune_unclaimed(&self, now: Instant) -> usize {
        Self::prune_locked(&mut self.pipes.lock(), now)
    }

    fn prune_locked(pipes: &mut HashMap<(String, Lane), Arc<Pipe>>, now: Instant) -> usize {
        let Some(cutoff) = now.checked_sub(UNCLAIMED_GRACE) else {
            return 0;
        };
        let before = pipes.len();
        pipes.retain(|(stream_id, _), pipe| {
            let abandoned = pipe.is_abandoned(cutoff);
            if abandoned {
                aasb_debug!(
                    context = LogContext::new().with_stream_id(stream_id),
                    "dropping stream data nobody opened"
                );
            }
            !abandoned
        });
        before - pipes.len()
    }

    /// Fail and forget every pipe.
    pub fn fail_all(&self, kind: io::ErrorKind, message: &str) -> usize {
        let drained: Vec<Arc<Pipe>> = self.pipes.lock().drain().map(|(_, pipe)| pipe).collect();
        for pipe in &drained {
            pipe.fail(kind, message);
        }
        drained.len()
    }

    /// Number of live pipes.
    pub fn len(&self) -> usize {
        self.pipes.lock().len()
    }

    /// Whether no pipe is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`ByteChannel`] over a [`PipeTable`], used by the in-process transports.
pub struct PipeChannel {
    table: Arc<PipeTable>,
    stream_id: String,
    read_lane: Option<Lane>,
    write_lane: Option<Lane>,
}

impl PipeChannel {
    /// Channel reading from `read_lane` and writing to `write_lane`.
    pub fn new(
        table: Arc<PipeTable>,
        stream_id: impl Into<String>,
        read_lane: Option<Lane>,
        write_lane: Option<Lane>,
    ) -> Self {
        let stream_id = stream_id.into();
        // Materialize both pipes so the peer sees them before any data flows.
        if let Some(lane) = read_lane {
            table.claim(&stream_id, lane);
        }
        if let Some(lane) = write_lane {
            table.pipe(&stream_id, lane);
        }
        Self {
            table,
            stream_id,
            read_lane,
            write_lane,
        }
    }

    fn lane_pipe(&self, lane: Option<Lane>, operation: &str) -> io::Result<Arc<Pipe>> {
        let lane = lane.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("channel not opened for {operation}"),
            )
        })?;
        Ok(self.table.pipe(&self.stream_id, lane))
    }
}

impl ByteChannel for PipeChannel {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.lane_pipe(self.read_lane, "read")?.read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.lane_pipe(self.write_lane, "write")?.write(buf)
    }

    fn close(&self) -> io::Result<()> {
        if let Some(lane) = self.read_lane {
            if let Some(pipe) = self.table.get(&self.stream_id, lane) {
                pipe.close_reader();
            }
            self.table.release(&self.stream_id, lane);
        }
        if let Some(lane) = self.write_lane {
            if let Some(pipe) = self.table.get(&self.stream_id, lane) {
                pipe.close_writer();
            }
            self.table.release(&self.stream_id, lane);
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Held {
    read: bool,
    write: bool,
}

/// Tracks the locally open streams and hands out [`Stream`] handles.
pub struct StreamRegistry {
    transport: Arc<dyn Transport>,
    open: Mutex<HashMap<String, Held>>,
}

impl StreamRegistry {
    /// Registry opening channels through `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Open `stream_id` in `mode`.
    ///
    /// Fails with [`StreamError::AlreadyOpen`] when another local handle
    /// already holds one of the requested directions.
    pub fn open_stream(
        self: &Arc<Self>,
        stream_id: &str,
        mode: StreamMode,
    ) -> Result<Stream, StreamError> {
        if stream_id.is_empty() {
            return Err(StreamError::InvalidId);
        }
        {
            let mut open = self.open.lock();
            let held = open.entry(stream_id.to_owned()).or_default();
            if mode.can_read() && held.read {
                return Err(StreamError::AlreadyOpen {
                    stream_id: stream_id.to_owned(),
                    direction: "read",
                });
            }
            if mode.can_write() && held.write {
                return Err(StreamError::AlreadyOpen {
                    stream_id: stream_id.to_owned(),
                    direction: "write",
                });
            }
            held.read |= mode.can_read();
            held.write |= mode.can_write();
        }

        let channel = match self.transport.open_raw_stream(stream_id, mode) {
            Ok(channel) => channel,
            Err(err) => {
                self.release(stream_id, mode);
                return Err(err.into());
            }
        };
        aasb_debug!(
            context = LogContext::new().with_stream_id(stream_id),
            "stream opened for {} via {}",
            mode,
            self.transport.name()
        );
        Ok(Stream {
            id: stream_id.to_owned(),
            mode,
            channel,
            closed: AtomicBool::new(false),
            registry: self.clone(),
        })
    }

    /// Whether any local handle holds `stream_id`.
    pub fn is_open(&self, stream_id: &str) -> bool {
        self.open.lock().contains_key(stream_id)
    }

    /// Number of stream ids with a live local handle.
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    fn release(&self, stream_id: &str, mode: StreamMode) {
        let mut open = self.open.lock();
        if let Some(held) = open.get_mut(stream_id) {
            if mode.can_read() {
                held.read = false;
            }
            if mode.can_write() {
                held.write = false;
            }
            if !held.read && !held.write {
                open.remove(stream_id);
            }
        }
    }
}

/// Handle to an open stream. Dropping it closes the stream.
pub struct Stream {
    id: String,
    mode: StreamMode,
    channel: Box<dyn ByteChannel>,
    closed: AtomicBool,
    registry: Arc<StreamRegistry>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Stream {
    /// Stream identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Mode the handle was opened with.
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Whether [`Stream::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read into `buf`. `Ok(0)` means end of stream.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.check("read", self.mode.can_read())?;
        Ok(self.channel.read(buf)?)
    }

    /// Read until end of stream.
    pub fn read_to_end(&self, out: &mut Vec<u8>) -> Result<usize, StreamError> {
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        loop {
            match self.read(&mut chunk)? {
                0 => return Ok(total),
                count => {
                    out.extend_from_slice(&chunk[..count]);
                    total += count;
                }
            }
        }
    }

    /// Write `buf`, returning the number of bytes accepted.
    pub fn write(&self, buf: &[u8]) -> Result<usize, StreamError> {
        self.check("write", self.mode.can_write())?;
        Ok(self.channel.write(buf)?)
    }

    /// Write every byte of `buf`.
    pub fn write_all(&self, mut buf: &[u8]) -> Result<(), StreamError> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => {
                    return Err(StreamError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "stream accepted no bytes",
                    )))
                }
                count => buf = &buf[count..],
            }
        }
        Ok(())
    }

    /// Release the stream. Only the first call reaches the transport.
    pub fn close(&self) -> Result<(), StreamError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.channel.close();
        self.registry.release(&self.id, self.mode);
        let ctx = LogContext::new().with_stream_id(&self.id);
        let outcome = if result.is_ok() {
            LifecycleOutcome::Success
        } else {
            LifecycleOutcome::Fault
        };
        log_lifecycle_event(Some(&ctx), "stream.close", "stream closed", outcome);
        Ok(result?)
    }

    fn check(&self, operation: &'static str, permitted: bool) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed(self.id.clone()));
        }
        if !permitted {
            return Err(StreamError::ModeMismatch {
                stream_id: self.id.clone(),
                mode: self.mode,
                operation,
            });
        }
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn pipe_reports_eof_after_buffered_data() {
        let pipe = Pipe::default();
        pipe.write(b"abc").expect("write");
        pipe.close_writer();
        let mut buf = [0u8; 2];
        assert_eq!(pipe.read(&mut buf).expect("read"), 2);
        assert_eq!(pipe.read(&mut buf).expect("read"), 1);
        assert_eq!(pipe.read(&mut buf).expect("eof"), 0);
        assert_eq!(pipe.read(&mut buf).expect("eof again"), 0);
    }

    #[test]
    fn pipe_failure_is_distinct_from_eof() {
        let pipe = Pipe::default();
        pipe.write(b"x").expect("write");
        pipe.fail(io::ErrorKind::ConnectionReset, "peer vanished");
        let mut buf = [0u8; 4];
        assert_eq!(pipe.read(&mut buf).expect("buffered byte"), 1);
        let err = pipe.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn write_after_reader_close_is_broken_pipe() {
        let pipe = Pipe::default();
        pipe.close_reader();
        assert_eq!(
            pipe.write(b"late").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }

    #[test]
    fn blocked_reader_wakes_on_write() {
        let pipe = Arc::new(Pipe::default());
        let reader = {
            let pipe = pipe.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                pipe.read(&mut buf).map(|n| buf[..n].to_vec())
            })
        };
        thread::sleep(std::time::Duration::from_millis(20));
        pipe.write(b"hi").expect("write");
        assert_eq!(reader.join().expect("join").expect("read"), b"hi".to_vec());
    }

    #[test]
    fn pipe_table_releases_finished_pipes() {
        let table = PipeTable::new();
        let pipe = table.pipe("s1", Lane::Forward);
        table.release("s1", Lane::Forward);
        assert_eq!(table.len(), 1, "open pipe must survive release");
        pipe.close_writer();
        pipe.close_reader();
        table.release("s1", Lane::Forward);
        assert!(table.is_empty());
    }

    #[test]
    fn unclaimed_pipes_are_dropped_after_the_grace() {
        let table = PipeTable::new();
        let orphan = table.pipe("tts", Lane::Forward);
        orphan.write(&[1u8; 1024]).expect("write");
        orphan.close_writer();
        table.release("tts", Lane::Forward);
        let open_writer = table.pipe("mic", Lane::Forward);
        let awaited = table.claim("audio", Lane::Forward);
        awaited.close_writer();

        assert_eq!(table.len(), 3, "data waits for a late reader");
        assert_eq!(table.prune_unclaimed(Instant::now() + UNCLAIMED_GRACE), 1);
        assert!(table.get("tts", Lane::Forward).is_none());
        assert_eq!(table.len(), 2);
        drop(open_writer);
    }

    #[test]
    fn same_direction_cannot_be_opened_twice() {
        let registry = StreamRegistry::new(Arc::new(LoopbackTransport::new()));
        let writer = registry.open_stream("s1", StreamMode::Write).expect("open");
        assert!(matches!(
            registry.open_stream("s1", StreamMode::Write),
            Err(StreamError::AlreadyOpen { direction: "write", .. })
        ));
        assert!(matches!(
            registry.open_stream("s1", StreamMode::ReadWrite),
            Err(StreamError::AlreadyOpen { .. })
        ));
        let reader = registry.open_stream("s1", StreamMode::Read).expect("reader");
        writer.close().expect("close");
        reader.close().expect("close");
        assert!(!registry.is_open("s1"));
        registry.open_stream("s1", StreamMode::Write).expect("reopen");
    }

    #[test]
    fn empty_stream_id_is_rejected() {
        let registry = StreamRegistry::new(Arc::new(LoopbackTransport::new()));
        assert!(matches!(
            registry.open_stream("", StreamMode::Read),
            Err(StreamError::InvalidId)
        ));
    }

    #[test]
    fn mode_is_enforced() {
        let registry = StreamRegistry::new(Arc::new(LoopbackTransport::new()));
        let writer = registry.open_stream("s1", StreamMode::Write).expect("open");
        let mut buf = [0u8; 4];
        assert!(matches!(
            writer.read(&mut buf),
            Err(StreamError::ModeMismatch { operation: "read", .. })
        ));
    }

    struct CountingChannel {
        closes: Arc<AtomicUsize>,
    }

    impl ByteChannel for CountingChannel {
        fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn close(&self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn double_close_releases_channel_once() {
        let registry = StreamRegistry::new(Arc::new(LoopbackTransport::new()));
        let closes = Arc::new(AtomicUsize::new(0));
        let stream = Stream {
            id: "s1".into(),
            mode: StreamMode::Write,
            channel: Box::new(CountingChannel {
                closes: closes.clone(),
            }),
            closed: AtomicBool::new(false),
            registry,
        };
        stream.close().expect("first close");
        stream.close().expect("second close");
        assert!(matches!(stream.write(b"x"), Err(StreamError::Closed(_))));
        drop(stream);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn loopback_reader_sees_bytes_then_eof() {
        let registry = StreamRegistry::new(Arc::new(LoopbackTransport::new()));
        let reader = registry.open_stream("s1", StreamMode::Read).expect("reader");
        let writer = registry.open_stream("s1", StreamMode::Write).expect("writer");
        let consumer = thread::spawn(move || {
            let mut received = Vec::new();
            reader.read_to_end(&mut received).map(|_| received)
        });
        writer.write_all(&[7u8; 320]).expect("write");
        writer.close().expect("close");
        let received = consumer.join().expect("join").expect("read");
        assert_eq!(received.len(), 320);
    }
}
