//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Unix domain socket transport and frame codec."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
//! Cross-process transport over a Unix domain socket.
//!
//! Every frame is `[magic "AB"][kind u8][len u32 LE][body]`. Envelopes and
//! stream bytes share the socket; stream frames prefix their body with
//! `[id_len u16 LE][stream id]`.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;

use crate::stream::{ByteChannel, Lane, PipeTable, StreamMode};
use crate::transport::{FrameReceiver, Transport, TransportError};

/// Frame synchronization marker.
pub const FRAME_MAGIC: [u8; 2] = *b"AB";
/// Bytes preceding every frame body.
pub const FRAME_HEADER_LEN: usize = 7;

/// What a frame body carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// One encoded envelope.
    Message = 1,
    /// A chunk of stream bytes.
    StreamData = 2,
    /// The writer closed the stream.
    StreamClose = 3,
}

impl FrameKind {
    fn from_byte(byte: u8) -> io::Result<Self> {
        match byte {
            1 => Ok(FrameKind::Message),
            2 => Ok(FrameKind::StreamData),
            3 => Ok(FrameKind::StreamClose),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame kind {other}"),
            )),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Body kind.
    pub kind: FrameKind,
    /// Raw body.
    pub body: Vec<u8>,
}

/// Serialize a frame, rejecting bodies above `max_body`.
pub fn encode_frame(kind: FrameKind, body: &[u8], max_body: usize) -> Result<Vec<u8>, TransportError> {
    if body.len() > max_body || u32::try_from(body.len()).is_err() {
        return Err(TransportError::FrameTooLarge {
            len: body.len(),
            max: max_body,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.push(kind as u8);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Read one frame. `Ok(None)` is a clean EOF on a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R, max_body: usize) -> io::Result<Option<Frame>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a frame header",
                ))
            }
            Ok(count) => filled += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    if header[..2] != FRAME_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad frame magic"));
    }
    let kind = FrameKind::from_byte(header[2])?;
    let len = u32::from_le_bytes([header[3], header[4], header[5], header[6]]) as usize;
    if len > max_body {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {max_body} byte limit"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(Frame { kind, body }))
}

fn stream_body(stream_id: &str, data: &[u8]) -> Result<Vec<u8>, TransportError> {
    let id_len = u16::try_from(stream_id.len()).map_err(|_| {
        TransportError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "stream id longer than 65535 bytes",
        ))
    })?;
    let mut body = Vec::with_capacity(2 + stream_id.len() + data.len());
    body.extend_from_slice(&id_len.to_le_bytes());
    body.extend_from_slice(stream_id.as_bytes());
    body.extend_from_slice(data);
    Ok(body)
}

fn split_stream_body(body: &[u8]) -> io::Result<(&str, &[u8])> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "truncated stream frame");
    if body.len() < 2 {
        return Err(invalid());
    }
    let id_len = u16::from_le_bytes([body[0], body[1]]) as usize;
    let rest = &body[2..];
    if rest.len() < id_len {
        return Err(invalid());
    }
    let (id, data) = rest.split_at(id_len);
    let id = std::str::from_utf8(id)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "stream id is not utf-8"))?;
    Ok((id, data))
}

struct IpcLink {
    writer: Mutex<UnixStream>,
    max_frame_bytes: usize,
    connected: AtomicBool,
}

impl IpcLink {
    fn send_frame(&self, kind: FrameKind, body: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        let frame = encode_frame(kind, body, self.max_frame_bytes)?;
        let mut writer = self.writer.lock();
        writer.write_all(&frame).and_then(|_| writer.flush()).map_err(|err| {
            self.connected.store(false, Ordering::Release);
            TransportError::Io(err)
        })
    }
}

/// [`Transport`] over a connected Unix domain socket.
pub struct IpcTransport {
    link: Arc<IpcLink>,
    inbound_pipes: Arc<PipeTable>,
    reader: Mutex<Option<UnixStream>>,
    receiver: Arc<Mutex<Option<Weak<dyn FrameReceiver>>>>,
}

impl IpcTransport {
    /// Wrap an already connected socket.
    pub fn from_stream(stream: UnixStream, max_frame_bytes: usize) -> io::Result<Self> {
        let reader = stream.try_clone()?;
        Ok(Self {
            link: Arc::new(IpcLink {
                writer: Mutex::new(stream),
                max_frame_bytes,
                connected: AtomicBool::new(true),
            }),
            inbound_pipes: PipeTable::new(),
            reader: Mutex::new(Some(reader)),
            receiver: Arc::new(Mutex::new(None)),
        })
    }

    /// Connect to a listening broker at `path`.
    pub fn connect(path: impl AsRef<Path>, max_frame_bytes: usize) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        Self::from_stream(stream, max_frame_bytes)
    }

    /// Whether the socket is still usable.
    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::Acquire)
    }

    fn spawn_reader(&self, mut socket: UnixStream) -> io::Result<()> {
        let link = self.link.clone();
        let pipes = self.inbound_pipes.clone();
        let slot = self.receiver.clone();
        thread::Builder::new()
            .name("aasb-ipc-rx".into())
            .spawn(move || {
                let target = || slot.lock().as_ref().and_then(Weak::upgrade);
                loop {
                    let frame = match read_frame(&mut socket, link.max_frame_bytes) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(err) => {
                            if link.connected.load(Ordering::Acquire) {
                                tracing::warn!(transport = "unix_socket", error = %err, "ipc read failed");
                            }
                            break;
                        }
                    };
                    if let Err(err) = route_frame(&frame, &pipes, target().as_deref()) {
                        tracing::warn!(transport = "unix_socket", error = %err, "ipc frame discarded");
                    }
                }
                link.connected.store(false, Ordering::Release);
                pipes.fail_all(io::ErrorKind::ConnectionReset, "ipc peer disconnected");
                if let Some(receiver) = target() {
                    receiver.on_disconnect();
                }
            })
            .map(|_| ())
    }
}

fn route_frame(
    frame: &Frame,
    pipes: &PipeTable,
    receiver: Option<&dyn FrameReceiver>,
) -> io::Result<()> {
    match frame.kind {
        FrameKind::Message => {
            if let Some(receiver) = receiver {
                receiver.on_receive(&frame.body);
            }
        }
        FrameKind::StreamData => {
            let (stream_id, data) = split_stream_body(&frame.body)?;
            pipes.pipe(stream_id, Lane::Forward).write(data)?;
        }
        FrameKind::StreamClose => {
            let (stream_id, _) = split_stream_body(&frame.body)?;
            pipes.pipe(stream_id, Lane::Forward).close_writer();
            pipes.release(stream_id, Lane::Forward);
        }
    }
    Ok(())
}

impl Transport for IpcTransport {
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.link.send_frame(FrameKind::Message, bytes)
    }

    fn set_receiver(&self, receiver: Weak<dyn FrameReceiver>) -> Result<(), TransportError> {
        *self.receiver.lock() = Some(receiver);
        if let Some(socket) = self.reader.lock().take() {
            self.spawn_reader(socket)?;
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
        if mode.can_read() {
            self.inbound_pipes.claim(stream_id, Lane::Forward);
        }
        Ok(Box::new(IpcChannel {
            stream_id: stream_id.to_owned(),
            link: self.link.clone(),
            pipes: self.inbound_pipes.clone(),
            mode,
        }))
    }

    fn name(&self) -> &'static str {
        "unix_socket"
    }

    fn disconnect(&self) {
        if !self.link.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        // Unblocks the reader thread, which then reports the disconnect.
        let _ = self.link.writer.lock().shutdown(Shutdown::Both);
    }
}

impl Drop for IpcTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct IpcChannel {
    stream_id: String,
    link: Arc<IpcLink>,
    pipes: Arc<PipeTable>,
    mode: StreamMode,
}

impl IpcChannel {
    fn chunk_limit(&self) -> usize {
        self.link
            .max_frame_bytes
            .saturating_sub(2 + self.stream_id.len())
            .max(1)
    }
}

fn to_io(err: TransportError) -> io::Error {
    match err {
        TransportError::Io(err) => err,
        TransportError::Disconnected => {
            io::Error::new(io::ErrorKind::NotConnected, "transport disconnected")
        }
        other => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
    }
}

impl ByteChannel for IpcChannel {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.pipes.pipe(&self.stream_id, Lane::Forward).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let chunk = &buf[..buf.len().min(self.chunk_limit())];
        let body = stream_body(&self.stream_id, chunk).map_err(to_io)?;
        self.link
            .send_frame(FrameKind::StreamData, &body)
            .map_err(to_io)?;
        Ok(chunk.len())
    }

    fn close(&self) -> io::Result<()> {
        if self.mode.can_read() {
            if let Some(pipe) = self.pipes.get(&self.stream_id, Lane::Forward) {
                pipe.close_reader();
            }
            self.pipes.release(&self.stream_id, Lane::Forward);
        }
        if self.mode.can_write() {
            let body = stream_body(&self.stream_id, &[]).map_err(to_io)?;
            match self.link.send_frame(FrameKind::StreamClose, &body) {
                Ok(()) | Err(TransportError::Disconnected) => {}
                Err(err) => return Err(to_io(err)),
            }
        }
        Ok(())
    }
}

/// Listening socket that produces one [`IpcTransport`] per peer.
pub struct IpcListener {
    listener: UnixListener,
    path: PathBuf,
    max_frame_bytes: usize,
}

impl IpcListener {
    /// Bind `path`, replacing a stale socket file.
    pub fn bind(path: impl AsRef<Path>, max_frame_bytes: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            path,
            max_frame_bytes,
        })
    }

    /// Socket path the listener is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a pending peer without blocking.
    pub fn try_accept(&self) -> io::Result<Option<IpcTransport>> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                IpcTransport::from_stream(stream, self.max_frame_bytes).map(Some)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::UNCLAIMED_GRACE;
    use std::time::Duration;

    const MAX: usize = 64 * 1024;

    #[derive(Default)]
    struct Collector {
        frames: Mutex<Vec<Vec<u8>>>,
        disconnected: AtomicBool,
    }

    impl FrameReceiver for Collector {
        fn on_receive(&self, bytes: &[u8]) {
            self.frames.lock().push(bytes.to_vec());
        }

        fn on_disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn pair() -> (IpcTransport, IpcTransport) {
        let (a, b) = UnixStream::pair().expect("socket pair");
        (
            IpcTransport::from_stream(a, MAX).expect("wrap a"),
            IpcTransport::from_stream(b, MAX).expect("wrap b"),
        )
    }

    fn attach(transport: &IpcTransport) -> Arc<Collector> {
        let collector = Arc::new(Collector::default());
        let weak = Arc::downgrade(&collector) as Weak<dyn FrameReceiver>;
        transport.set_receiver(weak).expect("receiver installed");
        collector
    }

    #[test]
    fn frame_header_layout() {
        let frame = encode_frame(FrameKind::Message, b"{}", MAX).expect("encode");
        assert_eq!(frame, vec![b'A', b'B', 1, 2, 0, 0, 0, b'{', b'}']);
    }

    #[test]
    fn read_frame_handles_eof_and_garbage() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty, MAX).expect("clean eof").is_none());

        let mut truncated: &[u8] = &[b'A', b'B', 1];
        assert_eq!(
            read_frame(&mut truncated, MAX).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );

        let mut bad_magic: &[u8] = &[b'X', b'Y', 1, 0, 0, 0, 0];
        assert_eq!(
            read_frame(&mut bad_magic, MAX).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        assert!(matches!(
            encode_frame(FrameKind::Message, &[0u8; 10], 4),
            Err(TransportError::FrameTooLarge { len: 10, max: 4 })
        ));
        let frame = encode_frame(FrameKind::Message, &[0u8; 10], 64).expect("encode");
        let mut reader = frame.as_slice();
        assert!(read_frame(&mut reader, 4).is_err());
    }

    #[test]
    fn stream_body_round_trip() {
        let body = stream_body("tts-1", b"pcm").expect("body");
        let (id, data) = split_stream_body(&body).expect("split");
        assert_eq!(id, "tts-1");
        assert_eq!(data, b"pcm");
        assert!(split_stream_body(&[5, 0, b'a']).is_err());
    }

    #[test]
    fn messages_cross_the_socket_in_order() {
        let (left, right) = pair();
        let collector = attach(&right);
        for i in 0..20u8 {
            left.send(&[i]).expect("send");
        }
        assert!(eventually(|| collector.frames.lock().len() == 20));
        let order: Vec<u8> = collector.frames.lock().iter().map(|f| f[0]).collect();
        assert_eq!(order, (0..20u8).collect::<Vec<_>>());
    }

    #[test]
    fn stream_bytes_arrive_then_eof() {
        let (left, right) = pair();
        let _rx = attach(&right);
        let reader = right.open_raw_stream("s1", StreamMode::Read).expect("reader");
        let writer = left.open_raw_stream("s1", StreamMode::Write).expect("writer");
        assert_eq!(writer.write(&[1u8; 320]).expect("write"), 320);
        writer.close().expect("close");

        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match reader.read(&mut buf).expect("read") {
                0 => break,
                n => received.extend_from_slice(&buf[..n]),
            }
        }
        assert_eq!(received.len(), 320);
    }

    #[test]
    fn streams_nobody_reads_do_not_pile_up() {
        let (left, right) = pair();
        let _rx = attach(&right);
        let kept = right.open_raw_stream("kept", StreamMode::Read).expect("reader");
        for n in 0..100 {
            let writer = left
                .open_raw_stream(&format!("tts-{n}"), StreamMode::Write)
                .expect("writer");
            writer.write(&[0u8; 1024]).expect("write");
            writer.close().expect("close");
        }
        let writer = left.open_raw_stream("kept", StreamMode::Write).expect("writer");
        writer.close().expect("close");

        assert!(eventually(|| {
            right
                .inbound_pipes
                .prune_unclaimed(std::time::Instant::now() + UNCLAIMED_GRACE);
            right.inbound_pipes.len() == 1
        }));
        let mut buf = [0u8; 8];
        assert_eq!(kept.read(&mut buf).expect("eof"), 0);
        kept.close().expect("close");
        assert!(right.inbound_pipes.is_empty());
    }

    #[test]
    fn peer_disconnect_is_reported() {
        let (left, right) = pair();
        let collector = attach(&right);
        left.disconnect();
        assert!(eventually(|| collector.disconnected.load(Ordering::SeqCst)));
        assert!(!right.is_connected());
        assert!(matches!(right.send(b"x"), Err(TransportError::Disconnected)));
    }

    #[test]
    fn listener_accepts_connections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("aasb.sock");
        let listener = IpcListener::bind(&path, MAX).expect("bind");
        assert!(listener.try_accept().expect("poll").is_none());

        let client = IpcTransport::connect(&path, MAX).expect("connect");
        let server = loop {
            if let Some(server) = listener.try_accept().expect("accept") {
                break server;
            }
            thread::sleep(Duration::from_millis(5));
        };
        let collector = attach(&server);
        client.send(b"hello").expect("send");
        assert!(eventually(|| collector.frames.lock().len() == 1));
        drop(listener);
        assert!(!path.exists());
    }
}
