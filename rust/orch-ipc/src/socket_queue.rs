// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Named FIFO channel between processes.
//!
//! The receiving side binds a Unix domain socket at `<dir>/<name>.sock`.
//! Senders connect to that path and write length-prefixed frames. Each
//! accepted connection gets a reader thread that decodes frames into a
//! bounded local [`MessageQueue`]. When that queue is full the reader stops
//! reading, the socket buffer fills and senders block. Frames from one
//! sender are received in the order they were sent.
//!
//! Frame layout: `[len: u32 LE][payload: len bytes]`.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{IpcError, IpcResult};
use crate::message_queue::MessageQueue;

/// Largest payload accepted from a peer.
pub const MAX_FRAME_LEN: usize = 1 << 20;

// sun_path holds 108 bytes on Linux including the terminator.
const MAX_SOCKET_PATH: usize = 100;

/// A message with a fixed binary encoding.
pub trait WireMessage: Sized + Send + 'static {
    fn encode(&self, out: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> IpcResult<Self>;
}

pub fn put_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

pub fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Cursor over one frame payload.
pub struct FrameReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> IpcResult<&'a [u8]> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(IpcError::Decode(format!(
                "need {n} bytes at offset {}, frame has {}",
                self.pos,
                self.bytes.len()
            )));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> IpcResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u64(&mut self) -> IpcResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn usize(&mut self) -> IpcResult<usize> {
        let value = self.u64()?;
        usize::try_from(value).map_err(|_| IpcError::Decode(format!("{value} overflows usize")))
    }

    /// Fails if any bytes are left unread.
    pub fn finish(self) -> IpcResult<()> {
        if self.pos != self.bytes.len() {
            return Err(IpcError::Decode(format!(
                "{} trailing bytes",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}

/// Socket path for the queue called `name` under `dir`. Characters outside
/// `[A-Za-z0-9._-]` become `_`; paths too long for `sun_path` fall back to a
/// hash of the name.
pub fn socket_path(dir: &Path, name: &str) -> PathBuf {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let path = dir.join(format!("{sanitized}.sock"));
    if path.as_os_str().len() <= MAX_SOCKET_PATH {
        return path;
    }
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    dir.join(format!("q-{:016x}.sock", hasher.finish()))
}

fn write_frame<T: WireMessage>(stream: &mut UnixStream, message: &T) -> io::Result<()> {
    let mut frame = vec![0u8; 4];
    message.encode(&mut frame);
    let len = frame.len() - 4;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    frame[..4].copy_from_slice(&(len as u32).to_le_bytes());
    stream.write_all(&frame)
}

/// `Ok(None)` on a clean end of stream between frames.
fn read_frame(stream: &mut UnixStream) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(Some(payload))
}

fn bind(path: &Path, name: &str) -> IpcResult<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).is_ok() {
                return Err(IpcError::QueueInUse(name.to_string()));
            }
            // Left behind by a receiver that exited without closing.
            tracing::debug!(queue = name, path = %path.display(), "removing stale socket");
            std::fs::remove_file(path)?;
            Ok(UnixListener::bind(path)?)
        }
        Err(e) => Err(e.into()),
    }
}

struct Receiver<T: Send + 'static> {
    path: PathBuf,
    local: MessageQueue<T>,
    closed: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<UnixStream>>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Receiver<T> {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.local.close();
        for stream in self.connections.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let handle = self.acceptor.lock().take();
        // The acceptor checks the flag after every accept.
        match (UnixStream::connect(&self.path), handle) {
            (Ok(_wake), Some(handle)) => {
                let _ = handle.join();
            }
            (Err(e), Some(_)) => {
                tracing::warn!(queue = %self.local.name(), error = %e, "could not wake acceptor");
            }
            _ => {}
        }
        let _ = std::fs::remove_file(&self.path);
        tracing::debug!(queue = %self.local.name(), "closed socket queue");
    }
}

impl<T: Send + 'static> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop<T: WireMessage>(
    listener: UnixListener,
    local: MessageQueue<T>,
    closed: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<UnixStream>>>,
) {
    for stream in listener.incoming() {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(queue = %local.name(), error = %e, "accept failed");
                continue;
            }
        };
        match stream.try_clone() {
            Ok(handle) => connections.lock().push(handle),
            Err(e) => {
                tracing::warn!(queue = %local.name(), error = %e, "dropping connection");
                continue;
            }
        }
        if closed.load(Ordering::SeqCst) {
            let _ = stream.shutdown(Shutdown::Both);
            break;
        }
        let local = local.clone();
        let spawned = std::thread::Builder::new()
            .name("socket-queue-reader".to_string())
            .spawn(move || read_loop(stream, local));
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn socket queue reader");
        }
    }
}

fn read_loop<T: WireMessage>(mut stream: UnixStream, local: MessageQueue<T>) {
    loop {
        let payload = match read_frame(&mut stream) {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(queue = %local.name(), error = %e, "connection ended");
                break;
            }
        };
        let message = match T::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(queue = %local.name(), error = %e, "dropping connection after bad frame");
                break;
            }
        };
        if local.send(message).is_err() {
            break;
        }
    }
}

/// Receiving end of a named cross-process queue. Cloning yields another
/// handle; the socket is unlinked on [`SocketQueue::close`] or when the last
/// handle drops.
pub struct SocketQueue<T: WireMessage> {
    inner: Arc<Receiver<T>>,
}

impl<T: WireMessage> Clone for SocketQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: WireMessage> fmt::Debug for SocketQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketQueue")
            .field("name", &self.name())
            .field("path", &self.inner.path)
            .field("len", &self.len())
            .finish()
    }
}

impl<T: WireMessage> SocketQueue<T> {
    /// Bind the queue called `name` under `dir`, buffering up to `capacity`
    /// decoded messages. A socket left by a dead receiver is replaced; a live
    /// one is [`IpcError::QueueInUse`].
    pub fn create(dir: impl AsRef<Path>, name: &str, capacity: usize) -> IpcResult<Self> {
        let local = MessageQueue::unregistered(name, capacity)?;
        let path = socket_path(dir.as_ref(), name);
        let listener = bind(&path, name)?;
        let closed = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let acceptor = {
            let local = local.clone();
            let closed = Arc::clone(&closed);
            let connections = Arc::clone(&connections);
            std::thread::Builder::new()
                .name("socket-queue-accept".to_string())
                .spawn(move || accept_loop(listener, local, closed, connections))?
        };
        tracing::debug!(queue = name, path = %path.display(), capacity, "bound socket queue");
        Ok(Self {
            inner: Arc::new(Receiver {
                path,
                local,
                closed,
                connections,
                acceptor: Mutex::new(Some(acceptor)),
            }),
        })
    }

    /// Block until a message arrives; `None` once closed and drained.
    pub fn receive(&self) -> Option<T> {
        self.inner.local.receive()
    }

    pub fn try_receive(&self) -> Option<T> {
        self.inner.local.try_receive()
    }

    pub fn receive_timeout(&self, timeout: Duration) -> IpcResult<T> {
        self.inner.local.receive_timeout(timeout)
    }

    /// Stop accepting, disconnect senders and unlink the socket. Messages
    /// already buffered still drain.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &str {
        self.inner.local.name()
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

/// Sending end of a named cross-process queue.
pub struct SocketSender<T: WireMessage> {
    name: String,
    stream: Mutex<UnixStream>,
    _marker: PhantomData<fn(T)>,
}

impl<T: WireMessage> fmt::Debug for SocketSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketSender").field("name", &self.name).finish()
    }
}

impl<T: WireMessage> SocketSender<T> {
    /// Connect to the queue called `name` under `dir`.
    pub fn connect(dir: impl AsRef<Path>, name: &str) -> IpcResult<Self> {
        let path = socket_path(dir.as_ref(), name);
        let stream = UnixStream::connect(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                IpcError::QueueNotFound(name.to_string())
            }
            _ => IpcError::Io(e),
        })?;
        Ok(Self {
            name: name.to_string(),
            stream: Mutex::new(stream),
            _marker: PhantomData,
        })
    }

    /// Blocks while the receiver's buffer and the socket buffer are full.
    pub fn send(&self, message: T) -> IpcResult<()> {
        let mut stream = self.stream.lock();
        write_frame(&mut stream, &message).map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected => IpcError::QueueClosed(self.name.clone()),
            _ => IpcError::Io(e),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Num(u64);

    impl WireMessage for Num {
        fn encode(&self, out: &mut Vec<u8>) {
            put_u64(out, self.0);
        }

        fn decode(bytes: &[u8]) -> IpcResult<Self> {
            let mut reader = FrameReader::new(bytes);
            let value = reader.u64()?;
            reader.finish()?;
            Ok(Num(value))
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_fifo_per_sender() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SocketQueue::<Num>::create(dir.path(), "queue:fifo", 4).unwrap();
        let sender = SocketSender::<Num>::connect(dir.path(), "queue:fifo").unwrap();
        let writer = std::thread::spawn(move || {
            for i in 0..20 {
                sender.send(Num(i)).unwrap();
            }
        });
        let got: Vec<u64> = (0..20)
            .map(|_| queue.receive_timeout(WAIT).unwrap().0)
            .collect();
        writer.join().unwrap();
        assert_eq!(got, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_connect_to_missing_queue() {
        let dir = tempfile::tempdir().unwrap();
        let err = SocketSender::<Num>::connect(dir.path(), "queue:nobody").unwrap_err();
        assert!(matches!(err, IpcError::QueueNotFound(_)));
    }

    #[test]
    fn test_close_drains_then_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SocketQueue::<Num>::create(dir.path(), "queue:close", 4).unwrap();
        let sender = SocketSender::<Num>::connect(dir.path(), "queue:close").unwrap();
        sender.send(Num(1)).unwrap();
        assert!(orch_wait(|| queue.len() == 1));

        queue.close();
        assert!(queue.is_closed());
        assert!(!queue.path().exists());
        assert_eq!(queue.receive(), Some(Num(1)));
        assert_eq!(queue.receive(), None);
        assert!(matches!(sender.send(Num(2)), Err(IpcError::QueueClosed(_))));
        assert!(matches!(
            SocketSender::<Num>::connect(dir.path(), "queue:close"),
            Err(IpcError::QueueNotFound(_))
        ));
    }

    #[test]
    fn test_stale_socket_is_replaced_live_one_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), "queue:stale");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let queue = SocketQueue::<Num>::create(dir.path(), "queue:stale", 2).unwrap();
        assert!(matches!(
            SocketQueue::<Num>::create(dir.path(), "queue:stale", 2),
            Err(IpcError::QueueInUse(_))
        ));
        SocketSender::<Num>::connect(dir.path(), "queue:stale")
            .unwrap()
            .send(Num(3))
            .unwrap();
        assert_eq!(queue.receive_timeout(WAIT).unwrap(), Num(3));
    }

    #[test]
    fn test_bad_frame_drops_only_that_connection() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SocketQueue::<Num>::create(dir.path(), "queue:bad", 2).unwrap();
        let mut raw = UnixStream::connect(queue.path()).unwrap();
        raw.write_all(&3u32.to_le_bytes()).unwrap();
        raw.write_all(&[1, 2, 3]).unwrap();

        let sender = SocketSender::<Num>::connect(dir.path(), "queue:bad").unwrap();
        sender.send(Num(9)).unwrap();
        assert_eq!(queue.receive_timeout(WAIT).unwrap(), Num(9));
        assert!(queue.try_receive().is_none());
    }

    #[test]
    fn test_long_names_fit_in_sun_path() {
        let dir = Path::new("/tmp");
        let name = format!("queue:{}:obj", "x".repeat(200));
        let path = socket_path(dir, &name);
        assert!(path.as_os_str().len() <= MAX_SOCKET_PATH);
        assert_eq!(path, socket_path(dir, &name));
        assert_eq!(
            socket_path(dir, "queue:10.0.0.1:2000:obj"),
            Path::new("/tmp/queue_10.0.0.1_2000_obj.sock")
        );
    }

    #[test]
    fn test_frame_reader_rejects_short_and_trailing() {
        assert!(matches!(Num::decode(&[1, 2]), Err(IpcError::Decode(_))));
        assert!(matches!(Num::decode(&[0; 9]), Err(IpcError::Decode(_))));
    }

    fn orch_wait(condition: impl Fn() -> bool) -> bool {
        let deadline = std::time::Instant::now() + WAIT;
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}
