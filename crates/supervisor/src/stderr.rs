//! Relaying the capture server's stderr.
//!
//! While the server starts, its stderr accumulates in a [`SyncBuf`] so that a
//! failed start can report it. Once the server is healthy the [`Copier`] is
//! switched to a [`pipe`], and the watcher reads the buffered output followed
//! by the live stream.

use crate::error::ProcessError;
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

const COPY_BUFFER_SIZE: usize = 512;
/// Most stderr bytes either buffer holds before it starts losing output.
pub(crate) const MAX_BUFFERED: usize = 1 << 20;

/// A byte queue shared between threads. Reading drains it. Past
/// [`MAX_BUFFERED`] bytes the oldest output is dropped.
#[derive(Debug, Clone, Default)]
pub(crate) struct SyncBuf {
    inner: Arc<Mutex<VecDeque<u8>>>,
}

impl SyncBuf {
    /// Everything not yet read, without consuming it.
    pub(crate) fn snapshot(&self) -> String {
        let mut inner = self.inner.lock();
        String::from_utf8_lossy(inner.make_contiguous())
            .trim_end()
            .to_string()
    }
}

impl Write for SyncBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        inner.extend(buf);
        if inner.len() > MAX_BUFFERED {
            let excess = inner.len() - MAX_BUFFERED;
            inner.drain(..excess);
            trace!(excess, "startup stderr buffer full; dropped oldest output");
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SyncBuf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        let n = buf.len().min(inner.len());
        for (slot, byte) in buf.iter_mut().zip(inner.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

pub(crate) struct PipeWriter {
    tx: Sender<Vec<u8>>,
    queued: Arc<AtomicUsize>,
}

impl Write for PipeWriter {
    /// Chunks that would push the queue past [`MAX_BUFFERED`] bytes are
    /// dropped whole.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tx.is_disconnected() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if self.queued.load(Ordering::SeqCst) + buf.len() > MAX_BUFFERED {
            debug!(len = buf.len(), "stderr reader behind; dropping output");
            return Ok(buf.len());
        }
        self.queued.fetch_add(buf.len(), Ordering::SeqCst);
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads what the paired [`PipeWriter`] wrote, and EOF once it is dropped.
pub(crate) struct PipeReader {
    rx: Receiver<Vec<u8>>,
    queued: Arc<AtomicUsize>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.queued.fetch_sub(chunk.len(), Ordering::SeqCst);
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// An in-memory pipe holding at most [`MAX_BUFFERED`] unread bytes. The
/// copier never blocks on a slow reader; output beyond the cap is lost.
pub(crate) fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = flume::unbounded();
    let queued = Arc::new(AtomicUsize::new(0));
    (
        PipeWriter {
            tx,
            queued: Arc::clone(&queued),
        },
        PipeReader {
            rx,
            queued,
            chunk: Vec::new(),
            pos: 0,
        },
    )
}

type Target = Arc<Mutex<Box<dyn Write + Send>>>;

/// Copies a stream into a switchable target on its own thread.
pub(crate) struct Copier {
    target: Target,
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
}

impl Copier {
    pub(crate) fn spawn<R, W, F>(name: &str, from: R, to: W, on_error: F) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        F: Fn(ProcessError) + Send + 'static,
    {
        let target: Target = Arc::new(Mutex::new(Box::new(to)));
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = flume::bounded(0);

        {
            let target = Arc::clone(&target);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(name.into())
                .spawn(move || {
                    copy(from, &target, &stop, on_error);
                    // Readers of the last target see EOF once it is replaced.
                    *target.lock() = Box::new(io::sink());
                    drop(done_tx);
                })?;
        }

        Ok(Self { target, stop, done })
    }

    pub(crate) fn switch_to(&self, to: impl Write + Send + 'static) {
        *self.target.lock() = Box::new(to);
    }

    /// Anything read after this is discarded.
    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the source to reach EOF. Returns false on timeout.
    pub(crate) fn wait_drained(&self, timeout: Duration) -> bool {
        matches!(
            self.done.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

fn copy<R, F>(mut from: R, target: &Target, stop: &AtomicBool, on_error: F)
where
    R: Read,
    F: Fn(ProcessError),
{
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match from.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if !stop.load(Ordering::SeqCst) {
                    on_error(ProcessError::Stderr(err));
                }
                return;
            }
        };
        if stop.load(Ordering::SeqCst) {
            trace!(n, "discarding stderr after stop");
            continue;
        }
        if let Err(err) = target.lock().write_all(&buf[..n]) {
            if !stop.load(Ordering::SeqCst) {
                on_error(ProcessError::Stderr(err));
            }
            return;
        }
    }
}
