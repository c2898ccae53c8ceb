//! Stream-shaping primitives the engine relies on: a timeout/cancellation
//! wrapper and an EOF-raising wrapper. Both implement the same
//! [`ByteSource`] capability so the engine can depend on that alone,
//! independent of how many decorators (noisy, throttled, ...) sit
//! underneath in a given embedder or test (see `tests/common`).

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// How often a bounded read re-checks the deadline and the cancel flag.
/// The wrapped reader is expected to return promptly (e.g. because the
/// caller configured its own short read timeout) rather than block past
/// this quantum; `TimeoutReader` has no way to force that on a generic
/// `Read`, so honoring it is a contract on the type passed to `new`.
pub const POLL_QUANTUM: Duration = Duration::from_millis(10);

/// A single byte, or a short count from a block read, never silently
/// stands in for an error: both `TimeoutReader` and `EofReader` return one
/// of these through `Result` instead.
pub trait ByteSource {
    /// Read the next byte, blocking (subject to any configured timeout).
    fn read_byte(&mut self) -> Result<u8>;

    /// Fill `buf` completely, subject to the same timeout. Returns the
    /// number of bytes actually read, which is less than `buf.len()` only
    /// when the underlying source reached its natural end.
    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// A [`ByteSource`] whose deadline can be changed after construction. The
/// engine needs this to switch between the 3s negotiation cadence and a
/// flavor's per-block timeout on the same stream (spec 4.4).
pub trait TimedByteSource: ByteSource {
    fn set_timeout(&mut self, timeout: Duration);
}

/// A handle a controller task can use to unblock a [`TimeoutReader`]'s
/// in-progress read from another thread.
#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Request cancellation. Observable at the reader's next polling point.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wraps a byte source and bounds each read by a millisecond deadline,
/// supporting external cancellation. Single-consumer: concurrent reads
/// through the same instance are not supported (spec 4.1).
#[derive(Debug)]
pub struct TimeoutReader<R> {
    inner: R,
    timeout: Duration,
    cancelled: Arc<AtomicBool>,
}

enum Poll {
    Byte(u8),
    Eof,
}

impl<R: Read> TimeoutReader<R> {
    /// Wraps `inner` with no deadline (blocks indefinitely until
    /// [`set_timeout`](Self::set_timeout) is called).
    pub fn new(inner: R) -> Self {
        TimeoutReader {
            inner,
            timeout: Duration::ZERO,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the per-read deadline. `Duration::ZERO` means block indefinitely.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// The currently configured deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Obtain a cloneable handle that can cancel this reader from another
    /// thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancelled.clone())
    }

    /// Cancel any in-progress or future read until [`clear_cancel`] is called.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Reset the cancellation flag, e.g. to reuse a reader for a new transfer.
    pub fn clear_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn poll_byte(&mut self) -> Result<Poll> {
        let deadline = if self.timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + self.timeout)
        };
        let mut byte = [0u8; 1];
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(Error::CancelledLocally);
            }
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(Poll::Eof),
                Ok(_) => return Ok(Poll::Byte(byte[0])),
                Err(e) if is_would_block(&e) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(Error::Timeout);
                        }
                    }
                    // keep polling; the wrapped reader is expected to have
                    // blocked for roughly POLL_QUANTUM before returning here.
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

fn is_would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

impl<R: Read> ByteSource for TimeoutReader<R> {
    fn read_byte(&mut self) -> Result<u8> {
        match self.poll_byte()? {
            Poll::Byte(b) => Ok(b),
            Poll::Eof => Err(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof))),
        }
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.poll_byte()? {
                Poll::Byte(b) => *slot = b,
                Poll::Eof => return Ok(i),
            }
        }
        Ok(buf.len())
    }
}

impl<R: Read> TimedByteSource for TimeoutReader<R> {
    fn set_timeout(&mut self, timeout: Duration) {
        self.set_timeout(timeout);
    }
}

impl<R: Write> Write for TimeoutReader<R> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Wraps a [`ByteSource`] and raises [`Error::EndOfStream`] in place of a
/// sentinel value or a silently short read (spec 4.2). This is the only
/// place in the stack that produces `EndOfStream`; everything below it
/// (e.g. `TimeoutReader`) reports plain end-of-stream as an ordinary short
/// count or `UnexpectedEof`.
#[derive(Debug)]
pub struct EofReader<S> {
    inner: S,
}

impl<S: ByteSource> EofReader<S> {
    pub fn new(inner: S) -> Self {
        EofReader { inner }
    }

    pub fn inner_ref(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ByteSource> ByteSource for EofReader<S> {
    fn read_byte(&mut self) -> Result<u8> {
        match self.inner.read_byte() {
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(Error::EndOfStream)
            }
            other => other,
        }
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read_into(buf)?;
        if n < buf.len() {
            Err(Error::EndOfStream)
        } else {
            Ok(n)
        }
    }
}

impl<S: TimedByteSource> TimedByteSource for EofReader<S> {
    fn set_timeout(&mut self, timeout: Duration) {
        self.inner.set_timeout(timeout);
    }
}

impl<S: Write> Write for EofReader<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
