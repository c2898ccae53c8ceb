//! Shared test-only I/O harness (spec section 2's "Test harness" component:
//! not part of the shipping core). A bidirectional byte-channel pipe
//! (grounded on `awelkie-xmodem.rs/tests/loopback.rs`'s `BidirectionalPipe`)
//! plus a noisy decorator for the "CRC over a noisy stream" scenario (spec
//! section 8, scenario 3).

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// How long a pipe's `read` blocks before reporting `TimedOut`, satisfying
/// `TimeoutReader`'s caller contract (its own deadline polls in quanta of
/// this size or coarser).
const PIPE_POLL: Duration = Duration::from_millis(5);

/// One direction of a loopback byte pipe. Reports end-of-stream as `Ok(0)`
/// (the peer dropped its sender) and a starved read as
/// `io::ErrorKind::TimedOut`, never blocking past `PIPE_POLL`.
pub struct Pipe {
    rx: Receiver<u8>,
    tx: Sender<u8>,
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.rx.recv_timeout(PIPE_POLL) {
            Ok(byte) => {
                buf[0] = byte;
                Ok(1)
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "pipe read timed out"))
            }
            Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &b in buf {
            self.tx
                .send(b)
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Builds a connected pair: bytes written to one side arrive readable on
/// the other.
pub fn pipe_pair() -> (Pipe, Pipe) {
    let (s1, r1) = channel();
    let (s2, r2) = channel();
    (Pipe { rx: r1, tx: s2 }, Pipe { rx: r2, tx: s1 })
}

/// Flips one bit every `period` bytes read, deterministically (seeded by a
/// counter, not wall-clock/`rand`'s global RNG) so a failing run is
/// reproducible. Wraps any `Read`; write-through is untouched.
pub struct NoisyReader<R> {
    inner: R,
    period: usize,
    count: usize,
}

impl<R: Read> NoisyReader<R> {
    pub fn new(inner: R, period: usize) -> Self {
        NoisyReader { inner, period, count: 0 }
    }
}

impl<R: Read> Read for NoisyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        for slot in &mut buf[..n] {
            self.count += 1;
            if self.period > 0 && self.count % self.period == 0 {
                *slot ^= 0x01;
            }
        }
        Ok(n)
    }
}

impl<R: Write> Write for NoisyReader<R> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
