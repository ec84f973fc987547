//! A pipe backed by an unbounded in-memory buffer. Writes never block; reads
//! block until data is available or the pipe is closed.
//!
//! Capturing a child's output or feeding one command into another goes through
//! this type, so a slow reader can never stall a child on a full OS pipe.

use crate::error::{Error, Result};
use crate::lock;
use crate::output::Sink;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Default)]
struct State {
    buf: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// Clonable handle; every clone refers to the same buffer.
#[derive(Clone, Default)]
pub struct Pipe {
    inner: Arc<Inner>,
}

impl Pipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data`. Fails only if the pipe was already closed.
    pub fn push(&self, data: &[u8]) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return Err(Error::ClosedPipe);
        }
        state.buf.extend(data);
        self.inner.cond.notify_all();
        Ok(())
    }

    /// Blocks until data is available or the pipe is closed. Returns 0 once
    /// closed and drained.
    pub fn pull(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut state = lock(&self.inner.state);
        while state.buf.is_empty() && !state.closed {
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        let n = out.len().min(state.buf.len());
        for (dst, src) in out.iter_mut().zip(state.buf.drain(..n)) {
            *dst = src;
        }
        n
    }

    /// Idempotent; only the first call has an effect.
    pub fn close(&self) {
        let mut state = lock(&self.inner.state);
        if !state.closed {
            state.closed = true;
            self.inner.cond.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Reads until end of stream.
    pub fn read_all(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.pull(&mut chunk);
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn read_to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.read_all()).into_owned()
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.pull(buf))
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Sink for Pipe {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()> {
        Ok(self.push(buf)?)
    }

    fn close(&self) -> io::Result<()> {
        Pipe::close(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_write_then_read() {
        let p = Pipe::new();
        p.push(b"hello").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(p.pull(&mut buf), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(p.pull(&mut buf), 2);
        assert_eq!(&buf[..2], b"lo");
    }

    #[test]
    fn test_read_blocks_until_write() {
        let p = Pipe::new();
        let writer = p.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.push(b"late").unwrap();
        });
        let mut buf = [0u8; 16];
        let n = p.pull(&mut buf);
        assert_eq!(&buf[..n], b"late");
        handle.join().unwrap();
    }

    #[test]
    fn test_close_wakes_reader() {
        let p = Pipe::new();
        let closer = p.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            closer.close();
        });
        let mut buf = [0u8; 16];
        assert_eq!(p.pull(&mut buf), 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_close_is_idempotent_and_drains() {
        let mut p = Pipe::new();
        p.write_all(b"abc").unwrap();
        p.close();
        p.close();
        assert!(p.is_closed());
        assert!(matches!(p.push(b"x"), Err(Error::ClosedPipe)));
        let err = p.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let mut s = String::new();
        p.read_to_string(&mut s).unwrap();
        assert_eq!(s, "abc");
        let mut buf = [0u8; 4];
        assert_eq!(p.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_many_writes_never_block() {
        let p = Pipe::new();
        let chunk = vec![7u8; 64 * 1024];
        for _ in 0..32 {
            p.push(&chunk).unwrap();
        }
        p.close();
        assert_eq!(p.read_all().len(), 32 * 64 * 1024);
    }
}
