//! Output fan-out for child processes.
//!
//! Each of a command's streams is copied to a list of [`Sink`]s: the parent's
//! own stream, per-command log files, buffers, pipes, and (for stdout) the
//! protocol decoder. Every sink sees every byte, in the order it was written.

use crate::lock;
use chrono::Utc;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A consumer of child output. Shared across threads, so writes take `&self`.
pub trait Sink: Send + Sync {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()>;

    /// Called once the child has exited. Attaching the same sink to both
    /// streams still results in a single call.
    fn close(&self) -> io::Result<()> {
        Ok(())
    }

    /// The stream feeding this sink hit EOF. Called once per stream.
    fn end_of_stream(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parent process's own stdout or stderr.
pub struct Parent(pub Stream);

impl Sink for Parent {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()> {
        match self.0 {
            Stream::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(buf)?;
                out.flush()
            }
            Stream::Stderr => io::stderr().lock().write_all(buf),
        }
    }
}

/// Growable in-memory buffer; clones share the same bytes.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        lock(&self.0).clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sink for SharedBuffer {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()> {
        lock(&self.0).extend_from_slice(buf);
        Ok(())
    }
}

// SharedWriter lets any writer (a file, a socket, a child's stdin) act as a
// sink by putting it behind a mutex.
pub struct SharedWriter<W: Write + Send>(Mutex<Option<W>>);

impl<W: Write + Send> SharedWriter<W> {
    pub fn new(w: W) -> Self {
        Self(Mutex::new(Some(w)))
    }
}

impl<W: Write + Send> Sink for SharedWriter<W> {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()> {
        match lock(&self.0).as_mut() {
            Some(w) => w.write_all(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write on closed writer",
            )),
        }
    }

    fn close(&self) -> io::Result<()> {
        // Dropping the writer closes it.
        if let Some(mut w) = lock(&self.0).take() {
            w.flush()?;
        }
        Ok(())
    }
}

/// Timestamp shared by a command's stdout and stderr log files.
pub fn timestamp() -> String {
    Utc::now().format("%Y%m%d.%H%M%S.%6f").to_string()
}

/// `<program basename>.<timestamp>.<stdout|stderr>`
pub fn log_file_name(program: &Path, stamp: &str, stream: Stream) -> String {
    let base = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cmd".to_string());
    format!("{}.{}.{}", base, stamp, stream)
}

/// Per-command log file. Created exclusively so concurrent runs never clobber
/// each other.
pub struct LogFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl LogFile {
    pub fn create(dir: &Path, program: &Path, stamp: &str, stream: Stream) -> io::Result<Self> {
        let path = dir.join(log_file_name(program, stamp, stream));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        log::debug!("Logging {} to {}", stream, path.display());
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for LogFile {
    fn write_bytes(&self, buf: &[u8]) -> io::Result<()> {
        match lock(&self.file).as_mut() {
            Some(f) => f.write_all(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("{} already closed", self.path.display()),
            )),
        }
    }

    fn close(&self) -> io::Result<()> {
        if let Some(f) = lock(&self.file).take() {
            f.sync_all()?;
        }
        Ok(())
    }
}

/// Copies one stream to many sinks. A sink that fails is logged and dropped;
/// the rest keep receiving data.
pub struct FanOut {
    label: String,
    sinks: Vec<Arc<dyn Sink>>,
}

impl FanOut {
    pub fn new(label: impl Into<String>, sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self {
            label: label.into(),
            sinks,
        }
    }

    pub fn write(&mut self, buf: &[u8]) {
        let label = &self.label;
        self.sinks.retain(|sink| match sink.write_bytes(buf) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}: dropping output consumer: {}", label, e);
                false
            }
        });
    }

    pub fn end_of_stream(&self) {
        for sink in &self.sinks {
            sink.end_of_stream();
        }
    }

    /// Copies `reader` until EOF, then signals end of stream.
    pub fn pump<R: Read>(mut self, mut reader: R) {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.write(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("{}: read failed: {}", self.label, e);
                    break;
                }
            }
        }
        self.end_of_stream();
    }
}

/// Adds `sink` unless the very same sink (by identity) is already present.
pub fn push_unique(list: &mut Vec<Arc<dyn Sink>>, sink: &Arc<dyn Sink>) {
    if !list.iter().any(|s| same_sink(s, sink)) {
        list.push(Arc::clone(sink));
    }
}

fn same_sink(a: &Arc<dyn Sink>, b: &Arc<dyn Sink>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Closes every sink, logging failures.
pub fn close_all(sinks: &[Arc<dyn Sink>]) {
    for sink in sinks {
        if let Err(e) = sink.close() {
            log::warn!("Failed to close output consumer: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing;
    impl Sink for Failing {
        fn write_bytes(&self, _: &[u8]) -> io::Result<()> {
            Err(io::Error::other("boom"))
        }
    }

    #[derive(Default)]
    struct CountCloses(AtomicUsize);
    impl Sink for CountCloses {
        fn write_bytes(&self, _: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn close(&self) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_fan_out_delivers_everything_in_order() {
        let a = SharedBuffer::new();
        let b = SharedBuffer::new();
        let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(a.clone()), Arc::new(b.clone())];
        let mut fan = FanOut::new("test", sinks);
        fan.write(b"one ");
        fan.write(b"two");
        assert_eq!(a.bytes(), b"one two");
        assert_eq!(b.bytes(), b"one two");
    }

    #[test]
    fn test_failing_sink_is_dropped() {
        let a = SharedBuffer::new();
        let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(Failing), Arc::new(a.clone())];
        let mut fan = FanOut::new("test", sinks);
        fan.write(b"x");
        fan.write(b"y");
        assert_eq!(fan.sinks.len(), 1);
        assert_eq!(a.to_string_lossy(), "xy");
    }

    #[test]
    fn test_pump_reads_to_eof() {
        let a = SharedBuffer::new();
        let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(a.clone())];
        let fan = FanOut::new("test", sinks);
        fan.pump(&b"line 1\nline 2\n"[..]);
        assert_eq!(a.to_string_lossy(), "line 1\nline 2\n");
    }

    #[test]
    fn test_push_unique_tracks_identity() {
        let counter = Arc::new(CountCloses::default());
        let sink: Arc<dyn Sink> = counter.clone();
        let other: Arc<dyn Sink> = Arc::new(CountCloses::default());
        let mut list = Vec::new();
        push_unique(&mut list, &sink);
        push_unique(&mut list, &sink);
        push_unique(&mut list, &other);
        assert_eq!(list.len(), 2);
        close_all(&list);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_log_file_name() {
        let name = log_file_name(Path::new("/usr/bin/server"), "20240101.000000.000001", Stream::Stderr);
        assert_eq!(name, "server.20240101.000000.000001.stderr");
    }

    #[test]
    fn test_log_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let program = Path::new("prog");
        let log = LogFile::create(dir.path(), program, "stamp", Stream::Stdout).unwrap();
        log.write_bytes(b"hello").unwrap();
        log.close().unwrap();
        assert_eq!(std::fs::read(log.path()).unwrap(), b"hello");
        assert!(LogFile::create(dir.path(), program, "stamp", Stream::Stdout).is_err());
        assert!(log.write_bytes(b"late").is_err());
    }

    #[test]
    fn test_shared_writer_closes_once() {
        let w = SharedWriter::new(Vec::new());
        w.write_bytes(b"abc").unwrap();
        w.close().unwrap();
        w.close().unwrap();
        assert!(w.write_bytes(b"d").is_err());
    }
}
