//! POSIX signals: delivery to children and the process-wide termination
//! listener that tears down live shells.
//!
//! The listener covers SIGINT, SIGTERM and SIGHUP. SIGQUIT keeps its default
//! disposition: it core-dumps this process without cleaning up, and children
//! are left to notice through [`crate::watch_parent`] or a closed pipe.

use crate::lock;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, Once, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
    Hangup,
    Quit,
    User1,
    User2,
}

impl Signal {
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Hangup => libc::SIGHUP,
            Signal::Quit => libc::SIGQUIT,
            Signal::User1 => libc::SIGUSR1,
            Signal::User2 => libc::SIGUSR2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Hangup => "SIGHUP",
            Signal::Quit => "SIGQUIT",
            Signal::User1 => "SIGUSR1",
            Signal::User2 => "SIGUSR2",
        }
    }

    /// Sends the signal to `pid`. The caller guarantees `pid` is a child that
    /// has not been reaped yet.
    pub fn send(self, pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: kill has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, self.as_raw()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Something to tear down when the process receives a termination signal.
pub(crate) trait Teardown: Send + Sync {
    /// Tears down, returning a lock that keeps anyone else from starting a
    /// teardown of the same target.
    fn teardown(&self) -> MutexGuard<'_, ()>;
}

static LIVE: Mutex<Vec<Weak<dyn Teardown>>> = Mutex::new(Vec::new());
static INSTALL: Once = Once::new();
static FIRED: AtomicBool = AtomicBool::new(false);

/// Tracks `target` until it is dropped. The first call installs the handler
/// for SIGINT, SIGTERM and SIGHUP.
pub(crate) fn watch(target: Weak<dyn Teardown>) {
    INSTALL.call_once(|| {
        if let Err(e) = ctrlc::set_handler(on_termination) {
            log::warn!("Cannot install termination handler, children may leak on exit: {}", e);
        }
    });
    let mut live = lock(&LIVE);
    live.retain(|w| w.strong_count() > 0);
    live.push(target);
}

fn on_termination() {
    if FIRED.swap(true, Ordering::SeqCst) {
        return;
    }
    log::info!("Termination signal received, cleaning up");
    let targets: Vec<_> = lock(&LIVE).iter().filter_map(Weak::upgrade).collect();
    // Held until exit, so a concurrent `Shell::cleanup` blocks instead of
    // failing with `CleanupCalled`.
    let _held: Vec<_> = targets.iter().map(|t| t.teardown()).collect();
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_names() {
        assert_eq!(Signal::Interrupt.to_string(), "SIGINT");
        assert_eq!(Signal::Kill.as_raw(), libc::SIGKILL);
    }

    #[test]
    fn test_send_to_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        Signal::Terminate.send(child.id()).unwrap();
        let status = child.wait().unwrap();
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }
}
