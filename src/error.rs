//! Error types shared by the shell, commands, and the function registry.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("already called start")]
    AlreadyStarted,

    #[error("already called wait")]
    AlreadyWaited,

    #[error("not started")]
    NotStarted,

    #[error("already called Shell::cleanup")]
    CleanupCalled,

    #[error("shell has an unhandled error: {0}")]
    ShellErrored(String),

    #[error("already registered: {0}")]
    DuplicateRegistration(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("did not call shepherd::init_main")]
    InitMainNotCalled,

    #[error("shepherd::init_main called more than once")]
    RegistryFrozen,

    #[error("failed to encode invocation: {0}")]
    Encode(String),

    #[error("failed to decode invocation: {0}")]
    Decode(String),

    #[error("{name}: expected {expected} argument(s), got {got}")]
    ArgCount {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("{name}: argument {index} must be {expected}, got {got}")]
    ArgType {
        name: String,
        index: usize,
        expected: &'static str,
        got: &'static str,
    },

    #[error("cannot both set stdin and call stdin_pipe")]
    StdinConflict,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("write on closed pipe")]
    ClosedPipe,

    #[error("{program} exited before {waiting_for}")]
    ProcessExited {
        program: String,
        waiting_for: &'static str,
    },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed: {status}")]
    Exit { program: String, status: ExitStatus },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("dir stack is empty")]
    DirStackEmpty,

    #[error("failed to resolve executable {name}: {source}")]
    Lookup {
        name: String,
        #[source]
        source: which::Error,
    },

    #[error("function failed: {0:#}")]
    Function(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Programming mistakes, as opposed to things going wrong at runtime.
    /// Only these are latched into a shell's error slot.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::AlreadyStarted
                | Error::AlreadyWaited
                | Error::NotStarted
                | Error::CleanupCalled
                | Error::ShellErrored(_)
                | Error::DuplicateRegistration(_)
                | Error::UnknownFunction(_)
                | Error::InitMainNotCalled
                | Error::RegistryFrozen
                | Error::Encode(_)
                | Error::Decode(_)
                | Error::ArgCount { .. }
                | Error::ArgType { .. }
                | Error::StdinConflict
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::ClosedPipe => io::Error::new(io::ErrorKind::BrokenPipe, err),
            other => io::Error::other(other),
        }
    }
}
