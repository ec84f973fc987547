//! Shepherd starts child processes, watches them, and reaps them.
//!
//! A [`Shell`] owns a set of [`Cmd`]s plus temporary files, directories, and a
//! directory stack. Children can report readiness and key/value variables to
//! the parent over their stdout (see [`send_ready`] and [`send_vars`]), and the
//! parent blocks on them with [`Cmd::await_ready`] and [`Cmd::await_vars`].
//! Registered functions can be launched as if they were separate programs by
//! re-executing the current binary, as long as `main` starts with
//! [`init_main`]:
//!
//! ```no_run
//! use shepherd::{RegistryBuilder, Shell, ShellOpts, Signature, Value};
//!
//! fn main() -> shepherd::Result<()> {
//!     let registry = RegistryBuilder::new().register(
//!         "hello",
//!         Signature::new().param(shepherd::ParamType::Str),
//!         |args| {
//!             println!("hello, {}", args.str(0)?);
//!             Ok(Value::Nil)
//!         },
//!     )?;
//!     shepherd::init_main(registry)?;
//!
//!     let sh = Shell::new(ShellOpts::default())?;
//!     let out = sh.fn_cmd("hello", vec!["world".into()])?.output()?.0;
//!     assert_eq!(out, b"hello, world\n");
//!     sh.cleanup()
//! }
//! ```

pub mod child;
pub mod cmd;
pub mod env;
pub mod error;
pub mod output;
pub mod pipe;
pub mod protocol;
pub mod registry;
pub mod shell;
pub mod signal;

pub use child::{init_main, watch_parent};
pub use cmd::Cmd;
pub use error::{Error, Result};
pub use output::{SharedBuffer, SharedWriter, Sink};
pub use pipe::Pipe;
pub use protocol::{send_ready, send_vars};
pub use registry::{Args, ParamType, Registry, RegistryBuilder, Signature, Value, call};
pub use shell::{ErrorPolicy, Shell, ShellOpts};
pub use signal::Signal;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Carries the encoded invocation token to a re-executed child.
pub const ENV_INVOCATION: &str = "SHEPHERD_INVOCATION";
/// Non-empty value makes new shells suppress child output by default.
pub const ENV_SUPPRESS_OUTPUT: &str = "SHEPHERD_SUPPRESS_OUTPUT";
/// Default directory for per-command stdout/stderr log files.
pub const ENV_CHILD_OUTPUT_DIR: &str = "SHEPHERD_CHILD_OUTPUT_DIR";
/// Default directory for binaries produced by [`Shell::build_bin`].
pub const ENV_BIN_DIR: &str = "SHEPHERD_BIN_DIR";

/// Variables consumed by shepherd itself; never forwarded to children.
pub(crate) const RESERVED_VARS: [&str; 4] = [
    ENV_INVOCATION,
    ENV_SUPPRESS_OUTPUT,
    ENV_CHILD_OUTPUT_DIR,
    ENV_BIN_DIR,
];

// A panic on another thread must not wedge cleanup, so poisoning is ignored.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
