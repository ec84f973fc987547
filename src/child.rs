//! Entry point for re-executed children.

use crate::ENV_INVOCATION;
use crate::error::{Error, Result};
use crate::registry::{self, Invocation, Registry, RegistryBuilder};
use std::io::{self, Write};
use std::process;
use std::thread;
use std::time::Duration;

/// Freezes `registry` as this process's function registry. Must run at the
/// very top of `main`, before arguments are parsed or threads are spawned.
///
/// In a process started by [`crate::Shell::fn_cmd`] this never returns: it runs
/// the requested function and exits with status 0, or 1 if the invocation
/// cannot be decoded or the function fails. While the function runs, the
/// child exits once its parent is gone (see [`watch_parent`]). It installs no
/// signal handlers of its own: SIGINT, SIGTERM, SIGHUP and SIGQUIT keep their
/// default dispositions and end the child right away, unless the function
/// installs handlers itself (creating a [`crate::Shell`] does).
pub fn init_main(registry: RegistryBuilder) -> Result<()> {
    let registry = registry::install(registry.build())?;
    let Some(token) = std::env::var_os(ENV_INVOCATION) else {
        return Ok(());
    };
    // SAFETY: runs first thing in main, while the process is single-threaded.
    unsafe { std::env::remove_var(ENV_INVOCATION) };
    watch_parent();

    let code = match dispatch(registry, token.to_str()) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("shepherd: {}", e);
            1
        }
    };
    let _ = io::stdout().flush();
    process::exit(code)
}

fn dispatch(registry: &Registry, token: Option<&str>) -> Result<()> {
    let token = token.ok_or_else(|| Error::Decode("token is not valid UTF-8".to_string()))?;
    let inv = Invocation::decode(token)?;
    log::debug!("Running registered function {}", inv.name);
    let result = registry.call(&inv.name, inv.args)?;
    if !result.is_nil() {
        log::debug!("{} returned {}", inv.name, result);
    }
    Ok(())
}

/// Exits this process once its parent is gone, checking once a second.
pub fn watch_parent() {
    // SAFETY: getppid cannot fail and has no preconditions.
    let parent = unsafe { libc::getppid() };
    let spawned = thread::Builder::new()
        .name("shepherd-watch-parent".to_string())
        .spawn(move || {
            loop {
                thread::sleep(Duration::from_secs(1));
                if unsafe { libc::getppid() } != parent {
                    log::error!("Parent process {} has exited", parent);
                    process::exit(1);
                }
            }
        });
    if let Err(e) = spawned {
        log::warn!("Cannot watch parent process: {}", e);
    }
}
