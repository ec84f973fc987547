//! The [`Shell`]: owner of commands and temporary resources.
//!
//! Every command, temp file, temp dir and `pushd` made through a shell is
//! undone by [`Shell::cleanup`], which also runs when the last handle is
//! dropped and when the process receives SIGINT, SIGTERM or SIGHUP.

use crate::cmd::{Cmd, CmdOpts};
use crate::env::{self, EnvMap};
use crate::error::{Error, Result};
use crate::lock;
use crate::registry::{self, Invocation, Value};
use crate::signal::{self, Signal, Teardown};
use crate::{ENV_BIN_DIR, ENV_CHILD_OUTPUT_DIR, ENV_INVOCATION, ENV_SUPPRESS_OUTPUT};
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempDir};

/// What happens when a shell or command call fails.
///
/// Under every policy, usage errors (see [`Error::is_usage`]) are latched into
/// the shell; later calls fail with [`Error::ShellErrored`] until
/// [`Shell::clear_err`].
#[derive(Clone, Default)]
pub enum ErrorPolicy {
    /// Return the error to the caller.
    #[default]
    Return,
    /// Panic with the error, e.g. to fail a test on the spot.
    Panic,
    /// Call the hook, then return the error.
    Hook(Arc<dyn Fn(&Error) + Send + Sync>),
}

impl ErrorPolicy {
    pub fn hook(f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        ErrorPolicy::Hook(Arc::new(f))
    }
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Return => f.write_str("Return"),
            ErrorPolicy::Panic => f.write_str("Panic"),
            ErrorPolicy::Hook(_) => f.write_str("Hook(..)"),
        }
    }
}

/// Error slot and cleanup gate shared by a shell and its commands.
pub(crate) struct Guard {
    policy: ErrorPolicy,
    slot: Mutex<Option<String>>,
    // Set once cleanup starts. Held by `Cmd::start` for the whole launch, so a
    // start either finishes before cleanup looks at the commands or fails.
    closed: Mutex<bool>,
}

impl Guard {
    pub(crate) fn new(policy: ErrorPolicy) -> Self {
        Self {
            policy,
            slot: Mutex::new(None),
            closed: Mutex::new(false),
        }
    }

    /// Fails with [`Error::CleanupCalled`] once cleanup has started. The
    /// returned lock keeps cleanup from starting while it is held.
    pub(crate) fn open(&self) -> Result<MutexGuard<'_, bool>> {
        let closed = lock(&self.closed);
        if *closed {
            return Err(Error::CleanupCalled);
        }
        Ok(closed)
    }

    // Waits for any start in progress to finish.
    fn close(&self) {
        *lock(&self.closed) = true;
    }

    /// Runs `f` unless an error is latched, then applies the policy to any error.
    pub(crate) fn run<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let latched = lock(&self.slot).clone();
        let res = match latched {
            Some(msg) => Err(Error::ShellErrored(msg)),
            None => f(),
        };
        if let Err(e) = &res {
            self.report(e);
        }
        res
    }

    pub(crate) fn report(&self, err: &Error) {
        if err.is_usage() && !matches!(err, Error::ShellErrored(_)) {
            let mut slot = lock(&self.slot);
            if slot.is_none() {
                *slot = Some(err.to_string());
            }
        }
        match &self.policy {
            ErrorPolicy::Return => {}
            ErrorPolicy::Panic => panic!("shepherd: {}", err),
            ErrorPolicy::Hook(f) => f(err),
        }
    }

    pub(crate) fn err(&self) -> Option<String> {
        lock(&self.slot).clone()
    }

    pub(crate) fn clear(&self) {
        *lock(&self.slot) = None;
    }
}

/// Shell configuration. `None` fields fall back to the `SHEPHERD_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct ShellOpts {
    pub error_policy: ErrorPolicy,
    /// Don't copy child output to this process's stdout and stderr.
    /// Defaults to whether `SHEPHERD_SUPPRESS_OUTPUT` is non-empty.
    pub suppress_output: Option<bool>,
    /// Directory for per-command log files. Defaults to
    /// `SHEPHERD_CHILD_OUTPUT_DIR`; unset means no log files.
    pub output_dir: Option<PathBuf>,
    /// Where [`Shell::build_bin`] puts binaries. Defaults to
    /// `SHEPHERD_BIN_DIR`, then to a temp dir owned by the shell.
    pub bin_dir: Option<PathBuf>,
    /// How long cleanup waits after SIGINT before reporting survivors.
    pub term_grace: Duration,
    /// How much longer it waits before sending SIGKILL.
    pub kill_grace: Duration,
}

impl Default for ShellOpts {
    fn default() -> Self {
        Self {
            error_policy: ErrorPolicy::Return,
            suppress_output: None,
            output_dir: None,
            bin_dir: None,
            term_grace: Duration::from_millis(100),
            kill_grace: Duration::from_secs(1),
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

struct Settings {
    suppress_output: bool,
    output_dir: Option<PathBuf>,
    bin_dir: Option<PathBuf>,
    term_grace: Duration,
    kill_grace: Duration,
}

type Handler = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    cleaned: bool,
    vars: EnvMap,
    args: Vec<String>,
    cmds: Vec<Cmd>,
    temp_files: Vec<NamedTempFile>,
    temp_dirs: Vec<TempDir>,
    bin_dir: Option<PathBuf>,
    dir_stack: Vec<PathBuf>,
    handlers: Vec<Handler>,
}

struct ShellInner {
    settings: Settings,
    guard: Arc<Guard>,
    state: Mutex<State>,
    // Held for the whole cleanup, so a termination signal arriving midway
    // waits for it instead of exiting early.
    cleanup_lock: Mutex<()>,
}

/// Owns child processes and temporary resources. Clones share the same shell.
#[derive(Clone)]
pub struct Shell {
    inner: Arc<ShellInner>,
}

impl Shell {
    pub fn new(opts: ShellOpts) -> Result<Self> {
        let settings = Settings {
            suppress_output: opts
                .suppress_output
                .unwrap_or_else(|| env::flag(ENV_SUPPRESS_OUTPUT)),
            output_dir: opts.output_dir.or_else(|| env_path(ENV_CHILD_OUTPUT_DIR)),
            bin_dir: opts.bin_dir.or_else(|| env_path(ENV_BIN_DIR)),
            term_grace: opts.term_grace,
            kill_grace: opts.kill_grace,
        };
        if let Some(dir) = &settings.output_dir {
            fs::create_dir_all(dir)?;
        }
        let inner = Arc::new(ShellInner {
            settings,
            guard: Arc::new(Guard::new(opts.error_policy)),
            state: Mutex::new(State {
                vars: env::inherited(),
                ..State::default()
            }),
            cleanup_lock: Mutex::new(()),
        });
        let weak = Arc::downgrade(&inner);
        let weak: Weak<dyn Teardown> = weak;
        signal::watch(weak);
        log::debug!("New shell");
        Ok(Self { inner })
    }

    // Runs `f` on the shell state, failing once cleanup has been called.
    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        self.inner.guard.run(|| {
            let mut st = self.state();
            if st.cleaned {
                return Err(Error::CleanupCalled);
            }
            f(&mut *st)
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    /// The latched usage error, if any.
    pub fn err(&self) -> Option<String> {
        self.inner.guard.err()
    }

    pub fn clear_err(&self) {
        self.inner.guard.clear()
    }

    pub fn set_var(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        self.with_state(|st| {
            st.vars.insert(key, value);
            Ok(())
        })
    }

    pub fn unset_var(&self, key: &str) -> Result<()> {
        self.with_state(|st| {
            st.vars.remove(key);
            Ok(())
        })
    }

    pub fn var(&self, key: &str) -> Option<String> {
        self.state().vars.get(key).cloned()
    }

    /// Variables new commands start from.
    pub fn vars(&self) -> EnvMap {
        self.state().vars.clone()
    }

    /// Appends `args` to every command created from now on.
    pub fn append_args<I, S>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.with_state(|st| {
            st.args.extend(args);
            Ok(())
        })
    }

    fn new_cmd(&self, st: &mut State, vars: EnvMap, program: PathBuf, mut args: Vec<String>) -> Cmd {
        args.extend(st.args.iter().cloned());
        let env = env::merge([&st.vars, &vars]);
        let opts = CmdOpts {
            suppress_output: self.inner.settings.suppress_output,
            output_dir: self.inner.settings.output_dir.clone(),
            exit_error_is_ok: false,
        };
        let cmd = Cmd::new(Arc::clone(&self.inner.guard), program, args, env, opts);
        st.cmds.push(cmd.clone());
        cmd
    }

    /// A command running `program`. Bare names are looked up in `PATH` at start.
    pub fn cmd<I, S>(&self, program: impl Into<PathBuf>, args: I) -> Result<Cmd>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd_with_env(EnvMap::new(), program, args)
    }

    /// Like [`Shell::cmd`], with `vars` layered over the shell's variables.
    pub fn cmd_with_env<I, S>(&self, vars: EnvMap, program: impl Into<PathBuf>, args: I) -> Result<Cmd>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = program.into();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.with_state(|st| Ok(self.new_cmd(st, vars, program, args)))
    }

    /// A command that runs the registered function `name` in a re-executed copy
    /// of this binary. Arguments are checked here, before anything is spawned.
    pub fn fn_cmd(&self, name: &str, args: Vec<Value>) -> Result<Cmd> {
        self.fn_cmd_with_env(EnvMap::new(), name, args)
    }

    pub fn fn_cmd_with_env(&self, mut vars: EnvMap, name: &str, args: Vec<Value>) -> Result<Cmd> {
        self.with_state(|st| {
            let args = registry::global()?.check(name, args)?;
            let token = Invocation::new(name, args).encode()?;
            let exe = std::env::current_exe()?;
            vars.insert(ENV_INVOCATION.to_string(), token);
            Ok(self.new_cmd(st, vars, exe, Vec::new()))
        })
    }

    /// Waits for every started command that has not been waited yet. Failures
    /// are logged; the first one is returned.
    pub fn wait(&self) -> Result<()> {
        let cmds = self.with_state(|st| Ok(st.cmds.clone()))?;
        self.inner.guard.run(|| {
            let mut first = None;
            for c in cmds.iter().filter(|c| c.needs_wait()) {
                if let Err(e) = c.wait_inner(None) {
                    log::warn!("{} (PID {:?}) failed: {}", c.get_program().display(), c.pid(), e);
                    first.get_or_insert(e);
                }
            }
            first.map_or(Ok(()), Err)
        })
    }

    pub fn pushd(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        self.with_state(|st| {
            let cwd = std::env::current_dir()?;
            std::env::set_current_dir(dir)?;
            log::debug!("pushd {}", dir.display());
            st.dir_stack.push(cwd);
            Ok(())
        })
    }

    pub fn popd(&self) -> Result<()> {
        self.with_state(|st| {
            let dir = st.dir_stack.last().ok_or(Error::DirStackEmpty)?;
            std::env::set_current_dir(dir)?;
            log::debug!("popd {}", dir.display());
            st.dir_stack.pop();
            Ok(())
        })
    }

    /// Creates a temp file, deleted by cleanup. Returns an open handle and its path.
    pub fn make_temp_file(&self) -> Result<(File, PathBuf)> {
        self.with_state(|st| {
            let f = NamedTempFile::new()?;
            let handle = f.as_file().try_clone()?;
            let path = f.path().to_path_buf();
            st.temp_files.push(f);
            Ok((handle, path))
        })
    }

    /// Creates a temp dir, deleted with its contents by cleanup.
    pub fn make_temp_dir(&self) -> Result<PathBuf> {
        self.with_state(|st| {
            let dir = TempDir::new()?;
            let path = dir.path().to_path_buf();
            st.temp_dirs.push(dir);
            Ok(path)
        })
    }

    /// Registers `f` to run at the end of cleanup. Handlers run last-in first-out.
    pub fn add_cleanup_handler(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.with_state(|st| {
            st.handlers.push(Box::new(f));
            Ok(())
        })
    }

    fn bin_dir(&self, st: &mut State) -> Result<PathBuf> {
        if let Some(dir) = self.inner.settings.bin_dir.clone().or_else(|| st.bin_dir.clone()) {
            fs::create_dir_all(&dir)?;
            return Ok(dir);
        }
        let dir = tempfile::Builder::new().prefix("shepherd-bin-").tempdir()?;
        let path = dir.path().to_path_buf();
        st.temp_dirs.push(dir);
        st.bin_dir = Some(path.clone());
        Ok(path)
    }

    /// Builds binary `bin` of the Cargo package at `manifest_dir` into the bin
    /// dir and returns its path. An existing binary of that name is reused.
    pub fn build_bin(&self, manifest_dir: impl AsRef<Path>, bin: &str) -> Result<PathBuf> {
        let manifest = manifest_dir.as_ref().join("Cargo.toml");
        let (bin_dir, dest) = self.with_state(|st| {
            let dir = self.bin_dir(st)?;
            let dest = dir.join(bin);
            Ok((dir, dest))
        })?;
        if dest.exists() {
            log::debug!("Reusing {}", dest.display());
            return Ok(dest);
        }
        // Build into a private target dir, then move the binary into place.
        let target = tempfile::Builder::new().prefix(".build-").tempdir_in(&bin_dir)?;
        let args = vec![
            "build".to_string(),
            "--quiet".to_string(),
            "--manifest-path".to_string(),
            manifest.display().to_string(),
            "--bin".to_string(),
            bin.to_string(),
            "--target-dir".to_string(),
            target.path().display().to_string(),
        ];
        let cmd = self.with_state(|st| Ok(self.new_cmd(st, EnvMap::new(), PathBuf::from("cargo"), args)))?;
        self.inner.guard.run(|| {
            cmd.start_inner()?;
            cmd.wait_inner(None)?;
            move_file(&target.path().join("debug").join(bin), &dest)?;
            Ok(())
        })?;
        log::debug!("Built {}", dest.display());
        Ok(dest)
    }

    /// Tears everything down: stops running commands (SIGINT, then SIGKILL),
    /// deletes temp files and dirs, returns to the directory the first `pushd`
    /// left, and runs cleanup handlers. Failures are logged, never returned.
    /// Runs even with an error latched; a second call is an error.
    pub fn cleanup(&self) -> Result<()> {
        if self.inner.cleanup_once() {
            Ok(())
        } else {
            let err = Error::CleanupCalled;
            self.inner.guard.report(&err);
            Err(err)
        }
    }
}

impl fmt::Debug for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("Shell")
            .field("cmds", &st.cmds.len())
            .field("cleaned", &st.cleaned)
            .finish()
    }
}

// Rename, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

// Polls until no command in `cmds` is running or `grace` elapses. Returns the
// ones still running.
fn settle(cmds: &[Cmd], grace: Duration) -> Vec<&Cmd> {
    let deadline = Instant::now() + grace;
    loop {
        let running: Vec<&Cmd> = cmds.iter().filter(|c| c.is_running()).collect();
        if running.is_empty() || Instant::now() >= deadline {
            return running;
        }
        thread::sleep(Duration::from_millis(10).min(deadline.saturating_duration_since(Instant::now())));
    }
}

impl ShellInner {
    fn terminate_running(&self, cmds: &[Cmd]) {
        let running: Vec<&Cmd> = cmds.iter().filter(|c| c.is_running()).collect();
        if running.is_empty() {
            return;
        }
        for c in &running {
            if let Err(e) = c.signal_inner(Signal::Interrupt) {
                log::warn!("{} (PID {:?}): sending SIGINT failed: {}", c.get_program().display(), c.pid(), e);
            }
        }
        let survivors = settle(cmds, self.settings.term_grace);
        if survivors.is_empty() {
            return;
        }
        for c in &survivors {
            log::warn!("{} (PID {:?}) did not exit after SIGINT", c.get_program().display(), c.pid());
        }
        let survivors = settle(cmds, self.settings.kill_grace);
        if survivors.is_empty() {
            return;
        }
        for c in &survivors {
            if let Err(e) = c.signal_inner(Signal::Kill) {
                log::warn!("{} (PID {:?}): sending SIGKILL failed: {}", c.get_program().display(), c.pid(), e);
            }
        }
        log::warn!("Killed {} remaining child process(es)", survivors.len());
    }

    // Returns false if cleanup had already run.
    fn cleanup_once(&self) -> bool {
        let held = lock(&self.cleanup_lock);
        self.cleanup_held(&held)
    }

    // Caller holds `cleanup_lock`.
    fn cleanup_held(&self, _held: &MutexGuard<'_, ()>) -> bool {
        let (cmds, temp_files, temp_dirs, dir_stack, handlers) = {
            let mut st = lock(&self.state);
            if st.cleaned {
                return false;
            }
            st.cleaned = true;
            (
                st.cmds.clone(),
                std::mem::take(&mut st.temp_files),
                std::mem::take(&mut st.temp_dirs),
                std::mem::take(&mut st.dir_stack),
                std::mem::take(&mut st.handlers),
            )
        };
        self.guard.close();
        log::debug!("Cleaning up {} command(s)", cmds.len());

        self.terminate_running(&cmds);
        for f in temp_files {
            let path = f.path().to_path_buf();
            if let Err(e) = f.close() {
                log::warn!("Removing {} failed: {}", path.display(), e);
            }
        }
        for d in temp_dirs {
            let path = d.path().to_path_buf();
            if let Err(e) = d.close() {
                log::warn!("Removing {} failed: {}", path.display(), e);
            }
        }
        if let Some(dir) = dir_stack.first() {
            if let Err(e) = std::env::set_current_dir(dir) {
                log::warn!("chdir {} failed: {}", dir.display(), e);
            }
        }
        for handler in handlers.into_iter().rev() {
            handler();
        }
        true
    }
}

impl Teardown for ShellInner {
    fn teardown(&self) -> MutexGuard<'_, ()> {
        let held = lock(&self.cleanup_lock);
        self.cleanup_held(&held);
        held
    }
}

impl Drop for ShellInner {
    fn drop(&mut self) {
        let cleaned = lock(&self.state).cleaned;
        if !cleaned {
            log::warn!("Shell dropped without cleanup; cleaning up now");
            self.cleanup_once();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quiet() -> Shell {
        Shell::new(ShellOpts {
            suppress_output: Some(true),
            ..ShellOpts::default()
        })
        .unwrap()
    }

    #[test]
    fn test_guard_latches_usage_errors_only() {
        let g = Guard::new(ErrorPolicy::Return);
        let _ = g.run::<()>(|| Err(Error::Timeout(Duration::from_millis(1))));
        assert!(g.err().is_none());
        let _ = g.run::<()>(|| Err(Error::NotStarted));
        assert_eq!(g.err().as_deref(), Some("not started"));
        assert!(matches!(g.run(|| Ok(())), Err(Error::ShellErrored(_))));
        g.clear();
        assert!(g.run(|| Ok(())).is_ok());
    }

    #[test]
    fn test_hook_policy() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let g = Guard::new(ErrorPolicy::hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let _ = g.run::<()>(|| Err(Error::DirStackEmpty));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "shepherd: not started")]
    fn test_panic_policy() {
        let g = Guard::new(ErrorPolicy::Panic);
        let _ = g.run::<()>(|| Err(Error::NotStarted));
    }

    #[test]
    fn test_vars_and_args_flow_into_commands() {
        let sh = quiet();
        sh.set_var("SHEPHERD_TEST_A", "shell").unwrap();
        sh.set_var("SHEPHERD_TEST_B", "shell").unwrap();
        sh.append_args(["extra"]).unwrap();
        let mut per_call = EnvMap::new();
        per_call.insert("SHEPHERD_TEST_B".to_string(), "call".to_string());
        let c = sh.cmd_with_env(per_call, "echo", ["first"]).unwrap();
        let env = c.get_env();
        assert_eq!(env.get("SHEPHERD_TEST_A").map(String::as_str), Some("shell"));
        assert_eq!(env.get("SHEPHERD_TEST_B").map(String::as_str), Some("call"));
        assert_eq!(c.get_args(), vec!["first", "extra"]);
        sh.cleanup().unwrap();
    }

    #[test]
    fn test_cleanup_twice() {
        let sh = quiet();
        sh.cleanup().unwrap();
        assert!(matches!(sh.cleanup(), Err(Error::CleanupCalled)));
    }

    #[test]
    fn test_cleanup_handlers_run_lifo() {
        let sh = quiet();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            sh.add_cleanup_handler(move || lock(&order).push(i)).unwrap();
        }
        sh.cleanup().unwrap();
        assert_eq!(*lock(&order), vec![2, 1, 0]);
    }

    #[test]
    fn test_temp_resources_are_removed() {
        let sh = quiet();
        let (_, file) = sh.make_temp_file().unwrap();
        let dir = sh.make_temp_dir().unwrap();
        fs::write(dir.join("x"), "x").unwrap();
        assert!(file.exists() && dir.exists());
        sh.cleanup().unwrap();
        assert!(!file.exists());
        assert!(!dir.exists());
        assert!(matches!(sh.make_temp_dir(), Err(Error::CleanupCalled)));
    }

    #[test]
    fn test_drop_runs_cleanup() {
        let sh = quiet();
        let dir = sh.make_temp_dir().unwrap();
        drop(sh);
        assert!(!dir.exists());
    }
}
