//! A single child process and its lifecycle.
//!
//! A [`Cmd`] moves one way through `NotStarted → Started → Waited`. Once
//! started, one thread per output stream copies the child's output to the
//! attached sinks (decoding protocol messages from stdout on the way) and a
//! waiter thread reaps the child. Waiting callers block on a condvar until the
//! condition they need holds or the child is gone.

use crate::env::EnvMap;
use crate::error::{Error, Result};
use crate::lock;
use crate::output::{self, FanOut, LogFile, Parent, SharedBuffer, Sink, Stream};
use crate::pipe::Pipe;
use crate::protocol::{Decoder, Message, Receiver};
use crate::shell::Guard;
use crate::signal::Signal;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Started,
    Waited,
}

/// Per-command options, seeded from the shell's options.
#[derive(Debug, Clone, Default)]
pub(crate) struct CmdOpts {
    pub suppress_output: bool,
    pub output_dir: Option<PathBuf>,
    pub exit_error_is_ok: bool,
}

enum Input {
    Null,
    Bytes(Vec<u8>),
    Pipe(Pipe),
}

struct State {
    phase: Phase,
    args: Vec<String>,
    env: EnvMap,
    opts: CmdOpts,
    stdin: Input,
    stdin_conflict: bool,
    stdout: Vec<Arc<dyn Sink>>,
    stderr: Vec<Arc<dyn Sink>>,
    decoded: Vec<Arc<dyn Sink>>,
    close_after_wait: Vec<Arc<dyn Sink>>,
    pid: Option<u32>,
    ready: bool,
    vars: HashMap<String, String>,
    protocol_err: Option<String>,
    // The child is known to have exited; signals must no longer be sent.
    reaped: bool,
    // Reaped and both output streams drained.
    exited: bool,
    status: Option<std::result::Result<ExitStatus, String>>,
    waiter: Option<JoinHandle<()>>,
}

struct Inner {
    program: PathBuf,
    guard: Arc<Guard>,
    state: Mutex<State>,
    cond: Condvar,
}

/// Handle to one child process. Clones refer to the same command.
#[derive(Clone)]
pub struct Cmd {
    inner: Arc<Inner>,
}

// Everything `wait` takes out of the state in one step.
struct Finished {
    status: Option<std::result::Result<ExitStatus, String>>,
    protocol_err: Option<String>,
    exit_error_is_ok: bool,
    close_after_wait: Vec<Arc<dyn Sink>>,
    waiter: Option<JoinHandle<()>>,
}

impl Cmd {
    pub(crate) fn new(
        guard: Arc<Guard>,
        program: impl Into<PathBuf>,
        args: Vec<String>,
        env: EnvMap,
        opts: CmdOpts,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                program: program.into(),
                guard,
                state: Mutex::new(State {
                    phase: Phase::NotStarted,
                    args,
                    env,
                    opts,
                    stdin: Input::Null,
                    stdin_conflict: false,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    decoded: Vec::new(),
                    close_after_wait: Vec::new(),
                    pid: None,
                    ready: false,
                    vars: HashMap::new(),
                    protocol_err: None,
                    reaped: false,
                    exited: false,
                    status: None,
                    waiter: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    fn name(&self) -> String {
        self.inner.program.display().to_string()
    }

    // Applies a configuration change. Changing a started command is a usage
    // error reported through the shell.
    fn configure(self, f: impl FnOnce(&mut State)) -> Self {
        let mut st = self.state();
        if st.phase == Phase::NotStarted {
            f(&mut *st);
            drop(st);
        } else {
            drop(st);
            self.inner.guard.report(&Error::AlreadyStarted);
        }
        self
    }

    pub fn arg(self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        self.configure(|st| st.args.push(arg))
    }

    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.configure(|st| st.args.extend(args))
    }

    pub fn env(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.configure(|st| {
            st.env.insert(key, value);
        })
    }

    pub fn env_remove(self, key: &str) -> Self {
        self.configure(|st| {
            st.env.remove(key);
        })
    }

    pub fn suppress_output(self, yes: bool) -> Self {
        self.configure(|st| st.opts.suppress_output = yes)
    }

    /// Also write stdout and stderr to log files in `dir`. `None` turns this off.
    pub fn output_dir(self, dir: Option<PathBuf>) -> Self {
        self.configure(|st| st.opts.output_dir = dir)
    }

    /// Treat a non-zero exit as success in `wait`.
    pub fn exit_error_is_ok(self, yes: bool) -> Self {
        self.configure(|st| st.opts.exit_error_is_ok = yes)
    }

    /// Feeds `data` to the child's stdin, then closes it.
    pub fn set_stdin(self, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        self.configure(|st| match st.stdin {
            Input::Pipe(_) => st.stdin_conflict = true,
            _ => st.stdin = Input::Bytes(data),
        })
    }

    pub fn get_program(&self) -> &Path {
        &self.inner.program
    }

    pub fn get_args(&self) -> Vec<String> {
        self.state().args.clone()
    }

    pub fn get_env(&self) -> EnvMap {
        self.state().env.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state().pid
    }

    /// Started and not yet known to have exited.
    pub fn is_running(&self) -> bool {
        let st = self.state();
        st.phase == Phase::Started && !st.reaped
    }

    pub(crate) fn needs_wait(&self) -> bool {
        self.state().phase == Phase::Started
    }

    /// Variables the child has reported so far.
    pub fn reported_vars(&self) -> HashMap<String, String> {
        self.state().vars.clone()
    }

    fn attach(&self, stream: Stream, sink: Arc<dyn Sink>) -> Result<()> {
        let mut st = self.state();
        if st.phase != Phase::NotStarted {
            return Err(Error::AlreadyStarted);
        }
        match stream {
            Stream::Stdout => st.stdout.push(Arc::clone(&sink)),
            Stream::Stderr => st.stderr.push(Arc::clone(&sink)),
        }
        output::push_unique(&mut st.close_after_wait, &sink);
        Ok(())
    }

    /// Attaches a sink to stdout. It is closed once the command is waited.
    pub fn add_stdout(&self, sink: Arc<dyn Sink>) -> Result<()> {
        self.inner.guard.run(|| self.attach(Stream::Stdout, sink))
    }

    pub fn add_stderr(&self, sink: Arc<dyn Sink>) -> Result<()> {
        self.inner.guard.run(|| self.attach(Stream::Stderr, sink))
    }

    /// Attaches a sink that sees stdout with protocol messages removed.
    pub fn add_stdout_decoded(&self, sink: Arc<dyn Sink>) -> Result<()> {
        self.inner.guard.run(|| {
            let mut st = self.state();
            if st.phase != Phase::NotStarted {
                return Err(Error::AlreadyStarted);
            }
            st.decoded.push(Arc::clone(&sink));
            output::push_unique(&mut st.close_after_wait, &sink);
            Ok(())
        })
    }

    /// A new pipe receiving this command's stdout. Each call makes a new pipe;
    /// all of them reach end of stream once the command is waited.
    pub fn stdout_pipe(&self) -> Result<Pipe> {
        self.inner.guard.run(|| {
            let p = Pipe::new();
            self.attach(Stream::Stdout, Arc::new(p.clone()))?;
            Ok(p)
        })
    }

    pub fn stderr_pipe(&self) -> Result<Pipe> {
        self.inner.guard.run(|| {
            let p = Pipe::new();
            self.attach(Stream::Stderr, Arc::new(p.clone()))?;
            Ok(p)
        })
    }

    /// A pipe feeding the child's stdin. Closing it closes the child's stdin.
    pub fn stdin_pipe(&self) -> Result<Pipe> {
        self.inner.guard.run(|| {
            let mut st = self.state();
            if st.phase != Phase::NotStarted {
                return Err(Error::AlreadyStarted);
            }
            let p = Pipe::new();
            match st.stdin {
                Input::Null => st.stdin = Input::Pipe(p.clone()),
                _ => st.stdin_conflict = true,
            }
            Ok(p)
        })
    }

    pub fn start(&self) -> Result<()> {
        self.inner.guard.run(|| self.start_inner())
    }

    /// Blocks until the child calls [`crate::send_ready`].
    pub fn await_ready(&self) -> Result<()> {
        self.inner.guard.run(|| self.await_ready_inner(None))
    }

    pub fn await_ready_timeout(&self, timeout: Duration) -> Result<()> {
        self.inner.guard.run(|| self.await_ready_inner(Some(timeout)))
    }

    /// Blocks until the child has reported every key in `keys`, then returns
    /// exactly those keys and their latest values.
    pub fn await_vars<S: AsRef<str>>(&self, keys: &[S]) -> Result<HashMap<String, String>> {
        self.inner.guard.run(|| self.await_vars_inner(keys, None))
    }

    pub fn await_vars_timeout<S: AsRef<str>>(
        &self,
        keys: &[S],
        timeout: Duration,
    ) -> Result<HashMap<String, String>> {
        self.inner.guard.run(|| self.await_vars_inner(keys, Some(timeout)))
    }

    pub fn wait(&self) -> Result<()> {
        self.inner.guard.run(|| self.wait_inner(None))
    }

    /// Like [`Cmd::wait`], but gives up after `timeout`. A timeout leaves the
    /// command started, so `wait` can be called again.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        self.inner.guard.run(|| self.wait_inner(Some(timeout)))
    }

    pub fn run(&self) -> Result<()> {
        self.inner.guard.run(|| {
            self.start_inner()?;
            self.wait_inner(None)
        })
    }

    /// Runs the command and returns its stdout and stderr.
    pub fn output(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.inner.guard.run(|| {
            let out = SharedBuffer::new();
            let err = SharedBuffer::new();
            self.attach(Stream::Stdout, Arc::new(out.clone()))?;
            self.attach(Stream::Stderr, Arc::new(err.clone()))?;
            self.start_inner()?;
            self.wait_inner(None)?;
            Ok((out.bytes(), err.bytes()))
        })
    }

    /// Runs the command and returns stdout and stderr interleaved in the order
    /// they were read.
    pub fn combined_output(&self) -> Result<Vec<u8>> {
        self.inner.guard.run(|| {
            let buf = SharedBuffer::new();
            let sink: Arc<dyn Sink> = Arc::new(buf.clone());
            self.attach(Stream::Stdout, Arc::clone(&sink))?;
            self.attach(Stream::Stderr, sink)?;
            self.start_inner()?;
            self.wait_inner(None)?;
            Ok(buf.bytes())
        })
    }

    /// Sends `sig` without waiting for the child to exit. Fails once the
    /// shell has been cleaned up.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        self.inner.guard.run(|| {
            drop(self.inner.guard.open()?);
            self.signal_inner(sig)
        })
    }

    /// Sends `sig`, then waits. Any exit status is accepted.
    pub fn terminate(&self, sig: Signal) -> Result<()> {
        self.inner.guard.run(|| {
            drop(self.inner.guard.open()?);
            self.signal_inner(sig)?;
            match self.wait_inner(None) {
                Err(Error::Exit { .. }) => Ok(()),
                res => res,
            }
        })
    }

    pub fn shutdown(&self, sig: Signal) -> Result<()> {
        self.terminate(sig)
    }

    ////////////////////////////////////////
    // Internals, also used by the shell during cleanup.

    pub(crate) fn start_inner(&self) -> Result<()> {
        // Held until the child is tracked, so cleanup cannot miss it.
        let _open = self.inner.guard.open()?;
        let mut st = self.state();
        if st.phase != Phase::NotStarted {
            return Err(Error::AlreadyStarted);
        }
        match self.launch(&mut st) {
            Ok(()) => {
                st.phase = Phase::Started;
                Ok(())
            }
            Err(e) => {
                st.phase = Phase::Waited;
                let sinks = std::mem::take(&mut st.close_after_wait);
                drop(st);
                output::close_all(&sinks);
                log::debug!("{} failed to start: {}", self.name(), e);
                Err(e)
            }
        }
    }

    fn launch(&self, st: &mut State) -> Result<()> {
        if st.stdin_conflict {
            return Err(Error::StdinConflict);
        }
        let program = resolve(&self.inner.program, &st.env)?;

        let mut stdout_sinks: Vec<Arc<dyn Sink>> = Vec::new();
        let mut stderr_sinks: Vec<Arc<dyn Sink>> = Vec::new();
        if !st.opts.suppress_output {
            stdout_sinks.push(Arc::new(Parent(Stream::Stdout)));
            stderr_sinks.push(Arc::new(Parent(Stream::Stderr)));
        }
        if let Some(dir) = st.opts.output_dir.clone() {
            let stamp = output::timestamp();
            for (stream, sinks) in [
                (Stream::Stdout, &mut stdout_sinks),
                (Stream::Stderr, &mut stderr_sinks),
            ] {
                let log: Arc<dyn Sink> = Arc::new(LogFile::create(&dir, &program, &stamp, stream)?);
                sinks.push(Arc::clone(&log));
                output::push_unique(&mut st.close_after_wait, &log);
            }
        }
        stdout_sinks.extend(st.stdout.iter().cloned());
        stderr_sinks.extend(st.stderr.iter().cloned());
        let receiver: Arc<dyn Receiver> = self.inner.clone();
        stdout_sinks.push(Arc::new(Decoder::new(receiver, st.decoded.clone())));

        let input = std::mem::replace(&mut st.stdin, Input::Null);
        let mut command = Command::new(&program);
        command
            .args(&st.args)
            .env_clear()
            .envs(&st.env)
            .stdin(match input {
                Input::Null => Stdio::null(),
                _ => Stdio::piped(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        log::debug!("Started {} (PID {}) {:?}", program.display(), pid, st.args);

        match self.spawn_threads(&mut child, pid, stdout_sinks, stderr_sinks, input) {
            Ok(readers) => {
                let inner = Arc::clone(&self.inner);
                let waiter = thread::Builder::new()
                    .name(format!("shepherd-wait-{}", pid))
                    .spawn(move || inner.reap(child, pid, readers));
                match waiter {
                    Ok(handle) => {
                        st.pid = Some(pid);
                        st.waiter = Some(handle);
                        Ok(())
                    }
                    // The waiter closure owned the child; it was dropped
                    // unreaped, so kill it through its pid.
                    Err(e) => {
                        let _ = Signal::Kill.send(pid);
                        Err(e.into())
                    }
                }
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e.into())
            }
        }
    }

    fn spawn_threads(
        &self,
        child: &mut Child,
        pid: u32,
        stdout_sinks: Vec<Arc<dyn Sink>>,
        stderr_sinks: Vec<Arc<dyn Sink>>,
        input: Input,
    ) -> io::Result<Vec<JoinHandle<()>>> {
        let mut readers = Vec::with_capacity(2);
        let name = self.name();
        if let Some(out) = child.stdout.take() {
            let fan = FanOut::new(format!("{} stdout", name), stdout_sinks);
            readers.push(
                thread::Builder::new()
                    .name(format!("shepherd-stdout-{}", pid))
                    .spawn(move || fan.pump(out))?,
            );
        }
        if let Some(err) = child.stderr.take() {
            let fan = FanOut::new(format!("{} stderr", name), stderr_sinks);
            readers.push(
                thread::Builder::new()
                    .name(format!("shepherd-stderr-{}", pid))
                    .spawn(move || fan.pump(err))?,
            );
        }
        // Not joined: a stdin pipe nobody closes must not hold up wait.
        if let Some(mut stdin) = child.stdin.take() {
            let feed = thread::Builder::new().name(format!("shepherd-stdin-{}", pid));
            match input {
                Input::Bytes(data) => {
                    feed.spawn(move || {
                        if let Err(e) = stdin.write_all(&data) {
                            log::debug!("PID {}: stdin write stopped: {}", pid, e);
                        }
                    })?;
                }
                Input::Pipe(mut pipe) => {
                    feed.spawn(move || {
                        if let Err(e) = io::copy(&mut pipe, &mut stdin) {
                            log::debug!("PID {}: stdin copy stopped: {}", pid, e);
                        }
                    })?;
                }
                Input::Null => {}
            }
        }
        Ok(readers)
    }

    // Blocks until `poll` yields a result or the deadline passes.
    fn block_on<T>(
        &self,
        timeout: Option<Duration>,
        mut poll: impl FnMut(&mut State) -> Option<Result<T>>,
    ) -> Result<T> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut st = self.state();
        loop {
            if let Some(res) = poll(&mut *st) {
                return res;
            }
            st = match deadline {
                None => self
                    .inner
                    .cond
                    .wait(st)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout(timeout.unwrap_or_default()));
                    }
                    self.inner
                        .cond
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn await_ready_inner(&self, timeout: Option<Duration>) -> Result<()> {
        let name = self.name();
        self.block_on(timeout, |st| {
            if let Some(err) = phase_error(st.phase) {
                return Some(Err(err));
            }
            if st.ready {
                return Some(Ok(()));
            }
            pending_error(st, &name, "ready").map(Err)
        })
    }

    fn await_vars_inner<S: AsRef<str>>(
        &self,
        keys: &[S],
        timeout: Option<Duration>,
    ) -> Result<HashMap<String, String>> {
        let name = self.name();
        self.block_on(timeout, |st| {
            if let Some(err) = phase_error(st.phase) {
                return Some(Err(err));
            }
            let found: HashMap<String, String> = keys
                .iter()
                .filter_map(|k| {
                    let k = k.as_ref();
                    st.vars.get(k).map(|v| (k.to_string(), v.clone()))
                })
                .collect();
            // Duplicate keys collapse, so compare against the distinct count.
            let mut wanted: Vec<&str> = keys.iter().map(AsRef::as_ref).collect();
            wanted.sort_unstable();
            wanted.dedup();
            if found.len() == wanted.len() {
                return Some(Ok(found));
            }
            pending_error(st, &name, "vars").map(Err)
        })
    }

    pub(crate) fn wait_inner(&self, timeout: Option<Duration>) -> Result<()> {
        let finished = self.block_on(timeout, |st| match st.phase {
            Phase::NotStarted => Some(Err(Error::NotStarted)),
            Phase::Waited => Some(Err(Error::AlreadyWaited)),
            Phase::Started if !st.exited => None,
            Phase::Started => {
                st.phase = Phase::Waited;
                Some(Ok(Finished {
                    status: st.status.take(),
                    protocol_err: st.protocol_err.clone(),
                    exit_error_is_ok: st.opts.exit_error_is_ok,
                    close_after_wait: std::mem::take(&mut st.close_after_wait),
                    waiter: st.waiter.take(),
                }))
            }
        })?;

        if let Some(handle) = finished.waiter {
            if handle.join().is_err() {
                log::error!("{}: waiter thread panicked", self.name());
            }
        }
        output::close_all(&finished.close_after_wait);

        match finished.status {
            Some(Ok(status)) if !status.success() && !finished.exit_error_is_ok => Err(Error::Exit {
                program: self.name(),
                status,
            }),
            Some(Ok(_)) => match finished.protocol_err {
                Some(msg) => Err(Error::Protocol(msg)),
                None => Ok(()),
            },
            Some(Err(msg)) => Err(Error::Io(io::Error::other(msg))),
            None => Err(Error::Io(io::Error::other("exit status lost"))),
        }
    }

    pub(crate) fn signal_inner(&self, sig: Signal) -> Result<()> {
        let st = self.state();
        if let Some(err) = phase_error(st.phase) {
            return Err(err);
        }
        let Some(pid) = st.pid else {
            return Err(Error::NotStarted);
        };
        if st.reaped {
            log::debug!("{} (PID {}) already exited, not sending {}", self.name(), pid, sig);
            return Ok(());
        }
        // Sent under the lock so the waiter cannot reap the pid in between.
        log::debug!("Sending {} to {} (PID {})", sig, self.name(), pid);
        sig.send(pid)?;
        Ok(())
    }
}

fn phase_error(phase: Phase) -> Option<Error> {
    match phase {
        Phase::NotStarted => Some(Error::NotStarted),
        Phase::Waited => Some(Error::AlreadyWaited),
        Phase::Started => None,
    }
}

// Why an unmet await condition can never be met.
fn pending_error(st: &State, program: &str, waiting_for: &'static str) -> Option<Error> {
    if let Some(msg) = &st.protocol_err {
        return Some(Error::Protocol(msg.clone()));
    }
    if st.exited {
        return Some(Error::ProcessExited {
            program: program.to_string(),
            waiting_for,
        });
    }
    None
}

/// Bare names are looked up in the command's own PATH.
fn resolve(program: &Path, env: &EnvMap) -> Result<PathBuf> {
    if program.is_absolute() || program.components().count() > 1 {
        return Ok(program.to_path_buf());
    }
    let lookup = |source| Error::Lookup {
        name: program.display().to_string(),
        source,
    };
    match env.get("PATH") {
        Some(path) => {
            let cwd = std::env::current_dir()?;
            which::which_in(program, Some(path), cwd).map_err(lookup)
        }
        None => which::which(program).map_err(lookup),
    }
}

// Waits for `pid` to exit without reaping it, so the pid stays valid for
// signals until the waiter reaps it.
fn wait_for_exit(pid: u32) -> io::Result<()> {
    let id = libc::id_t::from(pid);
    loop {
        // SAFETY: siginfo_t is plain data; waitid only writes into it.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::waitid(libc::P_PID, id, &mut info, libc::WEXITED | libc::WNOWAIT) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

impl Inner {
    fn reap(&self, mut child: Child, pid: u32, readers: Vec<JoinHandle<()>>) {
        if let Err(e) = wait_for_exit(pid) {
            log::warn!("waitid({}) failed: {}", pid, e);
        }
        lock(&self.state).reaped = true;
        let status = child.wait().map_err(|e| e.to_string());
        for reader in readers {
            if reader.join().is_err() {
                log::error!("{}: output thread panicked", self.program.display());
            }
        }
        match &status {
            Ok(s) => log::debug!("{} (PID {}) exited: {}", self.program.display(), pid, s),
            Err(e) => log::warn!("{} (PID {}): wait failed: {}", self.program.display(), pid, e),
        }
        let mut st = lock(&self.state);
        st.status = Some(status);
        st.exited = true;
        self.cond.notify_all();
    }
}

impl Receiver for Inner {
    fn on_message(&self, msg: Message) {
        let mut st = lock(&self.state);
        match msg {
            Message::Ready => st.ready = true,
            Message::Vars(vars) => st.vars.extend(vars),
        }
        self.cond.notify_all();
    }

    fn on_error(&self, err: Error) {
        log::warn!("{}: {}", self.program.display(), err);
        let mut st = lock(&self.state);
        if st.protocol_err.is_none() {
            st.protocol_err = Some(match err {
                Error::Protocol(msg) => msg,
                other => other.to_string(),
            });
        }
        self.cond.notify_all();
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("Cmd")
            .field("program", &self.inner.program)
            .field("args", &st.args)
            .field("phase", &st.phase)
            .field("pid", &st.pid)
            .finish()
    }
}
