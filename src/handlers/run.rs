use anyhow::{Result, bail};
use colored::*;
use log::info;
use shepherd::{Error, Shell, ShellOpts, Signal};
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub struct RunArgs {
    pub output_dir: Option<PathBuf>,
    pub quiet: bool,
    pub await_ready: bool,
    pub await_vars: Vec<String>,
    pub timeout: Option<u64>,
    pub command: Vec<String>,
}

pub fn handle_run(args: RunArgs) -> Result<()> {
    let Some((program, rest)) = args.command.split_first() else {
        bail!("❌ Nothing to run.");
    };
    let sh = Shell::new(ShellOpts {
        suppress_output: Some(args.quiet),
        output_dir: args.output_dir.clone(),
        ..ShellOpts::default()
    })?;
    let result = supervise(&sh, &args, program, rest);
    sh.cleanup()?;
    result
}

fn supervise(sh: &Shell, args: &RunArgs, program: &str, rest: &[String]) -> Result<()> {
    let deadline = args
        .timeout
        .filter(|s| *s > 0)
        .map(|s| Instant::now() + Duration::from_secs(s));
    let remaining = || deadline.map(|d| d.saturating_duration_since(Instant::now()));

    let cmd = sh.cmd(program, rest.iter().cloned())?;
    cmd.start()?;
    info!("{} Started {} (PID {:?})", "⚡".yellow(), program.bold(), cmd.pid());

    if args.await_ready {
        match remaining() {
            Some(t) => cmd.await_ready_timeout(t)?,
            None => cmd.await_ready()?,
        }
        info!("{} {} is ready", "✅".green(), program.bold());
    }
    if !args.await_vars.is_empty() {
        let vars = match remaining() {
            Some(t) => cmd.await_vars_timeout(&args.await_vars, t)?,
            None => cmd.await_vars(&args.await_vars)?,
        };
        for key in &args.await_vars {
            if let Some(value) = vars.get(key) {
                println!("{}", shepherd::env::join_var(key, value));
            }
        }
    }

    let waited = match remaining() {
        Some(t) => cmd.wait_timeout(t),
        None => cmd.wait(),
    };
    match waited {
        Err(Error::Timeout(_)) => {
            cmd.terminate(Signal::Interrupt)?;
            bail!("⏰ {} timed out after {}s", program, args.timeout.unwrap_or_default());
        }
        other => Ok(other?),
    }
}
