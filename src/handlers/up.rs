use anyhow::{Context, Result, bail};
use colored::*;
use log::{error, info};
use shepherd::{Cmd, Shell};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::config::{CommandConfig, Interpolator, SupervisorConfig, load_config};

pub fn handle_up(config_path: &Path, dry_run: bool) -> Result<()> {
    let config = load_config(config_path)?;
    if config.commands.is_empty() {
        println!("No commands defined in configuration.");
        return Ok(());
    }

    let sh = Shell::new(config.shell.to_opts())?;
    let result = bring_up(&sh, &config, config_path, dry_run);
    if let Err(e) = &result {
        error!("{} {:#}", "❌".red(), e);
    }
    // Stops anything still running, whatever happened above.
    sh.cleanup()?;
    result
}

fn bring_up(sh: &Shell, config: &SupervisorConfig, config_path: &Path, dry_run: bool) -> Result<()> {
    for (k, v) in &config.env {
        sh.set_var(k, v)?;
    }
    // Relative programs and paths in the config are relative to its directory.
    if let Some(dir) = config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        sh.pushd(dir)
            .with_context(|| format!("Failed to enter {}", dir.display()))?;
    }

    let interp = Interpolator::new()?;
    let env = sh.vars();
    let mut reported: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut background: Vec<(&str, Cmd)> = Vec::new();

    for c in &config.commands {
        let words: Vec<String> = shell_words::split(&c.run)?
            .iter()
            .map(|w| interp.expand(w, &env, &reported))
            .collect();

        if dry_run {
            println!("{} [DRY-RUN] {}: {}", "::".yellow(), c.name.bold(), shell_words::join(&words));
            continue;
        }

        let Some((program, args)) = words.split_first() else {
            bail!("❌ Command '{}' has an empty 'run'.", c.name);
        };
        info!("{} Starting {}: {}", "⚡".yellow(), c.name.bold(), shell_words::join(&words));
        let cmd = sh
            .cmd(program, args.iter().cloned())?
            .exit_error_is_ok(c.exit_error_is_ok);

        if c.background {
            cmd.start()
                .with_context(|| format!("❌ Command '{}' failed to start", c.name))?;
            if let Some(vars) = await_background(&cmd, c)? {
                reported.insert(c.name.clone(), vars);
            }
            background.push((c.name.as_str(), cmd));
        } else {
            run_foreground(&cmd, c.timeout())
                .with_context(|| format!("❌ Command '{}' failed", c.name))?;
            info!("{} {} finished", "✅".green(), c.name.bold());
        }
    }

    if dry_run {
        return Ok(());
    }
    for (name, cmd) in background {
        info!("{} Waiting for {}", "⏳".blue(), name.bold());
        cmd.wait()
            .with_context(|| format!("❌ Command '{}' failed", name))?;
    }
    Ok(())
}

fn await_background(cmd: &Cmd, c: &CommandConfig) -> Result<Option<HashMap<String, String>>> {
    let timeout = c.timeout();
    if c.await_ready {
        match timeout {
            Some(t) => cmd.await_ready_timeout(t)?,
            None => cmd.await_ready()?,
        }
        info!("{} {} is ready", "✅".green(), c.name.bold());
    }
    if c.await_vars.is_empty() {
        return Ok(None);
    }
    let vars = match timeout {
        Some(t) => cmd.await_vars_timeout(&c.await_vars, t)?,
        None => cmd.await_vars(&c.await_vars)?,
    };
    let mut keys: Vec<&String> = vars.keys().collect();
    keys.sort();
    for k in keys {
        println!("  {}.{} = {}", c.name.cyan(), k, vars[k]);
    }
    Ok(Some(vars))
}

fn run_foreground(cmd: &Cmd, timeout: Option<Duration>) -> Result<()> {
    let Some(t) = timeout else {
        cmd.run()?;
        return Ok(());
    };
    cmd.start()?;
    match cmd.wait_timeout(t) {
        Err(shepherd::Error::Timeout(_)) => {
            cmd.terminate(shepherd::Signal::Interrupt)?;
            bail!("⏰ Timed out after {}s", t.as_secs());
        }
        other => Ok(other?),
    }
}
