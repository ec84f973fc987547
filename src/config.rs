use anyhow::{Context, Result, bail};
use colored::*;
use regex::{Captures, Regex};
use serde::Deserialize;
use shepherd::ShellOpts;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "shepherd.toml";

#[derive(Debug, Deserialize, Default)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub shell: ShellSection,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, rename = "command")]
    pub commands: Vec<CommandConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ShellSection {
    pub output_dir: Option<PathBuf>,
    pub suppress_output: Option<bool>,
    pub term_grace_ms: Option<u64>,
    pub kill_grace_ms: Option<u64>,
}

impl ShellSection {
    pub fn to_opts(&self) -> ShellOpts {
        let defaults = ShellOpts::default();
        ShellOpts {
            suppress_output: self.suppress_output,
            output_dir: self.output_dir.clone(),
            term_grace: self
                .term_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.term_grace),
            kill_grace: self
                .kill_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.kill_grace),
            ..defaults
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommandConfig {
    pub name: String,
    pub run: String,
    pub description: Option<String>,
    /// Leave running and move on; waited once every command has started.
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub await_ready: bool,
    #[serde(default)]
    pub await_vars: Vec<String>,
    #[serde(default)]
    pub exit_error_is_ok: bool,
    pub timeout_secs: Option<u64>,
}

impl CommandConfig {
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_secs {
            Some(0) | None => None,
            Some(s) => Some(Duration::from_secs(s)),
        }
    }
}

/// A `${VAR}` or `${command.VAR}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub cmd: Option<String>,
    pub var: String,
}

/// Expands `${VAR}` from the environment and `${command.VAR}` from variables
/// reported by earlier commands.
pub struct Interpolator {
    re: Regex,
}

impl Interpolator {
    pub fn new() -> Result<Self> {
        let re = Regex::new(r"\$\{(?:([A-Za-z_][\w-]*)\.)?([A-Za-z_]\w*)\}")
            .context("Failed to compile interpolation pattern")?;
        Ok(Self { re })
    }

    pub fn references(&self, s: &str) -> Vec<Reference> {
        self.re
            .captures_iter(s)
            .map(|caps| Reference {
                cmd: caps.get(1).map(|m| m.as_str().to_string()),
                var: caps[2].to_string(),
            })
            .collect()
    }

    /// Unknown environment variables expand to nothing. Command variables that
    /// are not known yet are left as written.
    pub fn expand(
        &self,
        s: &str,
        env: &BTreeMap<String, String>,
        reported: &HashMap<String, HashMap<String, String>>,
    ) -> String {
        self.re
            .replace_all(s, |caps: &Captures| match caps.get(1) {
                Some(cmd) => reported
                    .get(cmd.as_str())
                    .and_then(|vars| vars.get(&caps[2]))
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string()),
                None => env.get(&caps[2]).cloned().unwrap_or_default(),
            })
            .into_owned()
    }
}

pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        bail!("❌ Critical: '{}' not found.", path.display());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    // 1. Parse the config file (base layer)
    let mut config: SupervisorConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    // `up` changes into the config directory, so this must not stay relative.
    if let Some(out) = &config.shell.output_dir {
        if out.is_relative() {
            config.shell.output_dir = Some(std::path::absolute(dir.join(out))?);
        }
    }

    // 2. Load .env using dotenvy (override layer); SHEPHERD_ENV picks .env.<name>
    let env_filename = env::var("SHEPHERD_ENV")
        .map(|v| format!(".env.{}", v))
        .unwrap_or_else(|_| ".env".to_string());
    let env_path = dir.join(&env_filename);
    if env_path.exists() {
        eprintln!("{} Loading environment from: {}", "🌿".green(), env_filename.bold());
        for item in dotenvy::from_path_iter(&env_path)? {
            let (key, val) = item?;
            config.env.insert(key, val);
        }
    }

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &SupervisorConfig) -> Result<()> {
    let interp = Interpolator::new()?;
    let mut seen: HashMap<&str, &CommandConfig> = HashMap::new();

    for c in &config.commands {
        if c.name.trim().is_empty() {
            bail!("❌ Configuration Error: every [[command]] needs a name.");
        }
        let words = shell_words::split(&c.run)
            .with_context(|| format!("❌ Command '{}' has an unparsable 'run'", c.name))?;
        if words.is_empty() {
            bail!("❌ Command '{}' has an empty 'run'.", c.name);
        }
        if !c.background && (c.await_ready || !c.await_vars.is_empty()) {
            bail!(
                "❌ Command '{}' awaits readiness or variables, which needs 'background = true'.",
                c.name
            );
        }
        for r in interp.references(&c.run) {
            let Some(target) = r.cmd else { continue };
            match seen.get(target.as_str()) {
                None => bail!(
                    "❌ Command '{}' references '{}', which is not an earlier command.",
                    c.name,
                    target
                ),
                Some(dep) if !dep.await_vars.contains(&r.var) => bail!(
                    "❌ Command '{}' references {}.{}, but '{}' does not await '{}'.",
                    c.name,
                    target,
                    r.var,
                    target,
                    r.var
                ),
                Some(_) => {}
            }
        }
        if seen.insert(c.name.as_str(), c).is_some() {
            bail!("❌ Duplicate command name '{}'.", c.name);
        }
    }
    Ok(())
}
