use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::CONFIG_FILE;

#[derive(Parser)]
#[command(name = "shepherd", version, about = "Shepherd: start, watch, and reap child processes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the commands defined in shepherd.toml, in order
    Up {
        /// Path to the config file
        #[arg(short = 'c', long = "config", default_value = CONFIG_FILE)]
        config: PathBuf,

        /// Print the expanded commands without running them
        #[arg(short = 'n', long = "dry-run")]
        dry_run: bool,
    },

    /// Supervise a single command
    Run {
        /// Also write the child's stdout and stderr to log files here
        #[arg(long = "output-dir")]
        output_dir: Option<PathBuf>,

        /// Don't show the child's output
        #[arg(short = 'q', long = "quiet")]
        quiet: bool,

        /// Wait for the child to report that it is ready
        #[arg(long = "await-ready")]
        await_ready: bool,

        /// Wait for the child to report this variable, then print it as K=V
        #[arg(long = "await-var", value_name = "KEY")]
        await_vars: Vec<String>,

        /// Interrupt the child if it has not finished after this many seconds
        #[arg(long = "timeout", value_name = "SECS")]
        timeout: Option<u64>,

        #[arg(last = true, required = true, value_name = "PROGRAM")]
        command: Vec<String>,
    },

    /// List the commands defined in shepherd.toml
    #[command(visible_alias = "ls")]
    List {
        #[arg(short = 'c', long = "config", default_value = CONFIG_FILE)]
        config: PathBuf,
    },

    /// Start a server function as a child process and query it
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "shepherd", "run", "--quiet", "--await-var", "Addr", "--await-var", "Port", "--", "sh", "-c", "true",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { quiet, await_vars, command, timeout, .. } => {
                assert!(quiet);
                assert_eq!(await_vars, vec!["Addr", "Port"]);
                assert_eq!(command, vec!["sh", "-c", "true"]);
                assert_eq!(timeout, None);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_requires_a_program() {
        assert!(Cli::try_parse_from(["shepherd", "run", "--quiet"]).is_err());
    }

    #[test]
    fn test_up_defaults() {
        let cli = Cli::try_parse_from(["shepherd", "up", "-n"]).unwrap();
        match cli.command {
            Commands::Up { config, dry_run } => {
                assert_eq!(config, PathBuf::from(CONFIG_FILE));
                assert!(dry_run);
            }
            _ => panic!("expected up"),
        }
    }
}
