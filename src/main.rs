mod cli;
mod config;
mod handlers;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use handlers::{demo, list, run, up};

fn main() -> Result<()> {
    env_logger::init();
    // Re-executed children run their function here and never return.
    shepherd::init_main(demo::registry()?)?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Up { config, dry_run } => up::handle_up(&config, dry_run),
        Commands::Run {
            output_dir,
            quiet,
            await_ready,
            await_vars,
            timeout,
            command,
        } => run::handle_run(run::RunArgs {
            output_dir,
            quiet,
            await_ready,
            await_vars,
            timeout,
            command,
        }),
        Commands::List { config } => list::handle_list(&config),
        Commands::Demo => demo::handle_demo(),
    }
}
