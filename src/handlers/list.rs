use anyhow::Result;
use colored::*;
use std::path::Path;
use crate::config::load_config;

pub fn handle_list(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("{} {}", "🐑".green(), config_path.display().to_string().bold());
    println!();

    if config.commands.is_empty() {
        println!("No commands defined in configuration.");
        return Ok(());
    }

    println!("{}", "Commands:".bold().underline());
    let max_len = config.commands.iter().map(|c| c.name.len()).max().unwrap_or(0);

    for c in &config.commands {
        let padding = " ".repeat(max_len - c.name.len() + 2);
        let mut tags = Vec::new();
        if c.background {
            tags.push("background".to_string());
        }
        if c.await_ready {
            tags.push("ready".to_string());
        }
        if !c.await_vars.is_empty() {
            tags.push(format!("vars: {}", c.await_vars.join(", ")));
        }
        let tags = if tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", tags.join("; "))
        };
        println!("  {}{}{}{}", c.name.cyan(), padding, c.run, tags.dimmed());
        if let Some(desc) = &c.description {
            println!("  {}{}", " ".repeat(max_len + 2), desc.italic());
        }
    }

    Ok(())
}
