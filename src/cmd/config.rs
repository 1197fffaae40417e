//! Configuration view and validation commands: `eventsense config`.

use anyhow::{Context, Result};
use std::path::Path;

use eventsense::config::{Config, DEFAULT_CONFIG_FILE};

use super::super::ConfigCommands;

pub fn cmd_config(
    config: &Config,
    config_path: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let source = match config_path {
                Some(path) => path.display().to_string(),
                None if Path::new(DEFAULT_CONFIG_FILE).exists() => DEFAULT_CONFIG_FILE.to_string(),
                None => "defaults".to_string(),
            };
            println!("# source: {} (with environment overrides)", source);
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
            write_default(path, force)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

fn write_default(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists. Use --force to overwrite.",
            path.display()
        );
    }
    let content = Config::default().to_toml()?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))
}
