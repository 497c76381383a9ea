//! `tubecast init`: write a default configuration file.

use anyhow::Context;
use clap::Args;
use console::style;
use tubecast_core::config::Config;

/// Arguments for `tubecast init`.
#[derive(Args)]
pub struct InitArgs {
    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}

/// Write the default config to the given path (or `~/.tubecast/config.toml`).
pub fn execute(args: &InitArgs, config_path: Option<&str>) -> anyhow::Result<()> {
    let path = config_path
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::default_path);

    if path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(&path, Config::default_toml())
        .with_context(|| format!("writing {}", path.display()))?;

    println!(
        "{} wrote default configuration to {}",
        style("✓").green(),
        style(path.display()).bold()
    );
    println!("Set TUBECAST_LLM_API_KEY (or edit [llm]) to enable AI comments.");
    Ok(())
}
