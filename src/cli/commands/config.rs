//! Configuration CLI commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::cli::load_config;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective configuration after all layers are merged
    Show,
    /// Load and validate the configuration without running anything
    Validate,
}

#[derive(Debug, serde::Serialize)]
pub struct ConfigShowOutput {
    pub source: String,
    pub config: Config,
}

impl CommandOutput for ConfigShowOutput {
    fn to_human(&self) -> String {
        let yaml = serde_yaml::to_string(&self.config)
            .unwrap_or_else(|e| format!("<failed to render config: {e}>"));
        format!("# source: {}\n{}", self.source, yaml)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[derive(Debug, serde::Serialize)]
pub struct ConfigValidateOutput {
    pub source: String,
    pub valid: bool,
    pub agents: usize,
    pub cache_levels: usize,
}

impl CommandOutput for ConfigValidateOutput {
    fn to_human(&self) -> String {
        format!(
            "Configuration from {} is valid ({} seed agents, {} cache levels).",
            self.source, self.agents, self.cache_levels
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn execute(args: ConfigArgs, config_path: Option<PathBuf>, json_mode: bool) -> Result<()> {
    let source = config_path.as_ref().map_or_else(
        || "defaults + .cohort/ + COHORT_* environment".to_string(),
        |p| p.display().to_string(),
    );
    let config = load_config(config_path.as_ref()).context("Failed to load configuration")?;

    match args.command {
        ConfigCommands::Show => output(&ConfigShowOutput { source, config }, json_mode),
        ConfigCommands::Validate => output(
            &ConfigValidateOutput {
                source,
                valid: true,
                agents: config.agents.len(),
                cache_levels: config.cache.level_capacities.len(),
            },
            json_mode,
        ),
    }
    Ok(())
}
