use anyhow::Result;
use clap::{Args, Subcommand};

use super::context::CliContext;
use super::output::OutputFormat;

#[derive(Args, Clone, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration (default)
    Show,

    /// Print which configuration file is used
    Path,

    /// Check that the configured wait defaults are usable
    Validate,
}

pub async fn cmd_config(args: ConfigArgs, ctx: &CliContext, output: OutputFormat) -> Result<()> {
    match args.action.unwrap_or(ConfigAction::Show) {
        ConfigAction::Show => {
            let rendered = match output {
                OutputFormat::Human => serde_yaml::to_string(ctx.config())?,
                other => other.render(ctx.config())?,
            };
            println!("{}", rendered.trim_end());
        }
        ConfigAction::Path => {
            let state = if ctx.config_found() {
                "found"
            } else {
                "not found, using defaults"
            };
            println!("{} ({state})", ctx.config_path().display());
        }
        ConfigAction::Validate => {
            ctx.config().wait.options().validate()?;
            println!("Configuration is valid");
        }
    }
    Ok(())
}
