use clap::Subcommand;

use super::config::ConfigArgs;
use super::wait::WaitArgs;

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Wait until a predicate holds in a browser page and print its value
    Wait(WaitArgs),

    /// Inspect the effective configuration
    Config(ConfigArgs),
}
