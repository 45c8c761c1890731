use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    Yaml,
}

impl OutputFormat {
    /// Renders `value` for stdout. `Human` is pretty JSON, which scripts can still parse.
    pub fn render<T: Serialize>(self, value: &T) -> Result<String> {
        Ok(match self {
            OutputFormat::Human => serde_json::to_string_pretty(value)?,
            OutputFormat::Json => serde_json::to_string(value)?,
            OutputFormat::Yaml => serde_yaml::to_string(value)?.trim_end().to_string(),
        })
    }
}
