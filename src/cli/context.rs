use std::path::{Path, PathBuf};

use crate::config::WaitConfig;

pub struct CliContext {
    config: WaitConfig,
    config_path: PathBuf,
    config_found: bool,
}

impl CliContext {
    pub fn new(config: WaitConfig, config_path: PathBuf, config_found: bool) -> Self {
        Self {
            config,
            config_path,
            config_found,
        }
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Whether `config_path` existed, as opposed to defaults being used.
    pub fn config_found(&self) -> bool {
        self.config_found
    }
}
