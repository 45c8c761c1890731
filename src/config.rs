//! Configuration file model for `soulwait`.

use std::time::Duration;

use cdp_adapter::CdpConfig;
use serde::{Deserialize, Serialize};
use soulbrowser_wait_task::{Polling, WaitOptions, DEFAULT_TIMEOUT_MS};

/// Contents of `wait.yaml`. Every section is optional.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub cdp: CdpConfig,
    pub wait: WaitDefaults,
}

/// Defaults applied to waits that do not set their own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitDefaults {
    pub polling: Polling,
    /// Zero waits indefinitely.
    pub timeout_ms: u64,
}

impl Default for WaitDefaults {
    fn default() -> Self {
        Self {
            polling: Polling::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl WaitDefaults {
    pub fn options(&self) -> WaitOptions {
        WaitOptions::default()
            .with_polling(self.polling)
            .with_timeout(Duration::from_millis(self.timeout_ms))
    }
}
