//! Chromium DevTools Protocol backing for SoulBrowser wait tasks.
//!
//! The crate owns the browser connection ([`transport`]) and turns one attached page session
//! into the execution-context provider consumed by `soulbrowser-wait-task`: contexts are
//! tracked from `Runtime` events ([`world::WorldWatcher`]), remote calls go through
//! `Runtime.callFunctionOn` ([`context`]), and protocol failures are classified here, once,
//! into the enumerated kinds the wait core reacts to.

use std::{env, path::PathBuf, sync::Arc};

use serde_json::json;
use tracing::info;
use which::which;

pub mod error {
    use serde::{Deserialize, Serialize};
    use soulbrowser_wait_task::ContextError;
    use std::fmt;
    use thiserror::Error;

    /// High-level error categories surfaced by the adapter.
    #[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AdapterErrorKind {
        #[error("command timed out")]
        Timeout,
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("execution context destroyed")]
        ContextDestroyed,
        #[error("execution context not found")]
        ContextNotFound,
        #[error("target detached")]
        TargetDetached,
        #[error("javascript exception")]
        Exception,
        #[error("internal error")]
        Internal,
    }

    impl AdapterErrorKind {
        pub fn as_str(&self) -> &'static str {
            match self {
                AdapterErrorKind::Timeout => "timeout",
                AdapterErrorKind::CdpIo => "cdp_io",
                AdapterErrorKind::ContextDestroyed => "context_destroyed",
                AdapterErrorKind::ContextNotFound => "context_not_found",
                AdapterErrorKind::TargetDetached => "target_detached",
                AdapterErrorKind::Exception => "exception",
                AdapterErrorKind::Internal => "internal",
            }
        }
    }

    /// Enriched error metadata passed back to higher layers.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AdapterError {
        pub kind: AdapterErrorKind,
        pub hint: Option<String>,
        pub retriable: bool,
        pub data: Option<serde_json::Value>,
    }

    impl fmt::Display for AdapterError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for AdapterError {}

    impl AdapterError {
        pub fn new(kind: AdapterErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                retriable: false,
                data: None,
            }
        }

        /// Error returned by the browser for a command, classified by its message.
        pub fn protocol(code: i64, message: &str) -> Self {
            Self::new(classify_protocol_message(message))
                .with_hint(format!("cdp error {code}: {message}"))
                .retriable(code >= 500)
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }

        pub fn with_data(mut self, data: serde_json::Value) -> Self {
            self.data = Some(data);
            self
        }
    }

    /// Maps a browser error message onto an adapter error kind.
    ///
    /// The only place where protocol text is inspected; everything downstream matches on kinds.
    pub fn classify_protocol_message(message: &str) -> AdapterErrorKind {
        const DESTROYED: &[&str] = &[
            "Execution context was destroyed",
            "Inspected target navigated or closed",
        ];
        const NOT_FOUND: &[&str] = &[
            "Cannot find context with specified id",
            "Cannot find default execution context",
            "Could not find object with given id",
        ];
        const DETACHED: &[&str] = &[
            "No target with given id",
            "Session with given id not found",
            "Target closed",
            "No frame with given id",
        ];

        if DESTROYED.iter().any(|needle| message.contains(needle)) {
            AdapterErrorKind::ContextDestroyed
        } else if NOT_FOUND.iter().any(|needle| message.contains(needle)) {
            AdapterErrorKind::ContextNotFound
        } else if DETACHED.iter().any(|needle| message.contains(needle)) {
            AdapterErrorKind::TargetDetached
        } else {
            AdapterErrorKind::CdpIo
        }
    }

    impl From<AdapterError> for ContextError {
        fn from(err: AdapterError) -> Self {
            let message = err.hint.clone().unwrap_or_else(|| err.kind.to_string());
            match err.kind {
                AdapterErrorKind::ContextDestroyed => ContextError::destroyed(message),
                AdapterErrorKind::ContextNotFound => ContextError::not_found(message),
                AdapterErrorKind::TargetDetached => ContextError::detached(message),
                AdapterErrorKind::Exception => ContextError::evaluation(message),
                AdapterErrorKind::Timeout
                | AdapterErrorKind::CdpIo
                | AdapterErrorKind::Internal => ContextError::protocol(message),
            }
        }
    }
}

pub mod config {
    use crate::detect_chrome_executable;
    use serde::{Deserialize, Serialize};
    use std::{
        env,
        path::{Path, PathBuf},
    };

    /// Configuration for launching or connecting to the browser.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CdpConfig {
        pub executable: PathBuf,
        pub user_data_dir: PathBuf,
        pub headless: bool,
        pub default_deadline_ms: u64,
        /// Connect to an already running browser instead of launching one.
        pub websocket_url: Option<String>,
        /// Zero disables the keep-alive probe.
        pub heartbeat_interval_ms: u64,
    }

    impl Default for CdpConfig {
        fn default() -> Self {
            Self {
                executable: default_chrome_path(),
                user_data_dir: default_profile_dir(),
                headless: resolve_headless_default(),
                default_deadline_ms: 30_000,
                websocket_url: None,
                heartbeat_interval_ms: 15_000,
            }
        }
    }

    fn resolve_headless_default() -> bool {
        match env::var("SOUL_HEADLESS") {
            Ok(value) => {
                let lower = value.to_ascii_lowercase();
                !matches!(lower.as_str(), "0" | "false" | "no" | "off")
            }
            Err(_) => true,
        }
    }

    fn default_chrome_path() -> PathBuf {
        detect_chrome_executable().unwrap_or_default()
    }

    fn default_profile_dir() -> PathBuf {
        if let Ok(path) = env::var("SOULBROWSER_CHROME_PROFILE") {
            return PathBuf::from(path);
        }

        Path::new("./.soulbrowser-profile").into()
    }
}

pub mod context;
pub mod metrics;
pub mod registry;
pub mod transport;
pub mod util;
pub mod world;

#[cfg(test)]
pub(crate) mod mock;

pub use config::CdpConfig;
pub use context::{CdpExecutionContext, CdpRemoteHandle, PageSession};
pub use error::{classify_protocol_message, AdapterError, AdapterErrorKind};
pub use metrics::AdapterMetricsSnapshot;
pub use registry::ContextRegistry;
pub use transport::{CdpTransport, ChromiumTransport, CommandTarget, NoopTransport, TransportEvent};
pub use world::{CdpWorld, WorldWatcher};

/// Picks the transport for `cfg`: an existing browser when a websocket URL is configured,
/// otherwise a launched Chromium.
pub fn connect(mut cfg: CdpConfig) -> Result<Arc<dyn CdpTransport>, AdapterError> {
    if let Some(url) = &cfg.websocket_url {
        info!(target: "cdp-adapter", %url, "connecting to running browser");
        return Ok(Arc::new(ChromiumTransport::new(cfg)));
    }

    match resolve_chrome_path(&cfg) {
        Some(path) => {
            info!(target: "cdp-adapter", executable = %path.display(), "launching chromium");
            cfg.executable = path;
            Ok(Arc::new(ChromiumTransport::new(cfg)))
        }
        None => Err(AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint("Chrome/Chromium executable not found")
            .with_data(json!({
                "remediation": "Install Chrome/Chromium and set SOULBROWSER_CHROME=/path/to/chrome, or configure cdp.websocket_url",
            }))),
    }
}

fn resolve_chrome_path(cfg: &CdpConfig) -> Option<PathBuf> {
    if !cfg.executable.as_os_str().is_empty() && cfg.executable.exists() {
        return Some(cfg.executable.clone());
    }
    detect_chrome_executable()
}

fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("SOULBROWSER_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in chrome_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    let skip_defaults = env::var("SOULBROWSER_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    if skip_defaults {
        return None;
    }

    os_specific_chrome_paths()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(not(target_os = "windows"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"]
            .iter()
            .filter_map(|key| env::var(key).ok())
            .map(|root| PathBuf::from(root.trim()))
            .flat_map(|root| {
                [
                    root.join("Google/Chrome/Application/chrome.exe"),
                    root.join("Chromium/Application/chrome.exe"),
                    root.join("Microsoft/Edge/Application/msedge.exe"),
                ]
            })
            .collect()
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }
}
