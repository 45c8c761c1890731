//! Wait configuration accepted from callers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::context::{BindingHandler, RemoteHandle};
use crate::errors::WaitError;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// How the remote poller re-checks the predicate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Polling {
    /// On every batch of DOM mutations under the observation root.
    Mutation,
    /// On every animation frame.
    #[default]
    Raf,
    /// Every `n` milliseconds.
    Interval(u64),
}

impl Polling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Polling::Mutation => "mutation",
            Polling::Raf => "raf",
            Polling::Interval(_) => "interval",
        }
    }

    pub fn interval_ms(&self) -> Option<u64> {
        match self {
            Polling::Interval(ms) => Some(*ms),
            _ => None,
        }
    }
}

impl fmt::Display for Polling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Polling::Interval(ms) => write!(f, "{ms}"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl FromStr for Polling {
    type Err = WaitError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mutation" => Ok(Polling::Mutation),
            "raf" => Ok(Polling::Raf),
            other => match other.parse::<u64>() {
                Ok(0) => Err(WaitError::InvalidOptions(
                    "polling interval must be positive".into(),
                )),
                Ok(ms) => Ok(Polling::Interval(ms)),
                Err(_) => Err(WaitError::InvalidOptions(format!(
                    "unknown polling mode '{raw}'"
                ))),
            },
        }
    }
}

impl Serialize for Polling {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Polling::Interval(ms) => serializer.serialize_u64(*ms),
            other => serializer.serialize_str(other.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for Polling {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PollingVisitor;

        impl<'de> Visitor<'de> for PollingVisitor {
            type Value = Polling;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"mutation\", \"raf\" or a positive interval in milliseconds")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Polling, E> {
                value.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Polling, E> {
                if value == 0 {
                    return Err(E::custom("polling interval must be positive"));
                }
                Ok(Polling::Interval(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Polling, E> {
                if value <= 0 {
                    return Err(E::custom("polling interval must be positive"));
                }
                Ok(Polling::Interval(value as u64))
            }
        }

        deserializer.deserialize_any(PollingVisitor)
    }
}

/// Predicate source shipped to the remote side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "source")]
pub enum Predicate {
    /// Function expression, called with the wait's arguments.
    Function(String),
    /// Expression re-evaluated as is on every check.
    Expression(String),
}

impl Predicate {
    pub fn function(source: impl Into<String>) -> Self {
        Predicate::Function(source.into())
    }

    pub fn expression(source: impl Into<String>) -> Self {
        Predicate::Expression(source.into())
    }

    pub fn source(&self) -> &str {
        match self {
            Predicate::Function(source) | Predicate::Expression(source) => source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Predicate::Function(_) => "function",
            Predicate::Expression(_) => "expression",
        }
    }
}

/// Named host function exposed to the page before the predicate runs.
#[derive(Clone)]
pub struct Binding {
    pub name: String,
    pub handler: BindingHandler,
}

impl Binding {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding").field("name", &self.name).finish()
    }
}

#[derive(Clone)]
pub struct WaitOptions {
    pub polling: Polling,
    /// Zero disables the timeout.
    pub timeout: Duration,
    /// Subtree observed by mutation polling; the whole document when unset. Other modes
    /// ignore it.
    pub root: Option<Arc<dyn RemoteHandle>>,
    pub bindings: Vec<Binding>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            polling: Polling::default(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            root: None,
            bindings: Vec::new(),
        }
    }
}

impl fmt::Debug for WaitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitOptions")
            .field("polling", &self.polling)
            .field("timeout", &self.timeout)
            .field("root", &self.root.as_ref().map(|root| root.object_id()))
            .field("bindings", &self.bindings)
            .finish()
    }
}

impl WaitOptions {
    pub fn with_polling(mut self, polling: Polling) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_root(mut self, root: Arc<dyn RemoteHandle>) -> Self {
        self.root = Some(root);
        self
    }

    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn validate(&self) -> Result<(), WaitError> {
        if let Polling::Interval(0) = self.polling {
            return Err(WaitError::InvalidOptions(
                "polling interval must be positive".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for binding in &self.bindings {
            if binding.name.trim().is_empty() {
                return Err(WaitError::InvalidOptions("binding name is empty".into()));
            }
            if !seen.insert(binding.name.as_str()) {
                return Err(WaitError::InvalidOptions(format!(
                    "binding '{}' listed twice",
                    binding.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    #[test]
    fn polling_parses_names_and_intervals() {
        assert_eq!("mutation".parse::<Polling>().unwrap(), Polling::Mutation);
        assert_eq!("RAF".parse::<Polling>().unwrap(), Polling::Raf);
        assert_eq!("250".parse::<Polling>().unwrap(), Polling::Interval(250));
        assert!("0".parse::<Polling>().is_err());
        assert!("sometimes".parse::<Polling>().is_err());
    }

    #[test]
    fn polling_serde_matches_wire_shape() {
        assert_eq!(serde_json::to_value(Polling::Raf).unwrap(), json!("raf"));
        assert_eq!(
            serde_json::to_value(Polling::Interval(100)).unwrap(),
            json!(100)
        );
        let parsed: Polling = serde_json::from_value(json!(40)).unwrap();
        assert_eq!(parsed, Polling::Interval(40));
        let parsed: Polling = serde_json::from_value(json!("mutation")).unwrap();
        assert_eq!(parsed, Polling::Mutation);
        assert!(serde_json::from_value::<Polling>(json!(0)).is_err());
    }

    #[test]
    fn duplicate_bindings_are_rejected() {
        let handler = |_args: Vec<Value>| async { Ok::<_, String>(Value::Null) }.boxed();
        let options = WaitOptions::default()
            .with_binding(Binding::new("ping", handler))
            .with_binding(Binding::new("ping", handler));
        assert!(matches!(
            options.validate(),
            Err(WaitError::InvalidOptions(_))
        ));
    }

    struct Element;

    #[async_trait::async_trait]
    impl RemoteHandle for Element {
        fn object_id(&self) -> Option<String> {
            Some("element-1".into())
        }

        async fn evaluate(&self, _function: &str) -> Result<Value, crate::ContextError> {
            Ok(Value::Null)
        }

        async fn evaluate_handle(
            &self,
            _function: &str,
        ) -> Result<Arc<dyn RemoteHandle>, crate::ContextError> {
            Ok(Arc::new(Element))
        }

        async fn dispose(&self) -> Result<(), crate::ContextError> {
            Ok(())
        }
    }

    #[test]
    fn root_is_accepted_with_any_polling_mode() {
        for polling in [Polling::Mutation, Polling::Raf, Polling::Interval(50)] {
            let options = WaitOptions::default()
                .with_polling(polling)
                .with_root(Arc::new(Element));
            assert!(options.validate().is_ok(), "{polling} rejected a root");
        }
    }

    #[test]
    fn defaults_are_raf_with_timeout() {
        let options = WaitOptions::default();
        assert_eq!(options.polling, Polling::Raf);
        assert_eq!(options.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert!(options.validate().is_ok());
    }
}
