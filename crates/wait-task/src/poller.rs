//! Remote pollers.
//!
//! The watch strategies (mutation observer, animation frames, intervals) only exist inside
//! the hosting document, so they ship as a fixed script ([`POLLER_SCRIPT`]) that is
//! instantiated remotely. [`RemotePoller`] drives one such instance through its handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::context::{RemoteArg, RemoteCall, RemoteHandle};
use crate::deferred::Deferred;
use crate::errors::ContextError;
use crate::options::{Polling, Predicate};

/// Injected poller implementation; evaluates to `{ create(options, root, args) }`.
pub const POLLER_SCRIPT: &str = include_str!("../js/poller.js");

const START_FN: &str = "poller => poller.start()";
const STOP_FN: &str = "poller => poller.stop()";
const RESULT_FN: &str = "poller => poller.result()";

/// Capability surface shared by every poller variant.
#[async_trait]
pub trait Poller: Send + Sync {
    /// Runs the first check and arms the watch when it was falsy. Call at most once.
    async fn start(&self) -> Result<(), ContextError>;

    /// Rejects the result if still pending, then disarms. Safe to repeat.
    async fn stop(&self) -> Result<(), ContextError>;

    /// The first truthy predicate value. Every call observes the same settlement.
    fn result(&self) -> BoxFuture<'static, Result<Value, ContextError>>;
}

/// Builds the call that instantiates a remote poller for `predicate`.
pub fn poller_factory(
    predicate: &Predicate,
    args: &[RemoteArg],
    polling: Polling,
    root: Option<&Arc<dyn RemoteHandle>>,
) -> RemoteCall {
    let options = json!({
        "polling": polling.as_str(),
        "interval": polling.interval_ms(),
        "predicate": predicate,
    });
    let root = match root {
        Some(handle) => RemoteArg::Handle(Arc::clone(handle)),
        None => RemoteArg::Json(Value::Null),
    };

    RemoteCall::new(format!(
        "(options, root, ...args) => ({POLLER_SCRIPT}).create(options, root, args)"
    ))
    .arg(options)
    .arg(root)
    .args(args.iter().cloned())
}

/// Local face of a poller instance living in the remote context.
pub struct RemotePoller {
    handle: Arc<dyn RemoteHandle>,
    result: Deferred<Value, ContextError>,
    started: AtomicBool,
    disarmed: AtomicBool,
}

impl RemotePoller {
    pub fn new(handle: Arc<dyn RemoteHandle>) -> Self {
        Self {
            handle,
            result: Deferred::new(),
            started: AtomicBool::new(false),
            disarmed: AtomicBool::new(false),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.result.settled()
    }

    /// Releases the remote instance.
    pub async fn dispose(&self) -> Result<(), ContextError> {
        self.handle.dispose().await
    }

    fn forward_result(&self) {
        let handle = Arc::clone(&self.handle);
        let result = self.result.clone();
        tokio::spawn(async move {
            // Anything arriving after a local stop is dropped by the deferred.
            match handle.evaluate(RESULT_FN).await {
                Ok(value) => {
                    result.resolve(value);
                }
                Err(err) => {
                    result.reject(err);
                }
            }
        });
    }
}

#[async_trait]
impl Poller for RemotePoller {
    async fn start(&self) -> Result<(), ContextError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ContextError::protocol("poller already started"));
        }

        if let Err(err) = self.handle.evaluate(START_FN).await {
            self.result.reject(err.clone());
            return Err(err);
        }

        self.forward_result();
        Ok(())
    }

    async fn stop(&self) -> Result<(), ContextError> {
        if self.result.reject(ContextError::stopped()) {
            debug!("poller stopped before settling");
        }

        if !self.started.load(Ordering::SeqCst) {
            warn!("stop called on a poller that never started");
            return Ok(());
        }
        if self.disarmed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.handle.evaluate(STOP_FN).await.map(|_| ())
    }

    fn result(&self) -> BoxFuture<'static, Result<Value, ContextError>> {
        self.result.wait().boxed()
    }
}
