//! Contracts of the execution-context provider consumed by wait tasks.
//!
//! Implementations live next to the transport (see the `cdp-adapter` crate); the core only
//! calls through these traits and reacts to the [`ContextError`] kinds they report.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::errors::ContextError;
use crate::options::Binding;

/// Argument passed across the remote boundary.
#[derive(Clone)]
pub enum RemoteArg {
    /// Serialised by value.
    Json(Value),
    /// Reference to an object that already lives in the remote context.
    Handle(Arc<dyn RemoteHandle>),
}

impl fmt::Debug for RemoteArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteArg::Json(value) => f.debug_tuple("Json").field(value).finish(),
            RemoteArg::Handle(handle) => f
                .debug_tuple("Handle")
                .field(&handle.object_id())
                .finish(),
        }
    }
}

impl From<Value> for RemoteArg {
    fn from(value: Value) -> Self {
        RemoteArg::Json(value)
    }
}

/// A function source plus the arguments it is applied to, reconstructed and invoked
/// entirely on the remote side.
#[derive(Clone, Debug)]
pub struct RemoteCall {
    pub function: String,
    pub args: Vec<RemoteArg>,
}

impl RemoteCall {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<RemoteArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = RemoteArg>,
    {
        self.args.extend(args);
        self
    }
}

/// Reference to a value living in the remote context.
#[async_trait]
pub trait RemoteHandle: Send + Sync {
    /// Remote identifier used when passing the handle back as an argument.
    fn object_id(&self) -> Option<String>;

    /// Calls `function` with the handle's value as first argument and returns the result by value.
    async fn evaluate(&self, function: &str) -> Result<Value, ContextError>;

    /// Like [`RemoteHandle::evaluate`] but keeps the result remote.
    async fn evaluate_handle(&self, function: &str) -> Result<Arc<dyn RemoteHandle>, ContextError>;

    async fn dispose(&self) -> Result<(), ContextError>;
}

/// Names exposed into one execution context.
///
/// Lives and dies with its context, so a replacement context starts with nothing exposed.
/// Callers racing on one name share a single exposure attempt; a failed attempt leaves the
/// name unexposed and the next waiting caller retries it.
#[derive(Debug, Default)]
pub struct BindingRegistry {
    exposed: DashMap<String, Arc<OnceCell<()>>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `expose` unless `name` is already exposed, and returns once it is.
    pub async fn expose<F, Fut>(&self, name: &str, expose: F) -> Result<(), ContextError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ContextError>>,
    {
        let cell = Arc::clone(self.exposed.entry(name.to_string()).or_default().value());
        cell.get_or_try_init(expose).await.map(|_| ())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.exposed
            .get(name)
            .map_or(false, |cell| cell.initialized())
    }

    pub fn len(&self) -> usize {
        self.exposed
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live remote environment (page, document or isolated world).
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    fn id(&self) -> String;

    async fn evaluate(&self, call: &RemoteCall) -> Result<Value, ContextError>;

    async fn evaluate_handle(&self, call: &RemoteCall) -> Result<Arc<dyn RemoteHandle>, ContextError>;

    fn bindings(&self) -> &BindingRegistry;
}

/// Source of the current execution context for a frame.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// The context waits should evaluate in right now.
    async fn execution_context(&self) -> Result<Arc<dyn ExecutionContext>, ContextError>;

    /// Makes `binding` callable from inside `context`.
    async fn expose_binding(
        &self,
        context: &dyn ExecutionContext,
        binding: &Binding,
    ) -> Result<(), ContextError>;
}

/// Host-side function behind a [`Binding`]; receives the arguments the page passed.
pub type BindingHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;
