//! Wait-until-condition tasks for remotely driven pages.
//!
//! A [`WaitTask`] evaluates a predicate inside a remote execution context until it yields a
//! truthy value, its timeout elapses, or the context is permanently lost. Tasks survive the
//! context being replaced (navigation): the owning [`TaskManager`] re-runs them against the
//! fresh context and the caller still observes exactly one settlement.
//!
//! The crate only consumes the execution-context provider through the traits in
//! [`context`]; the transport-backed implementation lives in `cdp-adapter`.

pub mod context;
pub mod deferred;
pub mod errors;
pub mod manager;
pub mod metrics;
pub mod options;
pub mod poller;
pub mod task;

pub use context::{
    BindingHandler, BindingRegistry, ContextProvider, ExecutionContext, RemoteArg, RemoteCall,
    RemoteHandle,
};
pub use deferred::Deferred;
pub use errors::{classify, ContextError, ContextErrorKind, Failure, WaitError};
pub use manager::TaskManager;
pub use metrics::WaitMetricsSnapshot;
pub use options::{Binding, Polling, Predicate, WaitOptions, DEFAULT_TIMEOUT_MS};
pub use poller::{poller_factory, Poller, RemotePoller, POLLER_SCRIPT};
pub use task::{TaskId, TaskPhase, WaitTask};
