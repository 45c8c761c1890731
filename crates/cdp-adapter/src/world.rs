//! The page's main world as a wait-task context provider.
//!
//! [`CdpWorld`] answers "which context should a wait evaluate in right now" from the
//! [`ContextRegistry`], which [`WorldWatcher`] keeps current from `Runtime`/`Page` events.
//! A new default context re-runs every parked wait; losing the page terminates them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::Deserialize;
use serde_json::{json, Value};
use soulbrowser_wait_task::{
    Binding, BindingHandler, ContextError, ContextProvider, ExecutionContext, RemoteCall,
    TaskManager, WaitError,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{CdpExecutionContext, PageSession};
use crate::error::{AdapterError, AdapterErrorKind};
use crate::metrics;
use crate::registry::ContextRegistry;
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};

/// Turns the raw `Runtime.addBinding` function into a promise-returning one.
const BINDING_WRAPPER: &str = include_str!("../js/binding.js");
const BINDING_DELIVER: &str = "(name, seq, ok, value) => globalThis[name].__deliver(seq, ok, value)";

pub struct CdpWorld {
    session: PageSession,
    contexts: ContextRegistry,
    handlers: DashMap<String, BindingHandler>,
    added_bindings: DashSet<String>,
    manager: Arc<TaskManager>,
    detached: AtomicBool,
}

impl CdpWorld {
    pub fn new(session: PageSession, manager: Arc<TaskManager>) -> Arc<Self> {
        Arc::new(Self {
            session,
            contexts: ContextRegistry::new(),
            handlers: DashMap::new(),
            added_bindings: DashSet::new(),
            manager,
            detached: AtomicBool::new(false),
        })
    }

    /// Creates a blank page and attaches a flat session to it.
    pub async fn open(
        transport: Arc<dyn CdpTransport>,
        manager: Arc<TaskManager>,
    ) -> Result<Arc<Self>, AdapterError> {
        let created = transport
            .send_command(
                CommandTarget::Browser,
                "Target.createTarget",
                json!({ "url": "about:blank" }),
            )
            .await?;
        let target_id = string_field(&created, "targetId")?;

        let attached = transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = string_field(&attached, "sessionId")?;

        info!(target: "cdp-adapter", %target_id, %session_id, "attached to page");
        Ok(Self::new(PageSession::new(transport, session_id), manager))
    }

    /// Enables the domains whose events track contexts. Start the watcher first so the
    /// contexts reported on enable are not missed.
    pub async fn enable(&self) -> Result<(), AdapterError> {
        let tree = self.session.send("Page.getFrameTree", json!({})).await?;
        if let Some(frame_id) = tree["frameTree"]["frame"]["id"].as_str() {
            self.contexts.set_main_frame(frame_id);
        }
        self.session.send("Page.enable", json!({})).await?;
        self.session.send("Runtime.enable", json!({})).await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<(), AdapterError> {
        let response = self
            .session
            .send("Page.navigate", json!({ "url": url }))
            .await?;
        match response["errorText"].as_str() {
            Some(error) if !error.is_empty() => Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint(format!("navigation to {url} failed: {error}"))),
            _ => Ok(()),
        }
    }

    pub fn session(&self) -> &PageSession {
        &self.session
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Installs a newly reported context if it is the main frame's default one.
    fn install_context(&self, created: ContextCreated) -> bool {
        let description = created.context;
        let Some(aux) = description.aux_data.filter(|aux| aux.is_default) else {
            return false;
        };
        let Some(frame_id) = aux.frame_id else {
            return false;
        };
        match self.contexts.main_frame() {
            Some(main) if main != frame_id => return false,
            Some(_) => {}
            None => self.contexts.set_main_frame(frame_id.clone()),
        }

        debug!(target: "cdp-adapter", context = description.id, frame = %frame_id, "main world context created");
        metrics::record_context_created();
        self.contexts.install(Arc::new(CdpExecutionContext::new(
            self.session.clone(),
            description.id,
            frame_id,
        )));
        true
    }

    fn drop_context(&self, id: i64) {
        if self.contexts.remove(id) {
            debug!(target: "cdp-adapter", context = id, "main world context destroyed");
            metrics::record_context_dropped();
        }
    }

    fn clear_contexts(&self) {
        if self.contexts.current().is_some() {
            metrics::record_context_dropped();
        }
        self.contexts.clear();
    }

    /// Marks the page gone for good and fails every wait still running.
    pub async fn detach(&self, reason: &str) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "cdp-adapter", session = %self.session.id(), reason, "page detached");
        self.contexts.clear();
        self.manager.terminate_all(WaitError::FrameDetached).await;
    }

    /// Runs the host handler for a page-side binding call and settles the page's promise.
    fn dispatch_binding(&self, called: BindingCalled) {
        let payload: BindingPayload = match serde_json::from_str(&called.payload) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(target: "cdp-adapter", name = %called.name, %err, "ignoring foreign binding payload");
                return;
            }
        };
        let Some(handler) = self
            .handlers
            .get(&payload.name)
            .map(|entry| Arc::clone(entry.value()))
        else {
            debug!(target: "cdp-adapter", name = %payload.name, "no handler for binding call");
            return;
        };
        let Some(context) = self.contexts.get(called.execution_context_id) else {
            debug!(target: "cdp-adapter", context = called.execution_context_id, "binding call from unknown context");
            return;
        };

        metrics::record_binding_call();
        tokio::spawn(async move {
            let (ok, value) = match handler(payload.args).await {
                Ok(value) => (true, value),
                Err(message) => (false, Value::String(message)),
            };
            let deliver = RemoteCall::new(BINDING_DELIVER)
                .arg(json!(payload.name))
                .arg(json!(payload.seq))
                .arg(json!(ok))
                .arg(value);
            if let Err(err) = context.evaluate(&deliver).await {
                debug!(target: "cdp-adapter", name = %payload.name, %err, "binding result not delivered");
            }
        });
    }
}

#[async_trait]
impl ContextProvider for CdpWorld {
    async fn execution_context(&self) -> Result<Arc<dyn ExecutionContext>, ContextError> {
        if self.is_detached() {
            return Err(ContextError::detached("page session detached"));
        }
        match self.contexts.current() {
            Some(context) => Ok(context as Arc<dyn ExecutionContext>),
            None => Err(ContextError::destroyed("main frame has no execution context yet")),
        }
    }

    async fn expose_binding(
        &self,
        context: &dyn ExecutionContext,
        binding: &Binding,
    ) -> Result<(), ContextError> {
        self.handlers
            .insert(binding.name.clone(), Arc::clone(&binding.handler));
        if self.added_bindings.insert(binding.name.clone()) {
            if let Err(err) = self
                .session
                .send("Runtime.addBinding", json!({ "name": binding.name }))
                .await
            {
                self.added_bindings.remove(&binding.name);
                return Err(err.into());
            }
        }
        context
            .evaluate(&RemoteCall::new(BINDING_WRAPPER).arg(json!(binding.name)))
            .await?;
        Ok(())
    }
}

/// Feeds transport events into a [`CdpWorld`].
pub struct WorldWatcher {
    world: Arc<CdpWorld>,
}

impl WorldWatcher {
    pub fn new(world: Arc<CdpWorld>) -> Self {
        Self { world }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Consumes events until the transport closes, then detaches the world.
    pub async fn run(self) {
        let transport = Arc::clone(self.world.session.transport());
        while let Some(event) = transport.next_event().await {
            self.handle(event).await;
        }
        warn!(target: "cdp-adapter", "event stream ended");
        self.world.detach("transport closed").await;
    }

    pub async fn handle(&self, event: TransportEvent) {
        metrics::record_event();
        let world = &self.world;

        // Reported on the browser connection, not on the page session.
        if event.method == "Target.detachedFromTarget" {
            if let Ok(detached) = serde_json::from_value::<DetachedFromTarget>(event.params) {
                if detached.session_id == world.session.id() {
                    world.detach("target detached").await;
                }
            }
            return;
        }
        if event.session_id.as_deref() != Some(world.session.id()) {
            return;
        }

        match event.method.as_str() {
            "Runtime.executionContextCreated" => {
                let Some(created) = parse::<ContextCreated>(&event) else {
                    return;
                };
                if world.install_context(created) {
                    let manager = Arc::clone(&world.manager);
                    tokio::spawn(async move { manager.rerun_all().await });
                }
            }
            "Runtime.executionContextDestroyed" => {
                if let Some(destroyed) = parse::<ContextDestroyed>(&event) {
                    world.drop_context(destroyed.execution_context_id);
                }
            }
            "Runtime.executionContextsCleared" => world.clear_contexts(),
            "Page.frameNavigated" => {
                if let Some(navigated) = parse::<FrameNavigated>(&event) {
                    if navigated.frame.parent_id.is_none() {
                        world.contexts.set_main_frame(navigated.frame.id);
                    }
                }
            }
            "Page.frameDetached" => {
                if let Some(detached) = parse::<FrameDetached>(&event) {
                    // A process swap replaces the frame rather than removing it.
                    let swapped = detached.reason.as_deref() == Some("swap");
                    if !swapped && world.contexts.is_main_frame(&detached.frame_id) {
                        world.detach("main frame detached").await;
                    }
                }
            }
            "Inspector.detached" => world.detach("inspector detached").await,
            "Runtime.bindingCalled" => {
                if let Some(called) = parse::<BindingCalled>(&event) {
                    world.dispatch_binding(called);
                }
            }
            _ => {}
        }
    }
}

fn parse<T: for<'de> Deserialize<'de>>(event: &TransportEvent) -> Option<T> {
    match serde_json::from_value(event.params.clone()) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(target: "cdp-adapter", method = %event.method, %err, "malformed event");
            None
        }
    }
}

fn string_field(value: &Value, field: &str) -> Result<String, AdapterError> {
    value[field].as_str().map(str::to_string).ok_or_else(|| {
        AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("response is missing {field}"))
            .with_data(value.clone())
    })
}

#[derive(Debug, Deserialize)]
struct ContextCreated {
    context: ContextDescription,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextDescription {
    id: i64,
    aux_data: Option<AuxData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuxData {
    #[serde(default)]
    is_default: bool,
    frame_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextDestroyed {
    execution_context_id: i64,
}

#[derive(Debug, Deserialize)]
struct FrameNavigated {
    frame: FrameInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameInfo {
    id: String,
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameDetached {
    frame_id: String,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetachedFromTarget {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindingCalled {
    name: String,
    payload: String,
    execution_context_id: i64,
}

#[derive(Debug, Deserialize)]
struct BindingPayload {
    name: String,
    seq: u64,
    #[serde(default)]
    args: Vec<Value>,
}
