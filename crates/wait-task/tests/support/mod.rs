//! In-process stand-in for a page.
//!
//! `SimPage` plays the execution-context provider: it owns a JSON "document", hands out
//! execution contexts that can be destroyed by navigation or detachment, and instantiates
//! pollers that follow the injected poller script (first check before arming, one re-check
//! per mutation batch / frame / interval tick, disarm on settlement).

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use soulbrowser_wait_task::{
    Binding, BindingRegistry, ContextError, ContextProvider, Deferred, ExecutionContext,
    RemoteArg, RemoteCall, RemoteHandle,
};
use tokio::task::JoinHandle;

pub type PredicateFn = Arc<dyn Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Watch {
    Mutation,
    Frame,
    Interval,
}

pub struct SimPage {
    document: Mutex<Value>,
    predicates: DashMap<String, PredicateFn>,
    context: Mutex<Option<Arc<SimContext>>>,
    contexts: Mutex<Vec<Arc<SimContext>>>,
    detached: AtomicBool,
    pending_mutations: AtomicUsize,
    exposed: Mutex<Vec<(String, String)>>,
    expose_delay: Mutex<Duration>,
    failing_exposures: AtomicUsize,
    disposed: AtomicUsize,
}

impl SimPage {
    pub fn new(document: Value) -> Arc<Self> {
        let page = Arc::new(Self {
            document: Mutex::new(document),
            predicates: DashMap::new(),
            context: Mutex::new(None),
            contexts: Mutex::new(Vec::new()),
            detached: AtomicBool::new(false),
            pending_mutations: AtomicUsize::new(0),
            exposed: Mutex::new(Vec::new()),
            expose_delay: Mutex::new(Duration::ZERO),
            failing_exposures: AtomicUsize::new(0),
            disposed: AtomicUsize::new(0),
        });
        page.attach_context();
        page
    }

    /// Registers a predicate; waits refer to it by `name` as their source.
    pub fn define<F>(&self, name: &str, predicate: F)
    where
        F: Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.predicates.insert(name.to_string(), Arc::new(predicate));
    }

    pub fn document(&self) -> Value {
        self.document.lock().clone()
    }

    /// Changes the document without any observable notification.
    pub fn set(&self, key: &str, value: Value) {
        self.document.lock()[key] = value;
    }

    /// Structural change: queued until [`SimPage::flush_mutations`] delivers the batch.
    pub fn mutate(&self, key: &str, value: Value) {
        self.set(key, value);
        self.pending_mutations.fetch_add(1, Ordering::SeqCst);
    }

    /// Fires observer callbacks once for all queued records.
    pub fn flush_mutations(&self) {
        if self.pending_mutations.swap(0, Ordering::SeqCst) == 0 {
            return;
        }
        self.notify(Watch::Mutation);
    }

    pub fn tick_frame(&self) {
        self.notify(Watch::Frame);
    }

    /// Replaces the current context, as a navigation would.
    pub fn navigate(&self) {
        self.destroy_context(ContextError::destroyed("Execution context was destroyed"));
        self.attach_context();
    }

    /// Tears the current context down without a replacement yet.
    pub fn unload(&self) {
        self.destroy_context(ContextError::destroyed("Execution context was destroyed"));
    }

    pub fn attach_context(&self) -> Arc<SimContext> {
        let mut contexts = self.contexts.lock();
        let context = Arc::new(SimContext {
            id: format!("ctx-{}", contexts.len() + 1),
            alive: AtomicBool::new(true),
            bindings: BindingRegistry::new(),
            pollers: Mutex::new(Vec::new()),
        });
        contexts.push(Arc::clone(&context));
        *self.context.lock() = Some(Arc::clone(&context));
        context
    }

    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.destroy_context(ContextError::detached("frame detached"));
    }

    pub fn current_context(&self) -> Option<Arc<SimContext>> {
        self.context.lock().clone()
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn pollers(&self) -> Vec<Arc<SimPoller>> {
        self.contexts
            .lock()
            .iter()
            .flat_map(|context| context.pollers.lock().clone())
            .collect()
    }

    pub fn current_pollers(&self) -> Vec<Arc<SimPoller>> {
        match self.current_context() {
            Some(context) => {
                let pollers = context.pollers.lock().clone();
                pollers
            }
            None => Vec::new(),
        }
    }

    pub fn exposed(&self) -> Vec<(String, String)> {
        self.exposed.lock().clone()
    }

    /// Every later exposure takes `delay` before it lands.
    pub fn slow_exposures(&self, delay: Duration) {
        *self.expose_delay.lock() = delay;
    }

    /// The next `count` exposures fail after their delay.
    pub fn fail_exposures(&self, count: usize) {
        self.failing_exposures.store(count, Ordering::SeqCst);
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    fn notify(&self, watch: Watch) {
        let document = self.document();
        for poller in self.current_pollers() {
            poller.notify(watch, &document);
        }
    }

    fn destroy_context(&self, error: ContextError) {
        if let Some(context) = self.context.lock().take() {
            context.destroy(error);
        }
    }

    fn poller_from_call(
        self: &Arc<Self>,
        context: &Arc<SimContext>,
        call: &RemoteCall,
    ) -> Result<Arc<SimPoller>, ContextError> {
        let options = match call.args.first() {
            Some(RemoteArg::Json(options)) => options.clone(),
            _ => return Err(ContextError::evaluation("TypeError: missing poller options")),
        };
        let source = options["predicate"]["source"].as_str().unwrap_or_default();
        let predicate = self
            .predicates
            .get(source)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ContextError::evaluation(format!("SyntaxError: cannot compile predicate {source}"))
            })?;
        let watch = match options["polling"].as_str() {
            Some("mutation") => Watch::Mutation,
            Some("raf") => Watch::Frame,
            Some("interval") => Watch::Interval,
            other => {
                return Err(ContextError::evaluation(format!(
                    "TypeError: unknown polling mode {other:?}"
                )))
            }
        };
        let args = call
            .args
            .iter()
            .skip(2)
            .map(|arg| match arg {
                RemoteArg::Json(value) => value.clone(),
                RemoteArg::Handle(handle) => json!({ "objectId": handle.object_id() }),
            })
            .collect();

        let exposed_at_creation = self
            .exposed
            .lock()
            .iter()
            .filter(|(id, _)| *id == context.id)
            .count();
        let poller = Arc::new(SimPoller {
            page: Arc::clone(self),
            exposed_at_creation,
            predicate,
            args,
            watch,
            interval: Duration::from_millis(options["interval"].as_u64().unwrap_or(100)),
            result: Deferred::new(),
            started: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            arm_count: AtomicUsize::new(0),
            evaluations: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            ticker: Mutex::new(None),
        });
        context.pollers.lock().push(Arc::clone(&poller));
        Ok(poller)
    }
}

/// Provider face of a [`SimPage`].
pub struct SimProvider(pub Arc<SimPage>);

#[async_trait]
impl ContextProvider for SimProvider {
    async fn execution_context(&self) -> Result<Arc<dyn ExecutionContext>, ContextError> {
        let page = &self.0;
        if page.detached.load(Ordering::SeqCst) {
            return Err(ContextError::detached("frame detached"));
        }
        match page.current_context() {
            Some(context) => Ok(Arc::new(SimContextRef {
                page: Arc::clone(page),
                context,
            })),
            None => Err(ContextError::destroyed("execution context not ready")),
        }
    }

    async fn expose_binding(
        &self,
        context: &dyn ExecutionContext,
        binding: &Binding,
    ) -> Result<(), ContextError> {
        let page = &self.0;
        let delay = *page.expose_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = page
            .failing_exposures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ContextError::protocol(format!(
                "binding {} could not be added",
                binding.name
            )));
        }
        page.exposed
            .lock()
            .push((context.id(), binding.name.clone()));
        Ok(())
    }
}

pub struct SimContext {
    pub id: String,
    alive: AtomicBool,
    bindings: BindingRegistry,
    pollers: Mutex<Vec<Arc<SimPoller>>>,
}

impl SimContext {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn destroy(&self, error: ContextError) {
        self.alive.store(false, Ordering::SeqCst);
        for poller in self.pollers.lock().iter() {
            poller.result.reject(error.clone());
            poller.disarm();
        }
    }
}

/// Context as seen by the task: the page plus one of its contexts.
struct SimContextRef {
    page: Arc<SimPage>,
    context: Arc<SimContext>,
}

#[async_trait]
impl ExecutionContext for SimContextRef {
    fn id(&self) -> String {
        self.context.id.clone()
    }

    async fn evaluate(&self, _call: &RemoteCall) -> Result<Value, ContextError> {
        if !self.context.is_alive() {
            return Err(ContextError::not_found("Cannot find context with specified id"));
        }
        Ok(Value::Null)
    }

    async fn evaluate_handle(
        &self,
        call: &RemoteCall,
    ) -> Result<Arc<dyn RemoteHandle>, ContextError> {
        if !self.context.is_alive() {
            return Err(ContextError::not_found("Cannot find context with specified id"));
        }
        let poller = self.page.poller_from_call(&self.context, call)?;
        Ok(Arc::new(SimHandle {
            context: Arc::clone(&self.context),
            poller,
        }))
    }

    fn bindings(&self) -> &BindingRegistry {
        &self.context.bindings
    }
}

pub struct SimPoller {
    page: Arc<SimPage>,
    exposed_at_creation: usize,
    predicate: PredicateFn,
    args: Vec<Value>,
    pub watch: Watch,
    interval: Duration,
    result: Deferred<Value, ContextError>,
    started: AtomicBool,
    armed: AtomicBool,
    arm_count: AtomicUsize,
    evaluations: AtomicUsize,
    stop_calls: AtomicUsize,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SimPoller {
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// How many times a watch was registered.
    pub fn arm_count(&self) -> usize {
        self.arm_count.load(Ordering::SeqCst)
    }

    /// Bindings already exposed in the poller's context when it was created.
    pub fn exposed_at_creation(&self) -> usize {
        self.exposed_at_creation
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn is_settled(&self) -> bool {
        self.result.settled()
    }

    fn check(&self, document: &Value) -> bool {
        if self.result.settled() {
            return true;
        }
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        match (self.predicate)(document, &self.args) {
            Err(message) => {
                self.result.reject(ContextError::evaluation(message));
                self.disarm();
                true
            }
            Ok(value) if truthy(&value) => {
                self.result.resolve(value);
                self.disarm();
                true
            }
            Ok(_) => false,
        }
    }

    fn start(self: &Arc<Self>) -> Result<(), ContextError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ContextError::evaluation("Error: poller already started"));
        }
        if self.check(&self.page.document()) {
            return Ok(());
        }
        self.armed.store(true, Ordering::SeqCst);
        self.arm_count.fetch_add(1, Ordering::SeqCst);
        if self.watch == Watch::Interval {
            let poller = Arc::clone(self);
            *self.ticker.lock() = Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(poller.interval).await;
                    if !poller.is_armed() {
                        break;
                    }
                    if poller.check(&poller.page.document()) {
                        break;
                    }
                }
            }));
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.result
            .reject(ContextError::evaluation("Error: Polling stopped"));
        self.disarm();
    }

    fn notify(&self, watch: Watch, document: &Value) {
        if self.watch == watch && self.is_armed() {
            self.check(document);
        }
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
    }
}

struct SimHandle {
    context: Arc<SimContext>,
    poller: Arc<SimPoller>,
}

#[async_trait]
impl RemoteHandle for SimHandle {
    fn object_id(&self) -> Option<String> {
        Some(format!("{}/poller", self.context.id))
    }

    async fn evaluate(&self, function: &str) -> Result<Value, ContextError> {
        if !self.context.is_alive() {
            return Err(ContextError::not_found("Cannot find context with specified id"));
        }
        if function.contains("start()") {
            self.poller.start()?;
            Ok(Value::Null)
        } else if function.contains("stop()") {
            self.poller.stop();
            Ok(Value::Null)
        } else if function.contains("result()") {
            self.poller.result.wait().await
        } else {
            Err(ContextError::protocol(format!("unsupported call {function}")))
        }
    }

    async fn evaluate_handle(&self, _function: &str) -> Result<Arc<dyn RemoteHandle>, ContextError> {
        Err(ContextError::protocol("nested handles are not simulated"))
    }

    async fn dispose(&self) -> Result<(), ContextError> {
        if !self.context.is_alive() {
            return Err(ContextError::not_found("Cannot find context with specified id"));
        }
        self.poller.page.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
