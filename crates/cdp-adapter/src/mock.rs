//! Scriptable transport for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::AdapterError;
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};

type Responder = Box<dyn Fn(&str, &Value) -> Option<Result<Value, AdapterError>> + Send + Sync>;

pub(crate) struct MockTransport {
    rx: AsyncMutex<mpsc::Receiver<TransportEvent>>,
    commands: Mutex<Vec<(CommandTarget, String, Value)>>,
    responders: Mutex<Vec<Responder>>,
}

impl MockTransport {
    pub(crate) fn new_pair() -> (Arc<Self>, mpsc::Sender<TransportEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Arc::new(Self {
                rx: AsyncMutex::new(rx),
                commands: Mutex::new(Vec::new()),
                responders: Mutex::new(Vec::new()),
            }),
            tx,
        )
    }

    /// Adds a responder; the first one returning `Some` answers a command.
    pub(crate) fn respond<F>(&self, responder: F)
    where
        F: Fn(&str, &Value) -> Option<Result<Value, AdapterError>> + Send + Sync + 'static,
    {
        self.responders.lock().push(Box::new(responder));
    }

    pub(crate) fn commands(&self) -> Vec<(CommandTarget, String, Value)> {
        self.commands.lock().clone()
    }

    /// Parameters of every command sent with `method`.
    pub(crate) fn calls(&self, method: &str) -> Vec<Value> {
        self.commands
            .lock()
            .iter()
            .filter(|(_, name, _)| name == method)
            .map(|(_, _, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl CdpTransport for MockTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.rx.lock().await.recv().await
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        self.commands
            .lock()
            .push((target, method.to_string(), params.clone()));
        let responders = self.responders.lock();
        responders
            .iter()
            .find_map(|responder| responder(method, &params))
            .unwrap_or_else(|| Ok(json!({})))
    }
}

pub(crate) fn event(method: &str, session: &str, params: Value) -> TransportEvent {
    TransportEvent {
        method: method.to_string(),
        params,
        session_id: Some(session.to_string()),
    }
}
