//! Remote evaluation over `Runtime.callFunctionOn`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use soulbrowser_wait_task::{
    BindingRegistry, ContextError, ExecutionContext, RemoteArg, RemoteCall, RemoteHandle,
};
use tracing::trace;

use crate::error::{AdapterError, AdapterErrorKind};
use crate::metrics;
use crate::transport::{CdpTransport, CommandTarget};

/// Flat-mode session attached to one page target.
#[derive(Clone)]
pub struct PageSession {
    transport: Arc<dyn CdpTransport>,
    session_id: String,
}

impl PageSession {
    pub fn new(transport: Arc<dyn CdpTransport>, session_id: impl Into<String>) -> Self {
        Self {
            transport,
            session_id: session_id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn transport(&self) -> &Arc<dyn CdpTransport> {
        &self.transport
    }

    pub async fn send(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        let start = Instant::now();
        metrics::record_command(method);
        match self
            .transport
            .send_command(CommandTarget::Session(self.session_id.clone()), method, params)
            .await
        {
            Ok(value) => {
                metrics::record_command_success(method, start.elapsed());
                Ok(value)
            }
            Err(err) => {
                metrics::record_command_failure(method, err.kind.as_str());
                Err(err)
            }
        }
    }

    async fn call_function(
        &self,
        receiver: Receiver<'_>,
        function: &str,
        arguments: Vec<Value>,
        by_value: bool,
    ) -> Result<RemoteObject, AdapterError> {
        let mut params = json!({
            "functionDeclaration": function,
            "arguments": arguments,
            "awaitPromise": true,
            "returnByValue": by_value,
        });
        match receiver {
            Receiver::Context(id) => params["executionContextId"] = json!(id),
            Receiver::Object(id) => params["objectId"] = json!(id),
        }

        let response = self.send("Runtime.callFunctionOn", params).await?;
        let outcome: CallOutcome = serde_json::from_value(response).map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("malformed callFunctionOn response: {err}"))
        })?;
        if let Some(details) = outcome.exception_details {
            return Err(AdapterError::new(AdapterErrorKind::Exception).with_hint(details.message()));
        }
        Ok(outcome.result)
    }
}

enum Receiver<'a> {
    Context(i64),
    Object(&'a str),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallOutcome {
    #[serde(default)]
    result: RemoteObject,
    exception_details: Option<ExceptionDetails>,
}

/// Mirror of the protocol's `Runtime.RemoteObject`, reduced to what evaluation needs.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub value: Option<Value>,
    pub unserializable_value: Option<String>,
    pub object_id: Option<String>,
    pub description: Option<String>,
}

impl RemoteObject {
    /// By-value result; `undefined` maps to null, `NaN`/`Infinity`/bigints to their literal text.
    fn into_value(self) -> Value {
        match (self.value, self.unserializable_value) {
            (Some(value), _) => value,
            (None, Some(literal)) => Value::String(literal),
            (None, None) => Value::Null,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExceptionDetails {
    text: String,
    exception: Option<RemoteObject>,
}

impl ExceptionDetails {
    fn message(&self) -> String {
        self.exception
            .as_ref()
            .and_then(|exception| {
                exception.description.clone().or_else(|| {
                    exception
                        .value
                        .as_ref()
                        .map(|value| value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()))
                })
            })
            .unwrap_or_else(|| self.text.clone())
    }
}

fn call_argument(arg: &RemoteArg) -> Value {
    match arg {
        RemoteArg::Json(value) => json!({ "value": value }),
        RemoteArg::Handle(handle) => match handle.object_id() {
            Some(object_id) => json!({ "objectId": object_id }),
            None => json!({ "value": Value::Null }),
        },
    }
}

/// Default execution context of a frame, addressed by its protocol id.
pub struct CdpExecutionContext {
    session: PageSession,
    id: i64,
    frame_id: String,
    bindings: BindingRegistry,
}

impl CdpExecutionContext {
    pub fn new(session: PageSession, id: i64, frame_id: impl Into<String>) -> Self {
        Self {
            session,
            id,
            frame_id: frame_id.into(),
            bindings: BindingRegistry::new(),
        }
    }

    pub fn context_id(&self) -> i64 {
        self.id
    }

    pub fn frame_id(&self) -> &str {
        &self.frame_id
    }
}

#[async_trait]
impl ExecutionContext for CdpExecutionContext {
    fn id(&self) -> String {
        self.id.to_string()
    }

    async fn evaluate(&self, call: &RemoteCall) -> Result<Value, ContextError> {
        trace!(context = self.id, args = call.args.len(), "evaluating by value");
        let object = self
            .session
            .call_function(
                Receiver::Context(self.id),
                &call.function,
                call.args.iter().map(call_argument).collect(),
                true,
            )
            .await?;
        Ok(object.into_value())
    }

    async fn evaluate_handle(
        &self,
        call: &RemoteCall,
    ) -> Result<Arc<dyn RemoteHandle>, ContextError> {
        let object = self
            .session
            .call_function(
                Receiver::Context(self.id),
                &call.function,
                call.args.iter().map(call_argument).collect(),
                false,
            )
            .await?;
        Ok(Arc::new(CdpRemoteHandle::new(self.session.clone(), self.id, object)))
    }

    fn bindings(&self) -> &BindingRegistry {
        &self.bindings
    }
}

/// Remote object kept alive in the page until disposed.
pub struct CdpRemoteHandle {
    session: PageSession,
    context_id: i64,
    object: RemoteObject,
}

impl CdpRemoteHandle {
    pub fn new(session: PageSession, context_id: i64, object: RemoteObject) -> Self {
        Self {
            session,
            context_id,
            object,
        }
    }

    async fn call(&self, function: &str, by_value: bool) -> Result<RemoteObject, ContextError> {
        let outcome = match &self.object.object_id {
            Some(object_id) => {
                self.session
                    .call_function(
                        Receiver::Object(object_id),
                        function,
                        vec![json!({ "objectId": object_id })],
                        by_value,
                    )
                    .await
            }
            // Primitives have no remote identity; pass them back by value.
            None => {
                let value = self.object.clone().into_value();
                self.session
                    .call_function(
                        Receiver::Context(self.context_id),
                        function,
                        vec![json!({ "value": value })],
                        by_value,
                    )
                    .await
            }
        };
        Ok(outcome?)
    }
}

#[async_trait]
impl RemoteHandle for CdpRemoteHandle {
    fn object_id(&self) -> Option<String> {
        self.object.object_id.clone()
    }

    async fn evaluate(&self, function: &str) -> Result<Value, ContextError> {
        Ok(self.call(function, true).await?.into_value())
    }

    async fn evaluate_handle(&self, function: &str) -> Result<Arc<dyn RemoteHandle>, ContextError> {
        let object = self.call(function, false).await?;
        Ok(Arc::new(CdpRemoteHandle::new(
            self.session.clone(),
            self.context_id,
            object,
        )))
    }

    async fn dispose(&self) -> Result<(), ContextError> {
        let Some(object_id) = &self.object.object_id else {
            return Ok(());
        };
        self.session
            .send("Runtime.releaseObject", json!({ "objectId": object_id }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use soulbrowser_wait_task::ContextErrorKind;

    fn context_with(transport: &Arc<MockTransport>) -> CdpExecutionContext {
        let session = PageSession::new(Arc::clone(transport) as Arc<dyn CdpTransport>, "session-1");
        CdpExecutionContext::new(session, 7, "frame-main")
    }

    #[tokio::test]
    async fn evaluate_calls_function_in_context_by_value() {
        let (transport, _events) = MockTransport::new_pair();
        transport.respond(|method, _| {
            (method == "Runtime.callFunctionOn")
                .then(|| Ok(json!({ "result": { "type": "number", "value": 3 } })))
        });
        let context = context_with(&transport);

        let value = context
            .evaluate(&RemoteCall::new("(a, b) => a + b").arg(json!(1)).arg(json!(2)))
            .await
            .expect("evaluates");
        assert_eq!(value, json!(3));

        let (target, _, params) = transport.commands().remove(0);
        assert_eq!(target, CommandTarget::Session("session-1".into()));
        assert_eq!(params["executionContextId"], json!(7));
        assert_eq!(params["returnByValue"], json!(true));
        assert_eq!(params["awaitPromise"], json!(true));
        assert_eq!(params["arguments"], json!([{ "value": 1 }, { "value": 2 }]));
    }

    #[tokio::test]
    async fn thrown_exceptions_become_evaluation_errors() {
        let (transport, _events) = MockTransport::new_pair();
        transport.respond(|_, _| {
            Some(Ok(json!({
                "result": { "type": "object", "subtype": "error" },
                "exceptionDetails": {
                    "text": "Uncaught",
                    "exception": {
                        "type": "object",
                        "description": "ReferenceError: missing is not defined"
                    }
                }
            })))
        });
        let context = context_with(&transport);

        let err = context
            .evaluate(&RemoteCall::new("() => missing"))
            .await
            .expect_err("throws");
        assert_eq!(err.kind, ContextErrorKind::Evaluation);
        assert_eq!(err.message, "ReferenceError: missing is not defined");
    }

    #[tokio::test]
    async fn destroyed_context_is_reported_by_kind() {
        let (transport, _events) = MockTransport::new_pair();
        transport.respond(|_, _| {
            Some(Err(AdapterError::protocol(
                -32000,
                "Execution context was destroyed.",
            )))
        });
        let context = context_with(&transport);

        let err = context
            .evaluate(&RemoteCall::new("() => 1"))
            .await
            .expect_err("context gone");
        assert_eq!(err.kind, ContextErrorKind::Destroyed);
    }

    #[tokio::test]
    async fn handles_call_on_their_object_and_release_it() {
        let (transport, _events) = MockTransport::new_pair();
        transport.respond(|_, params| {
            if params.get("executionContextId").is_some() {
                Some(Ok(json!({ "result": { "type": "object", "objectId": "obj-1" } })))
            } else {
                Some(Ok(json!({ "result": { "type": "undefined" } })))
            }
        });
        let context = context_with(&transport);

        let handle = context
            .evaluate_handle(&RemoteCall::new("() => ({})"))
            .await
            .expect("handle");
        assert_eq!(handle.object_id().as_deref(), Some("obj-1"));

        let value = handle.evaluate("poller => poller.start()").await.expect("call");
        assert_eq!(value, Value::Null);
        handle.dispose().await.expect("dispose");

        let calls = transport.calls("Runtime.callFunctionOn");
        assert_eq!(calls[0]["returnByValue"], json!(false));
        assert_eq!(calls[1]["objectId"], json!("obj-1"));
        assert_eq!(calls[1]["arguments"], json!([{ "objectId": "obj-1" }]));
        assert_eq!(
            transport.calls("Runtime.releaseObject"),
            vec![json!({ "objectId": "obj-1" })]
        );

        let nested = RemoteCall::new("(root) => root").arg(RemoteArg::Handle(handle));
        context.evaluate(&nested).await.expect("handle argument");
        let calls = transport.calls("Runtime.callFunctionOn");
        assert_eq!(calls[2]["arguments"], json!([{ "objectId": "obj-1" }]));
    }

    #[test]
    fn unserializable_values_keep_their_literal() {
        let object = RemoteObject {
            kind: "number".into(),
            unserializable_value: Some("NaN".into()),
            ..RemoteObject::default()
        };
        assert_eq!(object.into_value(), json!("NaN"));
    }
}
