//! Browser connection.
//!
//! [`ChromiumTransport`] owns one DevTools websocket. A background loop multiplexes outgoing
//! commands and incoming responses/events over it; callers only see request/response pairs
//! and a stream of [`TransportEvent`]s. A dead link is replaced on next use.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::util::extract_ws_url;

#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), AdapterError>;
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError>;
}

/// Transport for runs without a browser; every command fails.
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl CdpTransport for NoopTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        None
    }

    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        _params: Value,
    ) -> Result<Value, AdapterError> {
        Err(AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("no browser connected for {method}")))
    }
}

type LinkFactory =
    Arc<dyn Fn(CdpConfig) -> BoxFuture<'static, Result<Arc<BrowserLink>, AdapterError>> + Send + Sync>;

#[derive(Clone)]
pub struct ChromiumTransport {
    cfg: CdpConfig,
    link: Arc<Mutex<Option<Arc<BrowserLink>>>>,
    factory: LinkFactory,
}

impl ChromiumTransport {
    pub fn new(cfg: CdpConfig) -> Self {
        let factory: LinkFactory = Arc::new(|cfg: CdpConfig| {
            async move { BrowserLink::open(cfg).await.map(Arc::new) }.boxed()
        });
        Self::with_factory(cfg, factory)
    }

    fn with_factory(cfg: CdpConfig, factory: LinkFactory) -> Self {
        Self {
            cfg,
            link: Arc::new(Mutex::new(None)),
            factory,
        }
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.cfg.default_deadline_ms)
    }

    async fn link(&self) -> Result<Arc<BrowserLink>, AdapterError> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref() {
            if link.is_alive() {
                return Ok(Arc::clone(link));
            }
            warn!(target: "cdp-transport", "browser link lost; reconnecting");
        }

        let link = (self.factory)(self.cfg.clone()).await?;
        *guard = Some(Arc::clone(&link));
        Ok(link)
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        let link = self.link().await?;
        link.request(
            CommandTarget::Browser,
            "Target.setDiscoverTargets",
            json!({ "discover": true }),
            self.deadline(),
        )
        .await?;
        Ok(())
    }

    /// Events of the current link only; a lost link ends the stream instead of reconnecting.
    async fn next_event(&self) -> Option<TransportEvent> {
        let link = self.link.lock().await.clone();
        match link {
            Some(link) => link.next_event().await,
            None => {
                warn!(target: "cdp-transport", "transport not started");
                None
            }
        }
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        self.link()
            .await?
            .request(target, method, params, self.deadline())
            .await
    }
}

type Responder = oneshot::Sender<Result<Value, AdapterError>>;

struct Outgoing {
    target: CommandTarget,
    method: String,
    params: Value,
    responder: Responder,
}

/// One live websocket plus the tasks serving it.
struct BrowserLink {
    commands: mpsc::Sender<Outgoing>,
    events: Mutex<mpsc::Receiver<TransportEvent>>,
    pump: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
    child: Mutex<Option<Child>>,
    alive: Arc<AtomicBool>,
}

impl BrowserLink {
    async fn open(cfg: CdpConfig) -> Result<Self, AdapterError> {
        let (child, ws_url) = match cfg.websocket_url.clone() {
            Some(url) => (None, url),
            None => launch_browser(browser_config(&cfg)?).await?,
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;

        let (commands, command_rx) = mpsc::channel(128);
        let (events_tx, events) = mpsc::channel(512);
        let alive = Arc::new(AtomicBool::new(true));

        let pump_alive = Arc::clone(&alive);
        let pump = tokio::spawn(async move {
            let outcome = drive(conn, command_rx, events_tx).await;
            pump_alive.store(false, Ordering::Relaxed);
            if let Err(err) = outcome {
                error!(target: "cdp-transport", ?err, "browser link closed with error");
            }
        });

        let heartbeat = spawn_heartbeat(
            commands.clone(),
            Arc::clone(&alive),
            Duration::from_millis(cfg.heartbeat_interval_ms),
            Duration::from_millis(cfg.default_deadline_ms).min(Duration::from_secs(5)),
        );

        info!(target: "cdp-transport", url = %ws_url, "browser link established");

        Ok(Self {
            commands,
            events: Mutex::new(events),
            pump,
            heartbeat,
            child: Mutex::new(child),
            alive,
        })
    }

    #[cfg(test)]
    fn stub() -> (Arc<Self>, Arc<AtomicBool>) {
        let (commands, _command_rx) = mpsc::channel(8);
        let (_events_tx, events) = mpsc::channel(8);
        let alive = Arc::new(AtomicBool::new(true));
        (
            Arc::new(Self {
                commands,
                events: Mutex::new(events),
                pump: tokio::spawn(futures::future::pending::<()>()),
                heartbeat: None,
                child: Mutex::new(None),
                alive: Arc::clone(&alive),
            }),
            alive,
        )
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn request(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, AdapterError> {
        let (responder, response) = oneshot::channel();
        self.commands
            .send(Outgoing {
                target,
                method: method.to_string(),
                params,
                responder,
            })
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;

        match tokio::time::timeout(deadline, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint(format!("{method}: response channel closed"))),
            Err(_) => Err(AdapterError::new(AdapterErrorKind::Timeout)
                .with_hint(format!("{method}: no response within {}ms", deadline.as_millis()))
                .retriable(true)),
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }
}

impl Drop for BrowserLink {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.pump.abort();
        if let Some(handle) = &self.heartbeat {
            handle.abort();
        }

        let Ok(mut guard) = self.child.try_lock() else {
            return;
        };
        let Some(mut child) = guard.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = child.kill().await {
                        warn!(target: "cdp-transport", ?err, "failed to kill chromium child");
                    }
                });
            }
            Err(_) => {
                debug!(target: "cdp-transport", "no tokio runtime available to kill chromium child");
            }
        }
    }
}

fn spawn_heartbeat(
    commands: mpsc::Sender<Outgoing>,
    alive: Arc<AtomicBool>,
    every: Duration,
    deadline: Duration,
) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        while alive.load(Ordering::Relaxed) {
            ticker.tick().await;

            let (responder, response) = oneshot::channel();
            let probe = Outgoing {
                target: CommandTarget::Browser,
                method: "Browser.getVersion".to_string(),
                params: json!({}),
                responder,
            };
            if commands.send(probe).await.is_err() {
                debug!(target: "cdp-transport", "heartbeat stopped: link closed");
                break;
            }

            match tokio::time::timeout(deadline, response).await {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(err))) => {
                    warn!(target: "cdp-transport", ?err, "heartbeat failed");
                    break;
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(target: "cdp-transport", "heartbeat timed out");
                    break;
                }
            }
        }
    }))
}

fn browser_config(cfg: &CdpConfig) -> Result<BrowserConfig, AdapterError> {
    let config_error = |err: String| {
        AdapterError::new(AdapterErrorKind::Internal).with_hint(format!("browser config error: {err}"))
    };

    if !cfg.executable.as_os_str().is_empty() && !cfg.executable.exists() {
        return Err(AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(format!(
                "chrome executable not found at {}",
                cfg.executable.display()
            ))
            .with_data(json!({
                "expected": cfg.executable,
                "hint": "Set SOULBROWSER_CHROME to the full path of chrome/chromium."
            })));
    }

    let profile_dir = if cfg.user_data_dir.is_absolute() {
        cfg.user_data_dir.clone()
    } else {
        std::env::current_dir()
            .map_err(|err| config_error(format!("cannot resolve user-data-dir: {err}")))?
            .join(&cfg.user_data_dir)
    };
    fs::create_dir_all(&profile_dir)
        .map_err(|err| config_error(format!("cannot create user-data-dir: {err}")))?;

    let mut builder = BrowserConfig::builder()
        .request_timeout(Duration::from_millis(cfg.default_deadline_ms))
        .launch_timeout(Duration::from_secs(20))
        .user_data_dir(profile_dir);

    if !cfg.headless {
        builder = builder.with_head();
    }
    if std::env::var("SOULBROWSER_DISABLE_SANDBOX")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        builder = builder.no_sandbox();
    }

    let mut args = vec![
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-renderer-backgrounding",
        "--disable-dev-shm-usage",
        "--disable-extensions",
        "--disable-sync",
        "--no-first-run",
        "--no-default-browser-check",
        "--remote-allow-origins=*",
    ];
    if cfg.headless {
        args.push("--headless=new");
        args.push("--mute-audio");
    }
    builder = builder.args(args);

    if !cfg.executable.as_os_str().is_empty() {
        builder = builder.chrome_executable(cfg.executable.clone());
    }

    builder.build().map_err(config_error)
}

async fn launch_browser(config: BrowserConfig) -> Result<(Option<Child>, String), AdapterError> {
    let mut child = config.launch().map_err(|err| {
        AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(format!("failed to launch chromium: {err}"))
    })?;

    let ws_url = extract_ws_url(&mut child)
        .await
        .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;

    Ok((Some(child), ws_url))
}

async fn drive(
    mut conn: Connection<CdpEventMessage>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    events: mpsc::Sender<TransportEvent>,
) -> Result<(), AdapterError> {
    let mut inflight: HashMap<CallId, Responder> = HashMap::new();

    loop {
        tokio::select! {
            Some(command) = outgoing.recv() => {
                submit(&mut conn, command, &mut inflight)?;
            }
            message = conn.next() => match message {
                Some(Ok(Message::Response(resp))) => {
                    if let Some(responder) = inflight.remove(&resp.id) {
                        let _ = responder.send(response_payload(resp));
                    }
                }
                Some(Ok(Message::Event(event))) => {
                    if let Err(err) = forward_event(event, &events).await {
                        warn!(target: "cdp-transport", ?err, "failed to forward event");
                    }
                }
                Some(Err(err)) => {
                    let err = map_cdp_error(err);
                    fail_inflight(&mut inflight, &err);
                    return Err(err);
                }
                None => {
                    let err = AdapterError::new(AdapterErrorKind::TargetDetached)
                        .with_hint("devtools connection closed");
                    fail_inflight(&mut inflight, &err);
                    return Ok(());
                }
            }
        }
    }
}

fn submit(
    conn: &mut Connection<CdpEventMessage>,
    command: Outgoing,
    inflight: &mut HashMap<CallId, Responder>,
) -> Result<(), AdapterError> {
    let session = match command.target {
        CommandTarget::Browser => None,
        CommandTarget::Session(id) => Some(CdpSessionId::from(id)),
    };
    let method: MethodId = command.method.into();
    match conn.submit_command(method, session, command.params) {
        Ok(call_id) => {
            inflight.insert(call_id, command.responder);
            Ok(())
        }
        Err(err) => {
            let err = AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string());
            let _ = command.responder.send(Err(err.clone()));
            Err(err)
        }
    }
}

fn fail_inflight(inflight: &mut HashMap<CallId, Responder>, err: &AdapterError) {
    for (_, responder) in inflight.drain() {
        let _ = responder.send(Err(err.clone()));
    }
}

async fn forward_event(
    event: CdpEventMessage,
    events: &mpsc::Sender<TransportEvent>,
) -> Result<(), AdapterError> {
    let raw: CdpJsonEventMessage = event.try_into().map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("failed to decode cdp event: {err}"))
    })?;

    events
        .send(TransportEvent {
            method: raw.method.into_owned(),
            params: raw.params,
            session_id: raw.session_id,
        })
        .await
        .map_err(|err| AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string()))
}

fn response_payload(resp: Response) -> Result<Value, AdapterError> {
    match (resp.result, resp.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(AdapterError::protocol(error.code, &error.message)),
        (None, None) => {
            Err(AdapterError::new(AdapterErrorKind::Internal).with_hint("empty cdp response"))
        }
    }
}

fn map_cdp_error(err: CdpError) -> AdapterError {
    let hint = err.to_string();
    match err {
        CdpError::Timeout => AdapterError::new(AdapterErrorKind::Timeout)
            .with_hint(hint)
            .retriable(true),
        CdpError::JavascriptException(_) => {
            AdapterError::new(AdapterErrorKind::Exception).with_hint(hint)
        }
        CdpError::Serde(_) | CdpError::DecodeError(_) => {
            AdapterError::new(AdapterErrorKind::Internal).with_hint(hint)
        }
        _ => AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(hint)
            .retriable(true),
    }
}
