use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cdp_adapter::{connect, CdpTransport, CdpWorld, WorldWatcher};
use clap::{ArgGroup, Args};
use serde_json::Value;
use soulbrowser_wait_task::{
    ContextProvider, Polling, Predicate, RemoteArg, TaskManager, WaitError, WaitOptions, WaitTask,
};
use tracing::{debug, info, warn};

use super::context::CliContext;
use super::output::OutputFormat;

#[derive(Args, Clone, Debug)]
#[command(group(ArgGroup::new("predicate").required(true).args(["function", "expression"])))]
pub struct WaitArgs {
    /// Predicate function source, called with the --arg values
    #[arg(long, value_name = "SOURCE")]
    pub function: Option<String>,

    /// Predicate expression source
    #[arg(long, value_name = "SOURCE")]
    pub expression: Option<String>,

    /// JSON argument passed to the predicate function (repeatable)
    #[arg(long = "arg", value_name = "JSON", value_parser = parse_json_arg)]
    pub args: Vec<Value>,

    /// Polling mode: mutation, raf or an interval in milliseconds
    #[arg(long, value_parser = parse_polling)]
    pub polling: Option<Polling>,

    /// Timeout in milliseconds (0 waits indefinitely)
    #[arg(long, value_name = "MS")]
    pub timeout: Option<u64>,

    /// Navigate here before waiting
    #[arg(long)]
    pub url: Option<String>,

    /// DevTools websocket of an already running browser
    #[arg(long, value_name = "URL")]
    pub ws_url: Option<String>,
}

impl WaitArgs {
    fn predicate(&self) -> Predicate {
        match (&self.function, &self.expression) {
            (Some(source), _) => Predicate::function(source.clone()),
            (None, Some(source)) => Predicate::expression(source.clone()),
            (None, None) => Predicate::expression("true"),
        }
    }

    /// Command-line values over configured defaults.
    fn options(&self, ctx: &CliContext) -> WaitOptions {
        let mut options = ctx.config().wait.options();
        if let Some(polling) = self.polling {
            options = options.with_polling(polling);
        }
        if let Some(timeout) = self.timeout {
            options = options.with_timeout(Duration::from_millis(timeout));
        }
        options
    }
}

fn parse_json_arg(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|err| format!("not valid JSON: {err}"))
}

fn parse_polling(raw: &str) -> Result<Polling, String> {
    raw.parse().map_err(|err: WaitError| err.to_string())
}

pub async fn cmd_wait(args: WaitArgs, ctx: &CliContext, output: OutputFormat) -> Result<()> {
    let options = args.options(ctx);
    options.validate()?;
    let predicate = args.predicate();

    let mut cdp = ctx.config().cdp.clone();
    if let Some(url) = &args.ws_url {
        cdp.websocket_url = Some(url.clone());
    }
    let transport = connect(cdp).context("Failed to prepare browser connection")?;
    transport
        .start()
        .await
        .context("Failed to start browser transport")?;

    let manager = Arc::new(TaskManager::new());
    let world = CdpWorld::open(transport, Arc::clone(&manager))
        .await
        .context("Failed to open a page")?;
    let watcher = WorldWatcher::new(Arc::clone(&world)).spawn();
    world
        .enable()
        .await
        .context("Failed to enable page domains")?;
    if let Some(url) = &args.url {
        info!(%url, "navigating before wait");
        world
            .navigate(url)
            .await
            .with_context(|| format!("Failed to navigate to {url}"))?;
    }

    let task = WaitTask::spawn(
        Arc::clone(&world) as Arc<dyn ContextProvider>,
        &manager,
        predicate,
        args.args.into_iter().map(RemoteArg::from).collect(),
        options,
    );
    debug!(task_id = %task.id(), "waiting");

    let outcome = tokio::select! {
        outcome = task.result() => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; terminating wait");
            manager
                .terminate_all(WaitError::Terminated("interrupted".into()))
                .await;
            task.result().await
        }
    };
    watcher.abort();

    let value = outcome?;
    println!("{}", output.render(&value)?);
    Ok(())
}
