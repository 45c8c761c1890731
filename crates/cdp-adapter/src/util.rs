use anyhow::{anyhow, Result};
use chromiumoxide::async_process::Child;
use futures::io::{AsyncBufReadExt, BufReader};
use futures::stream::StreamExt;
use tokio::time::{timeout, Duration};

const STDERR_PREVIEW_LINES: usize = 8;

/// Waits for a freshly launched Chromium to announce its DevTools websocket on stderr.
pub async fn extract_ws_url(child: &mut Child) -> Result<String> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("chromium process missing stderr handle"))?;
    let mut lines = BufReader::new(stderr).lines();
    let mut preview = Vec::new();

    let reader = async {
        while let Some(line) = lines.next().await {
            let line = line?;
            if let Some(url) = devtools_url(&line) {
                return Ok(url.to_string());
            }
            if preview.len() < STDERR_PREVIEW_LINES {
                preview.push(line);
            }
        }
        Err(anyhow!(
            "chromium exited before exposing devtools websocket url. stderr preview: {}",
            preview.join(" | ")
        ))
    };

    timeout(Duration::from_secs(20), reader)
        .await
        .map_err(|_| anyhow!("timed out waiting for chromium devtools websocket url"))?
}

/// `DevTools listening on ws://…/devtools/browser/<id>` → the websocket URL.
fn devtools_url(line: &str) -> Option<&str> {
    let (_, url) = line.rsplit_once("listening on ")?;
    let url = url.trim();
    (url.starts_with("ws") && url.contains("devtools/browser")).then_some(url)
}
