use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tracing::{debug, info};

/// Connect to an already-running Chrome instance via CDP.
///
/// Chrome must be started with `--remote-debugging-port=<port>`, e.g.:
///   google-chrome --remote-debugging-port=9222
pub async fn connect(port: u16) -> Result<Browser> {
    let url = format!("http://127.0.0.1:{port}");
    info!(port = port, "connecting to Chrome via CDP");
    let (browser, mut handler) = Browser::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to Chrome on port {port}. Is Chrome running with --remote-debugging-port={port}?"))?;

    tokio::spawn(async move { while handler.next().await.is_some() {} });

    info!(port = port, "connected to Chrome");
    Ok(browser)
}

/// Launch a new Chrome instance. A visible window lets the chat be used
/// while it is being watched.
pub async fn launch(headless: bool) -> Result<Browser> {
    info!(headless = headless, "launching Chrome");
    let mut builder = BrowserConfig::builder()
        .no_sandbox()
        .arg("--disable-dev-shm-usage");
    if !headless {
        builder = builder.with_head();
    }
    let config = builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .context("Failed to launch Chrome. Is Chrome/Chromium installed?")?;

    tokio::spawn(async move { while handler.next().await.is_some() {} });

    info!("Chrome launched");
    Ok(browser)
}

/// Open `url` in a new tab and wait for the first navigation to finish.
pub async fn open_page(browser: &Browser, url: &str) -> Result<Page> {
    debug!(url = %url, "opening page");
    let page = browser
        .new_page(url)
        .await
        .with_context(|| format!("Failed to navigate to {url}"))?;

    page.wait_for_navigation().await.ok();

    let final_url = page
        .url()
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| url.to_string());
    debug!(final_url = %final_url, "page opened");
    Ok(page)
}

/// Evaluate `js` and read the result as a string. Evaluation failures and
/// non-string results come back empty.
pub async fn eval_string(page: &Page, js: &str) -> String {
    page.evaluate(js)
        .await
        .ok()
        .and_then(|v| v.into_value::<String>().ok())
        .unwrap_or_default()
}
