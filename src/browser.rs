//! Chromium-backed render contexts for the listing feed.
//!
//! One browser process per run; every page task gets its own tab. Field extraction
//! happens in-page with a single script call per read, and the raw cards are turned
//! into records by the field policy in `record`.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures::StreamExt;
use regex::Regex;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::convergence::{ScrollProgress, ScrollView};
use crate::error::HarvestError;
use crate::record::{from_raw_batch, RawListing, Record};
use crate::settings::{BrowserSettings, Selectors, Settings};
use crate::worker::RenderBackend;

const RENDER_POLL: Duration = Duration::from_millis(250);

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

pub struct ChromeBackend {
    browser: Browser,
    handler: JoinHandle<()>,
    scripts: Arc<Scripts>,
    render_timeout: Duration,
    pagination_timeout: Duration,
}

/// In-page scripts, built once from the configured selectors.
struct Scripts {
    count_cards: String,
    extract_cards: String,
    has_pagination: String,
    pagination_labels: String,
}

impl Scripts {
    fn new(sel: &Selectors) -> Self {
        let q = |s: &str| serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into());
        Scripts {
            count_cards: format!("document.querySelectorAll({}).length", q(&sel.card)),
            extract_cards: format!(
                r#"(() => {{
    const text = (root, sel) => {{ const el = root.querySelector(sel); return el ? el.innerText.trim() : null; }};
    return Array.from(document.querySelectorAll({card})).map(card => {{
        const holder = card.querySelector({id});
        const anchor = card.querySelector({link});
        return {{
            id: holder ? holder.getAttribute('id') : null,
            title: text(card, {title}),
            price: text(card, {price}),
            city: text(card, {city}),
            link: anchor ? anchor.href : null,
            specifications: Array.from(card.querySelectorAll({spec})).map(e => e.innerText.trim()),
        }};
    }});
}})()"#,
                card = q(&sel.card),
                id = q(&sel.id_holder),
                link = q(&sel.link),
                title = q(&sel.title),
                price = q(&sel.price),
                city = q(&sel.city),
                spec = q(&sel.specification),
            ),
            has_pagination: format!(
                "document.querySelector({}) !== null",
                q(&sel.pagination_list)
            ),
            pagination_labels: format!(
                "Array.from(document.querySelectorAll({} + ' ' + {})).map(e => e.innerText)",
                q(&sel.pagination_list),
                q(&sel.pagination_item)
            ),
        }
    }
}

impl ChromeBackend {
    pub async fn launch(settings: &Settings) -> Result<Self, HarvestError> {
        let config = browser_config(&settings.browser).map_err(HarvestError::Browser)?;
        let (browser, mut events) = Browser::launch(config)
            .await
            .map_err(|e| HarvestError::Browser(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(e) = event {
                    debug!("browser event error: {}", e);
                }
            }
        });

        info!("Browser started");
        Ok(Self {
            browser,
            handler,
            scripts: Arc::new(Scripts::new(&settings.selectors)),
            render_timeout: settings.render_timeout(),
            pagination_timeout: settings.pagination_timeout(),
        })
    }

    /// Highest page number in the feed's pagination bar. Missing or unreadable
    /// pagination means a single page; failing to load the listing at all is an error.
    pub async fn last_page(&self, url: &str) -> Result<u32, HarvestError> {
        let discovery = |reason: String| HarvestError::Discovery {
            url: url.to_string(),
            reason,
        };
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| discovery(e.to_string()))?;

        let labels = self.pagination_labels(&page).await;
        if let Err(e) = page.close().await {
            warn!("Probe tab close failed: {}", e);
        }

        let last = match labels {
            Ok(labels) => parse_last_page(&labels).unwrap_or_else(|| {
                warn!("No numeric pagination labels, assuming a single page");
                1
            }),
            Err(e) => {
                warn!("Could not read pagination, defaulting to 1: {:#}", e);
                1
            }
        };
        info!("The last page is: {}", last);
        Ok(last)
    }

    async fn pagination_labels(&self, page: &Page) -> Result<Vec<String>> {
        let found = tokio::time::timeout(self.pagination_timeout, async {
            loop {
                if eval::<bool>(page, &self.scripts.has_pagination).await? {
                    return Ok::<_, anyhow::Error>(());
                }
                tokio::time::sleep(RENDER_POLL).await;
            }
        })
        .await;
        match found {
            Ok(res) => res?,
            Err(_) => return Err(anyhow!("pagination not rendered within {:?}", self.pagination_timeout)),
        }
        eval(page, &self.scripts.pagination_labels).await
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        if let Err(e) = self.browser.wait().await {
            warn!("Browser did not exit cleanly: {}", e);
        }
        self.handler.abort();
        info!("Browser stopped");
    }
}

#[async_trait]
impl RenderBackend for ChromeBackend {
    type View = ChromeView;

    async fn open(&self, page: u32, url: &str) -> Result<ChromeView> {
        let tab = self
            .browser
            .new_page(url)
            .await
            .with_context(|| format!("opening page {page}"))?;
        Ok(ChromeView {
            page: Some(tab),
            url: url.to_string(),
            scripts: Arc::clone(&self.scripts),
            render_timeout: self.render_timeout,
        })
    }

    async fn close(&self, mut view: ChromeView) -> Result<()> {
        match view.page.take() {
            Some(tab) => tab
                .close()
                .await
                .with_context(|| format!("closing tab for {}", view.url)),
            None => Ok(()),
        }
    }
}

/// One browser tab. Closed through the backend; a view dropped without being closed
/// schedules its own close.
pub struct ChromeView {
    page: Option<Page>,
    url: String,
    scripts: Arc<Scripts>,
    render_timeout: Duration,
}

impl ChromeView {
    fn tab(&self) -> Result<&Page> {
        self.page.as_ref().ok_or_else(|| anyhow!("tab for {} already closed", self.url))
    }

    /// Wait for at least one card. Times out to `false`, never errors on absence.
    async fn wait_for_cards(&self) -> Result<bool> {
        let tab = self.tab()?;
        let waited = tokio::time::timeout(self.render_timeout, async {
            loop {
                if eval::<u64>(tab, &self.scripts.count_cards).await? > 0 {
                    return Ok::<_, anyhow::Error>(());
                }
                tokio::time::sleep(RENDER_POLL).await;
            }
        })
        .await;
        match waited {
            Ok(res) => res.map(|_| true),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl ScrollView for ChromeView {
    async fn rewind(&mut self) -> Result<()> {
        run(self.tab()?, "window.scrollTo(0, 0)").await
    }

    async fn advance(&mut self, step_factor: f64) -> Result<()> {
        let js = format!("window.scrollBy(0, window.innerHeight * {step_factor})");
        run(self.tab()?, &js).await
    }

    async fn read_progress(&mut self) -> Result<ScrollProgress> {
        let y: f64 = eval(self.tab()?, "window.scrollY")
            .await
            .with_context(|| format!("reading scroll position on {}", self.url))?;
        Ok(ScrollProgress(y.round() as i64))
    }

    async fn extract(&mut self) -> Result<Vec<Record>> {
        if !self
            .wait_for_cards()
            .await
            .with_context(|| format!("waiting for listings on {}", self.url))?
        {
            warn!("No listings rendered on {} within {:?}", self.url, self.render_timeout);
            return Ok(Vec::new());
        }
        let raw: Vec<RawListing> = eval(self.tab()?, &self.scripts.extract_cards)
            .await
            .with_context(|| format!("extracting listings on {}", self.url))?;
        let total = raw.len();
        let records = from_raw_batch(raw);
        if records.len() < total {
            debug!("{} of {} cards on {} failed the field policy", total - records.len(), total, self.url);
        }
        Ok(records)
    }
}

impl Drop for ChromeView {
    fn drop(&mut self) {
        let Some(tab) = self.page.take() else { return };
        let url = std::mem::take(&mut self.url);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = tab.close().await {
                        warn!("Deferred tab close failed for {}: {}", url, e);
                    }
                });
            }
            Err(_) => warn!("Tab for {} dropped outside a runtime; left to the browser", url),
        }
    }
}

fn browser_config(settings: &BrowserSettings) -> Result<BrowserConfig, String> {
    let mut builder = BrowserConfig::builder();
    if !settings.headless {
        builder = builder.with_head();
    }
    if settings.no_sandbox {
        builder = builder.no_sandbox();
    }
    if let Some(exe) = &settings.executable {
        builder = builder.chrome_executable(exe);
    }
    if settings.disable_images {
        builder = builder.arg("--blink-settings=imagesEnabled=false");
    }
    builder.build()
}

async fn eval<T: DeserializeOwned>(page: &Page, js: &str) -> Result<T> {
    let params = EvaluateParams::builder()
        .expression(js)
        .return_by_value(true)
        .build()
        .map_err(|e| anyhow!(e))?;
    let value = page.evaluate_expression(params).await?.into_value::<T>()?;
    Ok(value)
}

async fn run(page: &Page, js: &str) -> Result<()> {
    let params = EvaluateParams::builder()
        .expression(js)
        .build()
        .map_err(|e| anyhow!(e))?;
    page.evaluate_expression(params).await?;
    Ok(())
}

/// Largest numeric label. Labels may carry thousands separators ("1 204").
pub fn parse_last_page(labels: &[String]) -> Option<u32> {
    labels
        .iter()
        .map(|l| WHITESPACE.replace_all(l, ""))
        .filter(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|l| l.parse::<u32>().ok())
        .filter(|&n| n >= 1)
        .max()
}
