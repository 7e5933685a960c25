use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::convergence::ScanPolicy;
use crate::error::HarvestError;
use crate::sink::SinkFormat;

const ENV_PREFIX: &str = "HARVEST";

/// Run settings. Precedence, low to high: defaults, config file, `HARVEST_*` env vars,
/// command-line flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub target_url: String,
    /// Appended after the page number.
    pub page_query: String,
    pub output: PathBuf,
    pub format: SinkFormat,
    pub workers: usize,
    pub scroll_factor: f64,
    pub scroll_pause_ms: u64,
    pub settle_ms: u64,
    pub max_no_change: u32,
    pub max_iterations: u32,
    pub render_timeout_ms: u64,
    pub pagination_timeout_ms: u64,
    pub selectors: Selectors,
    pub browser: BrowserSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_url: "https://www.ouedkniss.com/automobiles_vehicules/".into(),
            page_query: "?orderBy=CREATED_AT".into(),
            output: PathBuf::from("./cars_file.csv"),
            format: SinkFormat::Auto,
            workers: 6,
            scroll_factor: 2.5,
            scroll_pause_ms: 1000,
            settle_ms: 1000,
            max_no_change: 2,
            max_iterations: 400,
            render_timeout_ms: 15_000,
            pagination_timeout_ms: 10_000,
            selectors: Selectors::default(),
            browser: BrowserSettings::default(),
        }
    }
}

/// CSS selectors for the listing feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Selectors {
    pub card: String,
    /// Element whose `id` attribute is the listing id.
    pub id_holder: String,
    pub title: String,
    pub city: String,
    pub price: String,
    pub link: String,
    pub specification: String,
    pub pagination_list: String,
    pub pagination_item: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            card: "div[class*='v-col-sm-6 v-col-md-4 v-col-lg-3 v-col-12']".into(),
            id_holder: ".v-col-sm-6.v-col-md-4.v-col-lg-3.v-col-12 > div".into(),
            title: "h3[class*='announ-card-title']".into(),
            city: "span[class*='city']".into(),
            price: "span.price".into(),
            link: "a[class*='link']".into(),
            specification: "span[class*='v-chip']".into(),
            pagination_list: ".v-pagination__list".into(),
            pagination_item: "li.v-pagination__item".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub disable_images: bool,
    pub no_sandbox: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            disable_images: true,
            no_sandbox: false,
        }
    }
}

impl Settings {
    /// Layer the optional config file and the environment over the defaults.
    pub fn load(file: Option<&Path>) -> Result<Self, HarvestError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Settings>()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        let invalid = |msg: &str| -> Result<(), HarvestError> {
            Err(HarvestError::InvalidSettings(msg.to_string()))
        };
        if !(self.target_url.starts_with("http://") || self.target_url.starts_with("https://")) {
            return invalid("target_url must be an http(s) URL");
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.max_no_change == 0 {
            return invalid("max_no_change must be at least 1");
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be at least 1");
        }
        if !(self.scroll_factor.is_finite() && self.scroll_factor > 0.0) {
            return invalid("scroll_factor must be positive");
        }
        Ok(())
    }

    pub fn page_url(&self, page: u32) -> String {
        format!("{}{}{}", self.target_url, page, self.page_query)
    }

    pub fn scan_policy(&self) -> ScanPolicy {
        ScanPolicy {
            step_factor: self.scroll_factor,
            pause: Duration::from_millis(self.scroll_pause_ms),
            settle: Duration::from_millis(self.settle_ms),
            max_no_change: self.max_no_change,
            max_iterations: self.max_iterations,
        }
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }

    pub fn pagination_timeout(&self) -> Duration {
        Duration::from_millis(self.pagination_timeout_ms)
    }
}
