use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;

pub const DEFAULT_USER_AGENT: &str = "tripharvest/0.1";

/// Where a run reads and writes its files.
#[derive(Debug, Clone)]
pub struct DataLayout {
    data_dir: PathBuf,
}

impl DataLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Per-city directory holding one partial file per restaurant during a run.
    pub fn staging_dir(&self, city_key: &str) -> PathBuf {
        self.data_dir.join("restaurant").join(path_segment(city_key))
    }

    pub fn city_output(&self, city_key: &str) -> PathBuf {
        self.data_dir
            .join("restaurant")
            .join(format!("{}.csv", path_segment(city_key)))
    }

    pub fn overall_output(&self) -> PathBuf {
        self.data_dir.join("overall").join("overall.csv")
    }

    pub fn default_store_dir(&self) -> PathBuf {
        self.data_dir.join("dedup")
    }
}

/// Turns a free-form name into a single file name segment.
pub fn path_segment(raw: &str) -> String {
    let segment: String = raw
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    match segment.trim_matches('.') {
        "" => "_".to_owned(),
        _ => segment,
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            timeout: Duration::from_secs(30),
            max_retries: 2,
            delay: Duration::ZERO,
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let user_agent = std::env::var("TRIPHARVEST_USER_AGENT")
            .ok()
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.user_agent);
        let timeout = match env_number("TRIPHARVEST_HTTP_TIMEOUT_SECS")? {
            Some(secs) => Duration::from_secs(secs),
            None => defaults.timeout,
        };
        let max_retries = match env_number("TRIPHARVEST_MAX_RETRIES")? {
            Some(n) => u32::try_from(n).context("TRIPHARVEST_MAX_RETRIES is too large")?,
            None => defaults.max_retries,
        };
        Ok(Self {
            user_agent,
            timeout,
            max_retries,
            delay: defaults.delay,
        })
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay = Duration::from_millis(delay_ms);
        self
    }
}

fn env_number(name: &str) -> anyhow::Result<Option<u64>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let value = raw
        .parse::<u64>()
        .with_context(|| format!("invalid {name}={raw:?}. expected a non-negative integer"))?;
    Ok(Some(value))
}
