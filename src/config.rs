use serde::Deserialize;
use std::{fs, path::Path, time::Duration};
use anyhow::{bail, Context, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub net: Net,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub odr: Odr,
    #[serde(default)]
    pub pool: Pool,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Net {
    #[serde(default)]
    pub bootstrap: Vec<String>,          // multiaddrs ending in /p2p/<peer id>
    #[serde(default = "default_max_light_peers")]
    pub max_light_peers: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    #[serde(default = "default_path")]
    pub path: String,
}

/// Retrieval tuning. Timeouts are in milliseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct Odr {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_bloom_workers")]
    pub bloom_workers: usize,
    #[serde(default = "default_bloom_batch")]
    pub bloom_batch: usize,
    #[serde(default = "default_cht_section")]
    pub cht_section_size: u64,
    #[serde(default = "default_bloom_section")]
    pub bloom_section_size: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Pool {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_explore_ratio")]
    pub explore_ratio: f64,
    #[serde(default = "default_persist_interval")]
    pub persist_interval_secs: u64,
    #[serde(default = "default_backoff_base")]
    pub dial_backoff_base_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub dial_backoff_max_secs: u64,
    /// Fixed RNG seed for candidate exploration; entropy when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_max_light_peers() -> usize { 25 }
fn default_path() -> String { "light_data".into() }
fn default_max_attempts() -> u32 { 5 }
fn default_attempt_timeout() -> u64 { 1_500 }
fn default_request_timeout() -> u64 { 10_000 }
fn default_bloom_workers() -> usize { 3 }
fn default_bloom_batch() -> usize { 16 }
fn default_cht_section() -> u64 { 32_768 }
fn default_bloom_section() -> u64 { 4_096 }
fn default_max_entries() -> usize { 256 }
fn default_explore_ratio() -> f64 { 0.2 }
fn default_persist_interval() -> u64 { 60 }
fn default_backoff_base() -> u64 { 5 }
fn default_backoff_max() -> u64 { 3_600 }
fn default_bind() -> String { "0.0.0.0:9100".into() }
fn default_level() -> String { "info".into() }

impl Default for Net {
    fn default() -> Self {
        Self { bootstrap: Vec::new(), max_light_peers: default_max_light_peers() }
    }
}

impl Default for Storage {
    fn default() -> Self { Self { path: default_path() } }
}

impl Default for Odr {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: default_attempt_timeout(),
            request_timeout_ms: default_request_timeout(),
            bloom_workers: default_bloom_workers(),
            bloom_batch: default_bloom_batch(),
            cht_section_size: default_cht_section(),
            bloom_section_size: default_bloom_section(),
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            explore_ratio: default_explore_ratio(),
            persist_interval_secs: default_persist_interval(),
            dial_backoff_base_secs: default_backoff_base(),
            dial_backoff_max_secs: default_backoff_max(),
            seed: None,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self { Self { enabled: false, bind: default_bind() } }
}

impl Default for Log {
    fn default() -> Self { Self { level: default_level() } }
}

impl Odr {
    pub fn attempt_timeout(&self) -> Duration { Duration::from_millis(self.attempt_timeout_ms) }
    pub fn request_timeout(&self) -> Duration { Duration::from_millis(self.request_timeout_ms) }
}

impl Config {
    /// Reject settings the retrieval loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.odr.max_attempts == 0 {
            bail!("odr.max_attempts must be at least 1");
        }
        if self.odr.attempt_timeout_ms >= self.odr.request_timeout_ms {
            bail!(
                "odr.attempt_timeout_ms ({}) must be shorter than odr.request_timeout_ms ({})",
                self.odr.attempt_timeout_ms,
                self.odr.request_timeout_ms
            );
        }
        if self.odr.bloom_workers == 0 {
            bail!("odr.bloom_workers must be at least 1");
        }
        if self.odr.cht_section_size == 0 || self.odr.bloom_section_size == 0 {
            bail!("section sizes must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.pool.explore_ratio) {
            bail!("pool.explore_ratio must be within [0, 1], got {}", self.pool.explore_ratio);
        }
        if self.pool.max_entries == 0 {
            bail!("pool.max_entries must be at least 1");
        }
        Ok(())
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read, parsed or validated.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("couldn't read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
        .with_context(|| format!("invalid config file {}", p.as_ref().display()))
}

pub fn load_from_str(text: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(text).context("invalid TOML in config")?;
    cfg.validate()?;
    Ok(cfg)
}
