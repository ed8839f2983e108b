use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::Deserialize;

use crate::taxonomy;

/// TOML-backed application configuration.
///
/// String values anywhere in the file may reference environment variables as
/// `${VAR}`; substitution happens before deserialization and a missing
/// variable is a fatal configuration error.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub ai: AiConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub taxonomy: TaxonomyConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EmailConfig {
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_true")]
    pub use_ssl: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from_addr: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default)]
    pub to_addrs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Interval between fetch cycles, e.g. "30m", "2h".
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval: String,
    /// Wall-clock digest times, e.g. ["09:00", "18:30"].
    #[serde(default = "default_digest_times")]
    pub digest_times: Vec<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            fetch_interval: default_fetch_interval(),
            digest_times: default_digest_times(),
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_top_pick_count")]
    pub top_pick_count: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_max_articles")]
    pub max_articles_per_digest: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            top_pick_count: default_top_pick_count(),
            min_score: default_min_score(),
            max_articles_per_digest: default_max_articles(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_retention_days")]
    pub article_retention_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            article_retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_telemetry_path")]
    pub storage_path: String,
    #[serde(default = "default_telemetry_retention")]
    pub retention_days: i64,
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage_path: default_telemetry_path(),
            retention_days: default_telemetry_retention(),
            max_content_length: default_max_content_length(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_max_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default = "default_max_extractions")]
    pub max_concurrent_extractions: usize,
    #[serde(default = "default_max_analyses")]
    pub max_concurrent_analyses: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: default_max_fetches(),
            max_concurrent_extractions: default_max_extractions(),
            max_concurrent_analyses: default_max_analyses(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TaxonomyConfig {
    /// Override for the preset root-category list.
    #[serde(default)]
    pub l3_roots: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS allowlist. Empty means same-origin only; never a wildcard.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f64 {
    0.7
}
fn default_smtp_port() -> u16 {
    465
}
fn default_true() -> bool {
    true
}
fn default_from_name() -> String {
    "Briefwire".to_string()
}
fn default_fetch_interval() -> String {
    "2h".to_string()
}
fn default_digest_times() -> Vec<String> {
    vec!["09:00".to_string()]
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_top_pick_count() -> usize {
    5
}
fn default_min_score() -> f64 {
    5.0
}
fn default_max_articles() -> usize {
    20
}
fn default_database_path() -> String {
    "data/briefwire.db".to_string()
}
fn default_retention_days() -> i64 {
    180
}
fn default_telemetry_path() -> String {
    "data/telemetry".to_string()
}
fn default_telemetry_retention() -> i64 {
    30
}
fn default_max_content_length() -> usize {
    10_000
}
fn default_max_fetches() -> usize {
    10
}
fn default_max_extractions() -> usize {
    5
}
fn default_max_analyses() -> usize {
    5
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}

impl Config {
    /// Load, substitute environment variables, deserialize, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut value: toml::Value = content.parse().context("Failed to parse config as TOML")?;
        substitute_env(&mut value)?;
        let config: Config = value.try_into().context("Invalid config structure")?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Failures here abort before the scheduler starts.
    fn validate(&self) -> Result<()> {
        if self.ai.api_key.trim().is_empty() {
            bail!("ai.api_key is required");
        }
        if self.ai.model.trim().is_empty() {
            bail!("ai.model is required");
        }
        parse_interval(&self.schedule.fetch_interval)
            .with_context(|| format!("invalid schedule.fetch_interval: {}", self.schedule.fetch_interval))?;
        for t in &self.schedule.digest_times {
            parse_digest_time(t).with_context(|| format!("invalid schedule.digest_times entry: {t}"))?;
        }
        self.timezone()
            .with_context(|| format!("invalid schedule.timezone: {}", self.schedule.timezone))?;
        Ok(())
    }

    pub fn fetch_interval(&self) -> Duration {
        // Validated at load; the fallback only covers hand-built configs.
        parse_interval(&self.schedule.fetch_interval).unwrap_or(Duration::from_secs(2 * 3600))
    }

    pub fn digest_times(&self) -> Vec<NaiveTime> {
        self.schedule
            .digest_times
            .iter()
            .filter_map(|t| parse_digest_time(t).ok())
            .collect()
    }

    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        self.schedule
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("unknown timezone '{}': {e}", self.schedule.timezone))
    }

    /// Effective root-category list: config override or the preset 18.
    pub fn l3_roots(&self) -> Vec<String> {
        if self.taxonomy.l3_roots.is_empty() {
            taxonomy::default_roots()
        } else {
            self.taxonomy.l3_roots.clone()
        }
    }
}

/// Parse `<value><unit>` intervals where unit is one of s, m, h, d.
pub fn parse_interval(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.len() < 2 {
        bail!("interval too short: '{s}'");
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let value: u64 = num
        .trim()
        .parse()
        .with_context(|| format!("invalid interval value: '{num}'"))?;
    if value == 0 {
        bail!("interval must be positive: '{s}'");
    }
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        other => bail!("unknown interval unit '{other}' (expected s, m, h, d)"),
    };
    Ok(Duration::from_secs(secs))
}

/// Parse "HH:MM" wall-clock digest times.
pub fn parse_digest_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("expected HH:MM, got '{s}'"))
}

/// Recursively substitute `${VAR}` references from the environment in every
/// string value of the TOML tree.
fn substitute_env(value: &mut toml::Value) -> Result<()> {
    match value {
        toml::Value::String(s) => {
            if s.contains("${") {
                *s = expand_vars(s)?;
            }
        }
        toml::Value::Array(items) => {
            for item in items {
                substitute_env(item)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, v) in table.iter_mut() {
                substitute_env(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn expand_vars(input: &str) -> Result<String> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            bail!("unterminated ${{VAR}} reference in '{input}'");
        };
        let var = &after[..end];
        let value = std::env::var(var)
            .with_context(|| format!("environment variable '{var}' referenced in config is not set"))?;
        result.push_str(&value);
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}
