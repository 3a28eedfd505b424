use crate::export::ExportFormat;
use crate::parser::parse_selector;
use anyhow::{Context, Result, anyhow, bail};
use clap::ValueEnum;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use walkdir::WalkDir;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; DataScraper/1.0)";
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);
const MAX_BACKOFF_FACTOR_SECS: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct LoadedJob {
    pub path: PathBuf,
    pub config: JobConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub job: JobMeta,
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub urls: Vec<String>,
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.job.name.trim().is_empty() {
            bail!("job.name must not be empty");
        }
        if self.job.concurrency == 0 {
            bail!("job.concurrency must be at least 1");
        }

        match self.fetch.mode {
            FetchMode::Http => {
                if self.urls.is_empty() {
                    bail!("urls must list at least one target for http mode");
                }
                for url in &self.urls {
                    Url::parse(url).with_context(|| format!("invalid url {url}"))?;
                }
                if let Some(proxy) = &self.fetch.proxy {
                    Url::parse(proxy).with_context(|| format!("invalid proxy url {proxy}"))?;
                }
            }
            FetchMode::File => {
                if self.fetch.file_path.is_none() {
                    bail!("fetch.file_path is required for file mode");
                }
            }
            FetchMode::Inline => {
                if self.fetch.inline_data.is_none() {
                    bail!("fetch.inline_data is required for inline mode");
                }
            }
        }

        self.fetch.validate()?;
        if self.rate_limit.enabled {
            self.rate_limit.validate()?;
        }
        self.extract.validate()?;

        if self.export.filename.trim().is_empty() {
            bail!("export.filename must not be empty");
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobMeta {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    #[default]
    Http,
    File,
    Inline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchSettings {
    #[serde(default)]
    pub mode: FetchMode,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_true")]
    pub respect_robots: bool,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub inline_data: Option<String>,
}

impl FetchSettings {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            bail!("fetch.timeout_secs must be positive");
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 0.0 {
            bail!("fetch.backoff_factor must be a non-negative number");
        }
        if self.backoff_factor > MAX_BACKOFF_FACTOR_SECS {
            bail!("fetch.backoff_factor must be at most {MAX_BACKOFF_FACTOR_SECS} seconds");
        }
        if self.user_agent.trim().is_empty() {
            bail!("fetch.user_agent must not be empty");
        }
        Ok(())
    }

    /// Sleep before the retry that follows zero-based `attempt`, capped at
    /// [`MAX_BACKOFF`].
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let secs = self.backoff_factor * 2f64.powi(attempt.min(16) as i32);
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).map_or(MAX_BACKOFF, |backoff| backoff.min(MAX_BACKOFF))
    }

    /// The product token robots.txt groups are matched against.
    pub fn robots_agent(&self) -> &str {
        robots_token(&self.user_agent)
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            mode: FetchMode::Http,
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            backoff_factor: default_backoff_factor(),
            user_agent: default_user_agent(),
            headers: BTreeMap::new(),
            proxy: None,
            respect_robots: true,
            file_path: None,
            inline_data: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: usize,
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: usize,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            bail!("rate_limit.requests_per_second must be positive");
        }
        if self.requests_per_minute == 0 || self.requests_per_hour == 0 {
            bail!("rate_limit window limits must be positive");
        }
        if self.burst_size == 0 {
            bail!("rate_limit.burst_size must be at least 1");
        }
        Ok(())
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: default_requests_per_second(),
            requests_per_minute: default_requests_per_minute(),
            requests_per_hour: default_requests_per_hour(),
            burst_size: default_burst_size(),
            min_delay_ms: default_min_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExtractMode {
    #[default]
    Items,
    Links,
    Table,
    Meta,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    #[serde(default)]
    pub mode: ExtractMode,
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default = "default_fields")]
    pub fields: Vec<FieldSpec>,
    #[serde(default = "default_link_selector")]
    pub link_selector: String,
    #[serde(default = "default_table_selector")]
    pub table_selector: String,
}

impl ExtractConfig {
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            ExtractMode::Items => {
                parse_selector(&self.container).context("extract.container")?;
                if self.fields.is_empty() {
                    bail!("extract.fields must not be empty for items extraction");
                }
                for field in &self.fields {
                    field
                        .validate()
                        .with_context(|| format!("extract field {}", field.name))?;
                }
            }
            ExtractMode::Links => {
                parse_selector(&self.link_selector).context("extract.link_selector")?;
            }
            ExtractMode::Table => {
                parse_selector(&self.table_selector).context("extract.table_selector")?;
            }
            ExtractMode::Meta => {}
        }
        Ok(())
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            mode: ExtractMode::Items,
            container: default_container(),
            fields: default_fields(),
            link_selector: default_link_selector(),
            table_selector: default_table_selector(),
        }
    }
}

/// How one named value is pulled out of an item container.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub selector: String,
    #[serde(default)]
    pub attr: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub capture: Option<usize>,
    #[serde(default)]
    pub absolutize: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selector: selector.into(),
            attr: None,
            regex: None,
            capture: None,
            absolutize: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("field name must not be empty");
        }
        let (selector, _) = crate::parser::split_selector_attr(&self.selector);
        parse_selector(selector)?;
        if let Some(pattern) = &self.regex {
            Regex::new(pattern).with_context(|| format!("invalid regex pattern {pattern}"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_filename")]
    pub filename: String,
    #[serde(default)]
    pub format: ExportFormat,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            filename: default_filename(),
            format: ExportFormat::default(),
        }
    }
}

pub fn load_job_file(config_path: &Path) -> Result<LoadedJob> {
    let text = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read job config: {}", config_path.display()))?;
    let config: JobConfig = toml::from_str(&text)
        .with_context(|| format!("failed to parse toml in {}", config_path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid job config {}", config_path.display()))?;
    Ok(LoadedJob {
        path: config_path.to_path_buf(),
        config,
    })
}

pub fn load_jobs_from_dir(config_dir: &Path) -> Result<Vec<LoadedJob>> {
    if !config_dir.exists() {
        bail!("config dir does not exist: {}", config_dir.display());
    }

    let mut loaded = Vec::new();
    for entry in WalkDir::new(config_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("toml") {
            continue;
        }
        loaded.push(load_job_file(path)?);
    }

    loaded.sort_by(|a, b| a.config.job.name.cmp(&b.config.job.name));
    Ok(loaded)
}

pub fn resolve_path(base_config_path: &Path, maybe_relative: &Path) -> Result<PathBuf> {
    if maybe_relative.is_absolute() {
        return Ok(maybe_relative.to_path_buf());
    }

    let parent = base_config_path.parent().ok_or_else(|| {
        anyhow!(
            "job config has no parent directory: {}",
            base_config_path.display()
        )
    })?;

    Ok(parent.join(maybe_relative))
}

/// Parses a `name=selector` pair as given on the command line.
pub fn parse_field_mapping(pair: &str) -> Result<FieldSpec> {
    let Some((name, selector)) = pair.split_once('=') else {
        bail!("invalid field mapping: {pair} (expected name=selector)");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("invalid field mapping: {pair} (field name is empty)");
    }
    Ok(FieldSpec::new(name, selector.trim()))
}

fn robots_token(user_agent: &str) -> &str {
    // "Mozilla/5.0 (compatible; DataScraper/1.0)" -> "DataScraper"
    if let Some(inner) = user_agent
        .split_once("compatible;")
        .map(|(_, rest)| rest.trim_start())
    {
        let token = inner
            .split(|c: char| c == '/' || c == ';' || c == ')' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        if !token.is_empty() {
            return token;
        }
    }
    user_agent.split('/').next().unwrap_or(user_agent).trim()
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    0.3
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_requests_per_second() -> f64 {
    1.0
}

fn default_requests_per_minute() -> usize {
    60
}

fn default_requests_per_hour() -> usize {
    1000
}

fn default_burst_size() -> u32 {
    5
}

fn default_min_delay_ms() -> u64 {
    100
}

fn default_container() -> String {
    ".item".to_string()
}

pub fn default_fields() -> Vec<FieldSpec> {
    vec![FieldSpec::new("title", ".title"), FieldSpec::new("price", ".price")]
}

fn default_link_selector() -> String {
    "a".to_string()
}

fn default_table_selector() -> String {
    "table".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_filename() -> String {
    "scraped_data".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_job_takes_defaults() {
        let config: JobConfig = toml::from_str(
            r#"
            urls = ["https://example.com/shop"]

            [job]
            name = "shop"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.fetch.retries, 3);
        assert_eq!(config.fetch.timeout_secs, 10);
        assert!(config.fetch.respect_robots);
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.extract.container, ".item");
        assert_eq!(config.extract.fields, default_fields());
        assert_eq!(config.export.filename, "scraped_data");
        assert_eq!(config.export.format, ExportFormat::Csv);
    }

    #[test]
    fn fields_keep_declared_order() {
        let config: JobConfig = toml::from_str(
            r#"
            urls = ["https://example.com"]

            [job]
            name = "books"

            [extract]
            container = "article.product_pod"

            [[extract.fields]]
            name = "title"
            selector = "h3 a@title"

            [[extract.fields]]
            name = "price"
            selector = ".price_color"
            regex = '[\d.]+'
            capture = 0
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        let names: Vec<_> = config.extract.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["title", "price"]);
        assert_eq!(config.extract.fields[1].capture, Some(0));
    }

    #[test]
    fn http_mode_requires_urls() {
        let config: JobConfig = toml::from_str("[job]\nname = \"empty\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least one target"));
    }

    #[test]
    fn rejects_bad_selector() {
        let config: JobConfig = toml::from_str(
            r#"
            urls = ["https://example.com"]
            [job]
            name = "bad"
            [extract]
            container = "div[["
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn field_mapping_splits_on_first_equals() {
        let spec = parse_field_mapping("link=a[href='x=1']@href").unwrap();
        assert_eq!(spec.name, "link");
        assert_eq!(spec.selector, "a[href='x=1']@href");

        assert!(parse_field_mapping("no-separator").is_err());
        assert!(parse_field_mapping("=.title").is_err());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let settings = FetchSettings::default();
        assert_eq!(settings.backoff_for(0), Duration::from_secs_f64(0.3));
        assert_eq!(settings.backoff_for(2), Duration::from_secs_f64(1.2));
    }

    #[test]
    fn huge_backoff_factor_is_capped_and_rejected() {
        let settings = FetchSettings {
            backoff_factor: 1e20,
            ..FetchSettings::default()
        };
        assert_eq!(settings.backoff_for(0), MAX_BACKOFF);
        assert_eq!(settings.backoff_for(16), MAX_BACKOFF);
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("at most"));

        let config: JobConfig = toml::from_str(
            r#"
            urls = ["https://example.com"]
            [job]
            name = "slow"
            [fetch]
            backoff_factor = 1e20
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_rate_is_rejected() {
        let config = RateLimitConfig {
            enabled: true,
            requests_per_second: 0.0,
            ..RateLimitConfig::default()
        };
        assert!(config.validate().is_err());
        let negative = RateLimitConfig {
            requests_per_second: -2.0,
            ..config
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn robots_token_from_compatible_agent() {
        assert_eq!(robots_token(DEFAULT_USER_AGENT), "DataScraper");
        assert_eq!(robots_token("harvest/0.1"), "harvest");
    }
}
