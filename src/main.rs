use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use harvest::config::{
    DEFAULT_USER_AGENT, ExtractConfig, ExtractMode, FetchSettings, RateLimitConfig,
    default_fields, parse_field_mapping,
};
use harvest::export::ExportFormat;
use harvest::pipeline::{
    BatchOptions, ScrapeOptions, run_batch, run_job_file, run_scrape, validate_jobs,
};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "harvest",
    about = "Fetch web pages, extract fields with CSS selectors, export CSV/JSON"
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scrape a single URL
    Scrape {
        url: String,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Scrape many URLs concurrently into one export
    Batch {
        urls: Vec<String>,
        /// File with one URL per line; blank lines and `#` comments are ignored
        #[arg(long)]
        urls_file: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        concurrency: usize,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Run a TOML job file
    Run { job: PathBuf },
    /// Validate a job file, or every job file under a directory
    Validate { path: PathBuf },
}

#[derive(Args, Debug)]
struct CommonArgs {
    #[arg(short, long, default_value = "output")]
    output: PathBuf,
    #[arg(short, long, default_value = "scraped_data")]
    filename: String,
    #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
    format: ExportFormat,
    #[arg(long, value_enum, default_value_t = ExtractMode::Items)]
    mode: ExtractMode,
    /// CSS selector for item containers
    #[arg(long, default_value = ".item")]
    container: String,
    /// Field mappings as name=selector pairs (e.g. title=.title link=a@href)
    #[arg(long, num_args = 0.., value_name = "NAME=SELECTOR")]
    fields: Vec<String>,
    #[arg(long, default_value = "a")]
    link_selector: String,
    #[arg(long, default_value = "table")]
    table_selector: String,
    #[arg(long, default_value_t = 3)]
    retries: u32,
    #[arg(long, default_value_t = 10)]
    timeout: u64,
    #[arg(long, default_value = DEFAULT_USER_AGENT)]
    user_agent: String,
    #[arg(long)]
    proxy: Option<String>,
    /// Skip the robots.txt check
    #[arg(long, default_value_t = false)]
    no_robots: bool,
    /// Throttle requests per host to this many per second
    #[arg(long)]
    rate: Option<f64>,
}

impl CommonArgs {
    fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            retries: self.retries,
            timeout_secs: self.timeout,
            user_agent: self.user_agent.clone(),
            proxy: self.proxy.clone(),
            respect_robots: !self.no_robots,
            ..FetchSettings::default()
        }
    }

    fn rate_limit(&self) -> Result<Option<RateLimitConfig>> {
        let Some(requests_per_second) = self.rate else {
            return Ok(None);
        };
        let config = RateLimitConfig {
            enabled: true,
            requests_per_second,
            ..RateLimitConfig::default()
        };
        config
            .validate()
            .with_context(|| format!("invalid --rate {requests_per_second}"))?;
        Ok(Some(config))
    }

    fn extract_config(&self) -> Result<ExtractConfig> {
        let fields = if self.fields.is_empty() {
            default_fields()
        } else {
            self.fields
                .iter()
                .map(|pair| parse_field_mapping(pair))
                .collect::<Result<Vec<_>>>()?
        };
        let extract = ExtractConfig {
            mode: self.mode,
            container: self.container.clone(),
            fields,
            link_selector: self.link_selector.clone(),
            table_selector: self.table_selector.clone(),
        };
        extract.validate()?;
        Ok(extract)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Commands::Scrape { url, common } => {
            let fetch = common.fetch_settings();
            fetch.validate()?;
            let result = run_scrape(&ScrapeOptions {
                url,
                output_dir: common.output.clone(),
                filename: common.filename.clone(),
                format: common.format,
                fetch,
                rate_limit: common.rate_limit()?,
                extract: common.extract_config()?,
            })?;

            match result {
                Some(path) => info!(file = %path.display(), "exported"),
                None => bail!("nothing was exported"),
            }
        }
        Commands::Batch {
            mut urls,
            urls_file,
            concurrency,
            common,
        } => {
            if let Some(path) = urls_file {
                urls.extend(read_urls_file(&path)?);
            }
            let fetch = common.fetch_settings();
            fetch.validate()?;
            let (outcomes, output) = run_batch(&BatchOptions {
                urls,
                concurrency,
                output_dir: common.output.clone(),
                filename: common.filename.clone(),
                format: common.format,
                fetch,
                rate_limit: common.rate_limit()?,
                extract: common.extract_config()?,
            })?;

            for outcome in outcomes.iter().filter(|o| !o.success) {
                warn!(
                    url = %outcome.url,
                    status = outcome.status,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    "url failed"
                );
            }
            match output {
                Some(path) => info!(file = %path.display(), "exported"),
                None => bail!("nothing was exported"),
            }
        }
        Commands::Run { job } => {
            let report = run_job_file(&job)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.output.is_none() {
                error!(job = %report.job, "job produced no output");
                bail!("nothing was exported");
            }
        }
        Commands::Validate { path } => {
            for line in validate_jobs(&path)? {
                println!("{line}");
            }
        }
    }

    Ok(())
}

fn read_urls_file(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read urls file {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect())
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_args(extra: &[&str]) -> CommonArgs {
        let mut argv = vec!["harvest", "batch", "https://shop.example/"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Batch { common, .. } => common,
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn zero_or_negative_rate_is_rejected() {
        for rate in ["--rate=0", "--rate=-1.5"] {
            let err = batch_args(&[rate]).rate_limit().unwrap_err();
            assert!(format!("{err:#}").contains("--rate"));
        }
    }

    #[test]
    fn rate_enables_the_limiter() {
        let config = batch_args(&["--rate", "2.5"]).rate_limit().unwrap().unwrap();
        assert!(config.enabled);
        assert_eq!(config.requests_per_second, 2.5);
        assert!(batch_args(&[]).rate_limit().unwrap().is_none());
    }
}
