use crate::config::{
    ExtractConfig, FetchSettings, JobConfig, LoadedJob, RateLimitConfig, load_job_file,
    load_jobs_from_dir,
};
use crate::export::{ExportFormat, Exporter};
use crate::fetch::{FetchError, Fetcher};
use crate::model::{JobReport, Record, ScrapeOutcome};
use crate::parser::extract_records;
use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub url: String,
    pub output_dir: PathBuf,
    pub filename: String,
    pub format: ExportFormat,
    pub fetch: FetchSettings,
    pub rate_limit: Option<RateLimitConfig>,
    pub extract: ExtractConfig,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub urls: Vec<String>,
    pub concurrency: usize,
    pub output_dir: PathBuf,
    pub filename: String,
    pub format: ExportFormat,
    pub fetch: FetchSettings,
    pub rate_limit: Option<RateLimitConfig>,
    pub extract: ExtractConfig,
}

/// fetch -> parse -> export for a single URL. `Ok(None)` means the page was
/// fetched but nothing was extracted.
pub fn run_scrape(options: &ScrapeOptions) -> Result<Option<PathBuf>> {
    info!(url = %options.url, "scraping");

    let fetcher = Fetcher::new(options.fetch.clone(), options.rate_limit.clone())?;
    let doc = fetcher
        .fetch(&options.url)
        .with_context(|| format!("failed to fetch {}", options.url))?;

    let records = extract_records(&doc.body, &options.extract, Some(&doc.final_url))
        .with_context(|| format!("parse failed for {}", options.url))?;
    if records.is_empty() {
        warn!(url = %options.url, "no items parsed from the page");
        return Ok(None);
    }
    info!(url = %options.url, records = records.len(), "parsed records");

    let exporter = Exporter::new(&options.output_dir)?;
    exporter.export(&records, &options.filename, options.format)
}

/// Scrapes many URLs concurrently and exports the combined records once.
pub fn run_batch(options: &BatchOptions) -> Result<(Vec<ScrapeOutcome>, Option<PathBuf>)> {
    if options.urls.is_empty() {
        bail!("no urls to scrape");
    }

    let fetcher = Fetcher::new(options.fetch.clone(), options.rate_limit.clone())?;
    let outcomes = scrape_urls(&fetcher, &options.urls, &options.extract, options.concurrency);
    let records = combine_records(&outcomes);

    let exporter = Exporter::new(&options.output_dir)?;
    let output = exporter.export(&records, &options.filename, options.format)?;
    Ok((outcomes, output))
}

/// Runs every target of a job through one shared fetcher.
pub fn run_job(job: &LoadedJob) -> Result<JobReport> {
    let config = &job.config;
    let started_at = Utc::now();
    info!(job = %config.job.name, urls = config.urls.len(), "job start");

    let fetcher = Fetcher::new(config.fetch.clone(), Some(config.rate_limit.clone()))?
        .with_job_path(&job.path);
    let targets = job_targets(config);
    let outcomes = scrape_urls(&fetcher, &targets, &config.extract, config.job.concurrency);
    let records = combine_records(&outcomes);

    let exporter = Exporter::new(&config.export.output_dir)?;
    let output = exporter.export(&records, &config.export.filename, config.export.format)?;

    if let Some(limiter) = fetcher.rate_limiter() {
        for (domain, stats) in limiter.all_stats() {
            info!(
                %domain,
                requests = stats.total_requests,
                wait_secs = stats.total_wait_secs,
                "rate limiter summary"
            );
        }
    }

    let succeeded = outcomes.iter().filter(|o| o.success).count();
    let report = JobReport {
        job: config.job.name.clone(),
        started_at,
        finished_at: Utc::now(),
        urls: outcomes.len(),
        succeeded,
        failed: outcomes.len() - succeeded,
        records: records.len(),
        output: output.map(|p| p.display().to_string()),
        outcomes,
    };
    info!(
        job = %report.job,
        succeeded = report.succeeded,
        failed = report.failed,
        records = report.records,
        "job complete"
    );
    Ok(report)
}

pub fn run_job_file(path: &Path) -> Result<JobReport> {
    let job = load_job_file(path)?;
    run_job(&job)
}

/// Fetches and parses each URL on a bounded pool of scoped threads.
/// Outcomes come back in input order; one failing URL never stops the rest.
pub fn scrape_urls(
    fetcher: &Fetcher,
    urls: &[String],
    extract: &ExtractConfig,
    concurrency: usize,
) -> Vec<ScrapeOutcome> {
    if urls.is_empty() {
        return Vec::new();
    }

    let workers = concurrency.clamp(1, urls.len());
    info!(urls = urls.len(), workers, "starting scrape");
    let started = Instant::now();

    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<ScrapeOutcome>>> = Mutex::new(vec![None; urls.len()]);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(url) = urls.get(index) else {
                        break;
                    };
                    let outcome = scrape_one(fetcher, url, extract);
                    slots
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())[index] = Some(outcome);
                }
            });
        }
    });

    // The scope joins every worker, so each slot holds its outcome.
    let outcomes: Vec<ScrapeOutcome> = slots
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .into_iter()
        .flatten()
        .collect();

    let elapsed = started.elapsed().as_secs_f64();
    let succeeded = outcomes.iter().filter(|o| o.success).count();
    info!(
        succeeded,
        total = urls.len(),
        elapsed_secs = elapsed,
        urls_per_sec = if elapsed > 0.0 { urls.len() as f64 / elapsed } else { 0.0 },
        "scrape complete"
    );

    outcomes
}

fn scrape_one(fetcher: &Fetcher, url: &str, extract: &ExtractConfig) -> ScrapeOutcome {
    let started = Instant::now();

    let doc = match fetcher.fetch(url) {
        Ok(doc) => doc,
        Err(err) => {
            let status = err
                .downcast_ref::<FetchError>()
                .and_then(|e| e.status());
            error!(%url, error = %err, "fetch failed");
            return ScrapeOutcome::failed(url, format!("{err:#}"), status, started.elapsed());
        }
    };

    match extract_records(&doc.body, extract, Some(&doc.final_url)) {
        Ok(records) => ScrapeOutcome::succeeded(&doc, records, started.elapsed()),
        Err(err) => {
            error!(%url, error = %err, "parse failed");
            ScrapeOutcome::failed(url, format!("{err:#}"), doc.status, started.elapsed())
        }
    }
}

/// Concatenates successful records; tags each with `source_url` when they
/// come from more than one page.
fn combine_records(outcomes: &[ScrapeOutcome]) -> Vec<Record> {
    let tag = outcomes.len() > 1;
    outcomes
        .iter()
        .filter(|o| o.success)
        .flat_map(|o| {
            o.records.iter().cloned().map(move |mut record| {
                if tag && !record.contains("source_url") {
                    record.insert("source_url", Some(o.url.clone()));
                }
                record
            })
        })
        .collect()
}

fn job_targets(config: &JobConfig) -> Vec<String> {
    if config.urls.is_empty() {
        vec![format!("job://{}", config.job.name)]
    } else {
        config.urls.clone()
    }
}

/// Loads and validates a job file or every job file under a directory.
pub fn validate_jobs(path: &Path) -> Result<Vec<String>> {
    let jobs = if path.is_dir() {
        load_jobs_from_dir(path)?
    } else {
        vec![load_job_file(path)?]
    };

    Ok(jobs
        .iter()
        .map(|job| {
            format!(
                "OK: {} ({}, {} url(s))",
                job.config.job.name,
                job.path.display(),
                job.config.urls.len()
            )
        })
        .collect())
}
