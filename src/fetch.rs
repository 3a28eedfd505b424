use crate::config::{FetchMode, FetchSettings, RateLimitConfig, resolve_path};
use crate::model::FetchedDocument;
use crate::rate_limit::DomainRateLimiter;
use crate::robots::RobotsCache;
use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::redirect::Policy;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE_EN: &str = "en-US,en;q=0.5";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("blocked by robots.txt: {url}")]
    Disallowed { url: String },

    #[error("request to {url} failed with status {status}")]
    Status { url: String, status: StatusCode },

    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid url {url}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported scheme {scheme} in {url}")]
    UnsupportedScheme { url: String, scheme: String },
}

impl FetchError {
    /// Client errors and policy refusals will not change on a second try.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => !status.is_client_error(),
            FetchError::Transport { .. } => true,
            FetchError::Disallowed { .. }
            | FetchError::InvalidUrl { .. }
            | FetchError::UnsupportedScheme { .. } => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(status.as_u16()),
            _ => None,
        }
    }
}

/// HTTP client plus the politeness state shared by every request of a run.
pub struct Fetcher {
    client: Client,
    settings: FetchSettings,
    robots: RobotsCache,
    limiter: Option<DomainRateLimiter>,
    job_path: Option<PathBuf>,
}

impl Fetcher {
    pub fn new(settings: FetchSettings, rate_limit: Option<RateLimitConfig>) -> Result<Self> {
        let limiter = match rate_limit.filter(|config| config.enabled) {
            Some(config) => {
                config.validate().context("invalid rate limit settings")?;
                Some(DomainRateLimiter::new(config))
            }
            None => None,
        };
        let client = build_client(&settings)?;
        let robots = RobotsCache::new(settings.robots_agent());
        Ok(Self {
            client,
            robots,
            limiter,
            settings,
            job_path: None,
        })
    }

    /// Relative `fetch.file_path` entries resolve against the job file.
    pub fn with_job_path(mut self, job_path: &Path) -> Self {
        self.job_path = Some(job_path.to_path_buf());
        self
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    pub fn rate_limiter(&self) -> Option<&DomainRateLimiter> {
        self.limiter.as_ref()
    }

    /// Fetches one target according to the configured mode. In file and
    /// inline mode `target` only labels the document.
    pub fn fetch(&self, target: &str) -> Result<FetchedDocument> {
        match self.settings.mode {
            FetchMode::Http => Ok(self.fetch_http(target)?),
            FetchMode::File => self.fetch_file(target),
            FetchMode::Inline => self.fetch_inline(target),
        }
    }

    pub fn fetch_http(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let parsed = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::UnsupportedScheme {
                url: url.to_string(),
                scheme: parsed.scheme().to_string(),
            });
        }

        if self.settings.respect_robots && !self.robots.allowed(&self.client, url) {
            warn!(%url, "blocked by robots.txt");
            return Err(FetchError::Disallowed {
                url: url.to_string(),
            });
        }

        let attempts = self.settings.retries.max(1);
        let mut attempt = 0;
        loop {
            if let Some(limiter) = &self.limiter {
                limiter.acquire(url, true);
            }

            info!(%url, attempt = attempt + 1, attempts, "fetching");
            let err = match self.send_once(url) {
                Ok(doc) => {
                    info!(%url, status = doc.status, bytes = doc.body.len(), "fetched");
                    return Ok(doc);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                error!(%url, error = %err, "request failed; not retrying");
                return Err(err);
            }
            if attempt + 1 >= attempts {
                error!(%url, attempts, error = %err, "request failed after all attempts");
                return Err(err);
            }

            let backoff = self.settings.backoff_for(attempt);
            warn!(
                %url,
                attempt = attempt + 1,
                error = %err,
                backoff_secs = backoff.as_secs_f64(),
                "request failed; retrying"
            );
            std::thread::sleep(backoff);
            attempt += 1;
        }
    }

    fn send_once(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let transport = |source: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            source,
        };

        let resp = self.client.get(url).send().map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        let final_url = resp.url().to_string();
        let body = resp.text().map_err(transport)?;
        Ok(FetchedDocument {
            url: url.to_string(),
            final_url,
            status: Some(status.as_u16()),
            body,
        })
    }

    fn fetch_file(&self, target: &str) -> Result<FetchedDocument> {
        let configured = self
            .settings
            .file_path
            .as_ref()
            .context("fetch.file_path missing for file mode")?;
        let resolved = match &self.job_path {
            Some(job_path) => resolve_path(job_path, configured)?,
            None => configured.clone(),
        };
        let body = std::fs::read_to_string(&resolved)
            .with_context(|| format!("failed to read file source {}", resolved.display()))?;

        info!(file = %resolved.display(), bytes = body.len(), "loaded file source");

        Ok(FetchedDocument {
            url: target.to_string(),
            final_url: format!("file://{}", resolved.display()),
            status: None,
            body,
        })
    }

    fn fetch_inline(&self, target: &str) -> Result<FetchedDocument> {
        let inline = self
            .settings
            .inline_data
            .as_ref()
            .context("fetch.inline_data missing for inline mode")?;

        debug!(bytes = inline.len(), "loaded inline source");

        Ok(FetchedDocument {
            url: target.to_string(),
            final_url: target.to_string(),
            status: None,
            body: inline.clone(),
        })
    }
}

fn build_client(settings: &FetchSettings) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE_EN));
    for (k, v) in &settings.headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .with_context(|| format!("invalid header name {k}"))?;
        let value =
            HeaderValue::from_str(v).with_context(|| format!("invalid header value for {k}"))?;
        headers.insert(name, value);
    }
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&settings.user_agent).context("invalid user agent")?,
    );

    let mut builder = Client::builder()
        .timeout(Duration::from_secs(settings.timeout_secs))
        .default_headers(headers)
        .redirect(Policy::limited(10));

    if let Some(proxy) = &settings.proxy {
        builder = builder.proxy(
            reqwest::Proxy::all(proxy).with_context(|| format!("invalid proxy {proxy}"))?,
        );
    }

    builder.build().context("failed to build reqwest client")
}
