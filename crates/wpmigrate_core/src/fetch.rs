use std::io::{Read, Write};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result as AnyResult};
use log::debug;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use reqwest::{StatusCode, Url};
use tempfile::NamedTempFile;

use crate::config::MigrateConfig;
use crate::error::{MigrateError, Result};
use crate::store::{DownloadedFile, RemoteFetcher};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub rate_limit_ms: u64,
    pub max_download_bytes: u64,
}

impl HttpClientConfig {
    pub fn from_config(config: &MigrateConfig) -> Self {
        Self {
            user_agent: config.site.user_agent(),
            timeout_ms: config.http.timeout_ms,
            max_retries: config.http.retries as usize,
            retry_delay_ms: config.http.retry_delay_ms,
            rate_limit_ms: config.http.rate_limit_ms,
            max_download_bytes: config.http.max_download_bytes,
        }
    }

    pub(crate) fn build_client(&self) -> AnyResult<Client> {
        Client::builder()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build()
            .context("failed to build HTTP client")
    }
}

/// Request pacing shared by every outbound client.
#[derive(Debug)]
pub(crate) struct Throttle {
    rate_limit: Duration,
    retry_delay_ms: u64,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl Throttle {
    pub(crate) fn new(config: &HttpClientConfig) -> Self {
        Self {
            rate_limit: Duration::from_millis(config.rate_limit_ms),
            retry_delay_ms: config.retry_delay_ms,
            last_request_at: None,
            request_count: 0,
        }
    }

    pub(crate) fn apply_rate_limit(&mut self) {
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < self.rate_limit {
                sleep(self.rate_limit - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    pub(crate) fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }

    pub(crate) fn request_count(&self) -> usize {
        self.request_count
    }
}

pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

pub(crate) fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Downloads remote assets into temp files.
pub struct HttpFetcher {
    client: Client,
    config: HttpClientConfig,
    throttle: Throttle,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> AnyResult<Self> {
        let client = config.build_client()?;
        Ok(Self {
            client,
            throttle: Throttle::new(&config),
            config,
        })
    }

    pub fn request_count(&self) -> usize {
        self.throttle.request_count()
    }

    fn save_body(&self, url: &str, response: reqwest::blocking::Response) -> Result<DownloadedFile> {
        let limit = self.config.max_download_bytes;
        if let Some(declared) = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            && declared > limit
        {
            return Err(MigrateError::fetch(
                url,
                format!("declared size {declared} exceeds limit of {limit} bytes"),
            ));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());

        let mut file = NamedTempFile::new()
            .map_err(|error| MigrateError::fetch(url, format!("temp file: {error}")))?;
        let copied = std::io::copy(&mut response.take(limit.saturating_add(1)), &mut file)
            .map_err(|error| MigrateError::fetch(url, format!("read body: {error}")))?;
        if copied > limit {
            return Err(MigrateError::fetch(
                url,
                format!("body exceeds limit of {limit} bytes"),
            ));
        }
        if copied == 0 {
            return Err(MigrateError::fetch(url, "empty response body"));
        }
        file.flush()
            .map_err(|error| MigrateError::fetch(url, format!("flush temp file: {error}")))?;
        debug!("downloaded {url} ({copied} bytes)");
        Ok(DownloadedFile::new(url, content_type, copied, file))
    }
}

impl RemoteFetcher for HttpFetcher {
    fn download(&mut self, url: &str) -> Result<DownloadedFile> {
        let parsed = Url::parse(url).map_err(|error| MigrateError::fetch(url, error))?;
        for attempt in 0..=self.config.max_retries {
            self.throttle.apply_rate_limit();
            let response = self
                .client
                .get(parsed.clone())
                .header(USER_AGENT, self.config.user_agent.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.throttle.wait_before_retry(attempt, false);
                            continue;
                        }
                        return Err(MigrateError::fetch(url, format!("HTTP {status}")));
                    }
                    return self.save_body(url, response);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.throttle.wait_before_retry(attempt, false);
                        continue;
                    }
                    return Err(MigrateError::fetch(url, error));
                }
            }
        }
        Err(MigrateError::fetch(url, "request exhausted retry budget"))
    }
}
