use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use profetch_core::error::{AppError, FetchError};
use profetch_core::traits::Fetcher;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Phrases that mark a 200 response as a CAPTCHA or bot check.
const DEFAULT_BLOCK_MARKERS: &[&str] = &[
    "captcha",
    "verify you are human",
    "security check",
    "unusual activity",
    "are you a robot",
];

/// Path fragments of the auth wall / checkpoint pages a redirect can land on.
const BLOCK_PATHS: &[&str] = &["/authwall", "/checkpoint/challenge", "/uas/login"];

/// Non-standard status some profile sources send to suspected bots.
const STATUS_BOT_REJECTED: u16 = 999;

/// HTTP fetcher using reqwest.
///
/// Downloads raw page content with a configurable User-Agent and maps every
/// failure onto [`FetchError`] so the executor can decide whether to retry.
/// By default, SSRF protection is **enabled**: requests to private/reserved
/// IP ranges are refused. Use [`allow_private_urls`](Self::allow_private_urls)
/// to disable this (e.g., for CLI usage where the user controls the machine).
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    ssrf_protection: bool,
    block_markers: Vec<String>,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_user_agent("profetch/0.1 (profile fetcher)")
    }

    pub fn with_user_agent(user_agent: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            ssrf_protection: true,
            block_markers: DEFAULT_BLOCK_MARKERS.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    ///
    /// Only use this for CLI usage where the user controls the machine.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    /// Replace the phrases that flag a page as a bot check (case-insensitive).
    pub fn with_block_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.block_markers = markers
            .into_iter()
            .map(|m| m.into().to_lowercase())
            .collect();
        self
    }

    async fn fetch_inner(&self, target: &str, timeout: Duration) -> Result<String, FetchError> {
        if self.ssrf_protection {
            validate_url(target).await?;
        } else {
            check_scheme(&parse_url(target)?)?;
        }

        let response = self
            .client
            .get(target)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        let status = response.status();
        let final_url = response.url().clone();
        let retry_after = parse_retry_after(response.headers(), Utc::now());

        if let Some(path) = BLOCK_PATHS.iter().find(|p| final_url.path().starts_with(**p)) {
            return Err(FetchError::Blocked {
                reason: format!("redirected to {path}"),
                retry_after,
            });
        }
        if !status.is_success() {
            return Err(classify_status(status, retry_after, target));
        }

        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        if let Some(marker) = detect_block(&body, &self.block_markers) {
            tracing::warn!(url = %target, %marker, "Bot check detected in response body");
            return Err(FetchError::Blocked {
                reason: format!("page contains '{marker}'"),
                retry_after,
            });
        }

        Ok(body)
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(
        &self,
        target: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.fetch_inner(target, timeout) => result,
        }
    }
}

fn map_transport_error(error: reqwest::Error, timeout: Duration) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout(timeout)
    } else if error.is_connect() {
        FetchError::ConnectionRefused(error.to_string())
    } else if error.is_builder() {
        FetchError::InvalidTarget(error.to_string())
    } else {
        // Resets, truncated bodies and protocol errors are all transient here.
        FetchError::ConnectionRefused(error.to_string())
    }
}

/// Map a non-success status onto the fetch taxonomy.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, target: &str) -> FetchError {
    match status.as_u16() {
        404 | 410 => FetchError::NotFound(format!("HTTP {} for {target}", status.as_u16())),
        STATUS_BOT_REJECTED => FetchError::Blocked {
            reason: format!("HTTP {STATUS_BOT_REJECTED}"),
            retry_after,
        },
        code => FetchError::HttpStatus { code, retry_after },
    }
}

/// Parse a `Retry-After` header: either delay-seconds or an HTTP date.
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// First block marker found in `body`, if any.
fn detect_block<'m>(body: &str, markers: &'m [String]) -> Option<&'m str> {
    let lower = body.to_lowercase();
    markers
        .iter()
        .find(|m| lower.contains(m.as_str()))
        .map(String::as_str)
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

fn parse_url(target: &str) -> Result<Url, FetchError> {
    Url::parse(target).map_err(|e| FetchError::InvalidTarget(format!("Invalid URL: {e}")))
}

fn check_scheme(parsed: &Url) -> Result<(), FetchError> {
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(FetchError::InvalidTarget(format!(
            "URL scheme '{scheme}' is not allowed (only http/https)"
        ))),
    }
}

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(target: &str) -> Result<(), FetchError> {
    let parsed = parse_url(target)?;
    check_scheme(&parsed)?;

    let host = parsed
        .host_str()
        .ok_or_else(|| FetchError::InvalidTarget("URL has no host".to_string()))?;

    // IP literals are checked directly; brackets are stripped for IPv6.
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(FetchError::InvalidTarget(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addr = format!("{host}:{port}");
    let addrs: Vec<_> = tokio::net::lookup_host(&addr)
        .await
        .map_err(|e| FetchError::ConnectionRefused(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(FetchError::ConnectionRefused(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    for socket_addr in &addrs {
        if is_private_ip(socket_addr.ip()) {
            return Err(FetchError::InvalidTarget(format!(
                "SSRF blocked: {host} resolves to private/reserved IP {}",
                socket_addr.ip()
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16 (cloud metadata)
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}
