//! Shared HTTP plumbing: client setup, SSRF guard, error classification.

use std::net::IpAddr;
use std::time::Duration;

use outreach_shared::{OutreachError, Result, StageError};
use reqwest::{Client, Response, StatusCode, header};
use tracing::debug;
use url::Url;

/// User-Agent string for outbound requests.
pub(crate) const USER_AGENT: &str = concat!("Outreach/", env!("CARGO_PKG_VERSION"));

/// Maximum characters of a response body kept for diagnostics.
const EXCERPT_CHARS: usize = 200;

const MAX_REDIRECTS: usize = 5;

/// Bytes of a scraped page read before the rest is dropped.
pub(crate) const MAX_PAGE_BYTES: usize = 2 * 1024 * 1024;

/// Bytes of a form submission response kept.
pub(crate) const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Build the HTTP client used by a worker. `timeout` bounds each request.
///
/// Every redirect hop goes through the same SSRF check as the first URL
/// unless `allow_localhost` is set.
pub(crate) fn build_client(timeout: Duration, allow_localhost: bool) -> Result<Client> {
    let redirects = reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if !allow_localhost && is_ssrf_target(attempt.url()) {
            let reason = format!("redirect to non-public target {}", attempt.url());
            attempt.error(reason)
        } else {
            attempt.follow()
        }
    });
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(redirects)
        .timeout(timeout)
        .build()
        .map_err(|e| OutreachError::Network(format!("failed to build HTTP client: {e}")))
}

/// Read at most `limit` bytes of the body; anything beyond is dropped.
pub(crate) async fn read_body(
    url: &Url,
    mut response: Response,
    limit: usize,
) -> std::result::Result<String, StageError> {
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| StageError::transient(format!("{url}: body read failed: {e}")))?
    {
        let room = limit - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            debug!(%url, limit, "response body truncated");
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Parse a target URL, rejecting anything that is not a public http(s) host.
pub(crate) fn checked_url(raw: &str, allow_localhost: bool) -> std::result::Result<Url, StageError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| StageError::permanent(format!("malformed URL {raw}: {e}")))?;
    if !allow_localhost && is_ssrf_target(&url) {
        return Err(StageError::permanent(format!("blocked non-public target {url}")));
    }
    Ok(url)
}

/// Map a request that never produced a response.
pub(crate) fn send_error(url: &Url, err: reqwest::Error) -> StageError {
    if err.is_builder() {
        StageError::permanent(format!("{url}: invalid request: {err}"))
    } else if err.is_redirect() {
        StageError::permanent(format!("{url}: redirect refused: {err}"))
    } else if err.is_timeout() {
        StageError::transient(format!("{url}: request timed out"))
    } else {
        StageError::transient(format!("{url}: {err}"))
    }
}

/// Map a non-success status: 429 and quota answers are resource exhaustion,
/// 5xx and 408 are transient, every other 4xx is permanent.
pub(crate) fn status_error(url: &Url, response: &Response) -> StageError {
    let status = response.status();
    let message = format!("{url}: HTTP {status}");
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::PAYMENT_REQUIRED => {
            StageError::rate_limited(message, retry_after(response))
        }
        StatusCode::REQUEST_TIMEOUT => StageError::transient(message),
        s if s.is_server_error() => StageError::transient(message),
        _ => StageError::permanent(message),
    }
}

/// `Retry-After` in its delta-seconds form.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// First characters of a body with whitespace collapsed.
pub(crate) fn excerpt(body: &str) -> Option<String> {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(EXCERPT_CHARS).collect())
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub(crate) fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
