use crate::errors::RoutingError;
use crate::quota::QuotaTracker;
use log::trace;
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

/// Sends the request and decodes a successful JSON reply. Quota headers are recorded on every
/// reply, including errors.
pub(crate) async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
    quota: &QuotaTracker,
) -> Result<T, RoutingError> {
    let response = request.send().await.map_err(classify_reqwest_error)?;
    let status = response.status();
    observe_quota(response.headers(), quota);
    let retry_after = retry_after(response.headers());

    let body = response.text().await.map_err(classify_reqwest_error)?;
    trace!(target: "backend", "Response {}: {}", status, body);

    if !status.is_success() {
        return Err(classify_status(status, retry_after, &body));
    }

    serde_json::from_str(&body).map_err(|err| {
        RoutingError::Permanent(format!("Unexpected response: {err}"))
    })
}

pub(crate) fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> RoutingError {
    let message = format!("{} {}", status, truncate(body, 200));

    match status {
        StatusCode::TOO_MANY_REQUESTS => RoutingError::RateLimited { retry_after, message },
        StatusCode::REQUEST_TIMEOUT => RoutingError::Transient(message),
        status if status.is_server_error() => RoutingError::Transient(message),
        _ => RoutingError::Permanent(message),
    }
}

pub(crate) fn classify_reqwest_error(err: reqwest::Error) -> RoutingError {
    if let Some(status) = err.status() {
        return classify_status(status, None, &err.to_string());
    }
    if err.is_decode() || err.is_builder() {
        RoutingError::Permanent(err.to_string())
    } else {
        // Connect, timeout, reset, body errors
        RoutingError::Transient(err.to_string())
    }
}

/// Appends path segments to a base URL. Unlike `Url::join` this keeps the last segment of the
/// base, e.g. the `/api/1` of GraphHopper. `None` for URLs that can't have a path.
pub(crate) fn endpoint(base: &Url, path: &str) -> Option<Url> {
    let mut url = base.clone();
    url.path_segments_mut().ok()?
        .pop_if_empty()
        .extend(path.split('/'));
    Some(url)
}

/// `Retry-After` in seconds. HTTP dates are not supported.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_u64(headers, "retry-after").map(Duration::from_secs)
}

/// Reads the de facto standard `X-RateLimit-*` headers (GraphHopper sends the reset as seconds
/// from now)
pub(crate) fn observe_quota(headers: &HeaderMap, quota: &QuotaTracker) {
    if let Some(remaining) = header_u64(headers, "x-ratelimit-remaining") {
        let limit = header_u64(headers, "x-ratelimit-limit");
        let reset_in = header_u64(headers, "x-ratelimit-reset").map(Duration::from_secs);
        quota.observe(remaining, limit, reset_in);
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(max_chars).collect();
        truncated.push('…');
        truncated
    }
}
