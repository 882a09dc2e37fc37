use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chat_store::{now_ms, CookiePersistence, CookieSnapshot};
use reqwest::Response;
use tracing::{debug, warn};
use url::Url;

/// Snapshots of every `Set-Cookie` on `response`, resolved against the
/// request URL for default domain and path. Cookies whose `Domain` does not
/// cover the request host are dropped.
pub fn snapshots_from_response(
    request_url: &Url,
    response: &Response,
    now_ms: i64,
) -> Vec<CookieSnapshot> {
    let host = request_url.host_str().unwrap_or_default().to_ascii_lowercase();
    response
        .cookies()
        .filter_map(|cookie| {
            let Some(domain) = resolve_domain(cookie.domain(), &host) else {
                debug!(name = cookie.name(), domain = ?cookie.domain(), host, "rejecting cookie for foreign domain");
                return None;
            };
            let expires_at_ms = expiry_ms(cookie.max_age(), cookie.expires(), now_ms);
            Some(CookieSnapshot {
                name: cookie.name().to_owned(),
                value: cookie.value().to_owned(),
                domain,
                path: cookie
                    .path()
                    .filter(|path| path.starts_with('/'))
                    .map_or_else(|| default_path(request_url.path()), ToOwned::to_owned),
                expires_at_ms,
                persistent: expires_at_ms.is_some(),
                secure: cookie.secure(),
                http_only: cookie.http_only(),
            })
        })
        .collect()
}

/// The domain a cookie is stored under: its `Domain` attribute when that
/// domain-matches `host`, the host itself when the attribute is absent.
fn resolve_domain(attribute: Option<&str>, host: &str) -> Option<String> {
    let domain = attribute
        .map(|domain| domain.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|domain| !domain.is_empty());
    let Some(domain) = domain else {
        return Some(host.to_owned());
    };

    let covers_host = host == domain
        || host
            .strip_suffix(domain.as_str())
            .is_some_and(|prefix| prefix.ends_with('.'));
    covers_host.then_some(domain)
}

/// Hands the response's cookies to the store. Responses without cookies
/// leave the stored set untouched.
pub(crate) fn persist_response_cookies(
    store: &CookiePersistence,
    request_url: &Url,
    response: &Response,
) {
    let snapshots = snapshots_from_response(request_url, response, now_ms());
    if snapshots.is_empty() {
        return;
    }
    let count = snapshots.len();
    match store.save_from_response(request_url, snapshots) {
        Ok(()) => debug!(count, "stored response cookies"),
        Err(error) => warn!(%error, "failed to store response cookies"),
    }
}

/// `name=value` pairs joined for the request `cookie` header.
#[must_use]
pub fn cookie_header(cookies: &[CookieSnapshot]) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    Some(
        cookies
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// `Max-Age` wins over `Expires`.
fn expiry_ms(max_age: Option<Duration>, expires: Option<SystemTime>, now_ms: i64) -> Option<i64> {
    if let Some(max_age) = max_age {
        let millis = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        return Some(now_ms.saturating_add(millis));
    }
    expires.map(|expires| {
        expires
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| i64::try_from(since.as_millis()).unwrap_or(i64::MAX))
    })
}

fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(index) => request_path[..index].to_owned(),
    }
}
