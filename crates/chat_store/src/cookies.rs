use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};
use url::Url;

use crate::error::StoreError;
use crate::persist::{lock_unpoisoned, now_ms, read_json_document, write_json_atomic};
use crate::schema::CookieSnapshot;

type CookieBuckets = BTreeMap<String, Vec<CookieSnapshot>>;

/// Durable cookie jar holding only persistent, unexpired cookies.
///
/// Cookies are bucketed by the host of the response that set them. Each save
/// replaces its host's bucket wholesale. All reads and writes go through one
/// critical section.
#[derive(Debug)]
pub struct CookiePersistence {
    path: Option<PathBuf>,
    buckets: Mutex<CookieBuckets>,
}

impl CookiePersistence {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let now = now_ms();
        let mut buckets = read_json_document::<CookieBuckets>(path)?.unwrap_or_default();
        let purged = purge_expired(&mut buckets, now);
        if purged > 0 {
            write_json_atomic(path, &buckets)?;
        }
        debug!(path = %path.display(), hosts = buckets.len(), purged, "opened cookie store");

        Ok(Self {
            path: Some(path.to_path_buf()),
            buckets: Mutex::new(buckets),
        })
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn save_from_response(
        &self,
        url: &Url,
        cookies: Vec<CookieSnapshot>,
    ) -> Result<(), StoreError> {
        self.save_from_response_at(url, cookies, now_ms())
    }

    /// Replaces the bucket of `url`'s host with the cookies that survive at `now_ms`.
    pub fn save_from_response_at(
        &self,
        url: &Url,
        cookies: Vec<CookieSnapshot>,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let Some(host) = bucket_key(url) else {
            return Ok(());
        };

        let offered = cookies.len();
        let kept = cookies
            .into_iter()
            .filter(|cookie| cookie.survives_at(now_ms))
            .collect::<Vec<_>>();

        let mut buckets = lock_unpoisoned(&self.buckets);
        let mut next = buckets.clone();
        if kept.is_empty() {
            next.remove(&host);
        } else {
            next.insert(host.clone(), kept);
        }

        if let Some(path) = &self.path {
            write_json_atomic(path, &next)?;
        }
        debug!(
            host,
            offered,
            kept = next.get(&host).map_or(0, Vec::len),
            "saved response cookies"
        );
        *buckets = next;
        Ok(())
    }

    #[must_use]
    pub fn load_for_request(&self, url: &Url) -> Vec<CookieSnapshot> {
        self.load_for_request_at(url, now_ms())
    }

    /// Cookies applicable to `url` at `now_ms`; expired entries are purged.
    #[must_use]
    pub fn load_for_request_at(&self, url: &Url, now_ms: i64) -> Vec<CookieSnapshot> {
        let Some(host) = bucket_key(url) else {
            return Vec::new();
        };
        let request_path = url.path();
        let secure_channel = url.scheme() == "https";

        let mut buckets = lock_unpoisoned(&self.buckets);
        let purged = purge_expired(&mut buckets, now_ms);
        if purged > 0 {
            if let Some(path) = &self.path {
                if let Err(error) = write_json_atomic(path, &*buckets) {
                    warn!(%error, purged, "failed to persist cookie purge");
                }
            }
        }

        buckets
            .values()
            .flatten()
            .filter(|cookie| domain_matches(&host, &cookie.domain))
            .filter(|cookie| path_matches(request_path, &cookie.path))
            .filter(|cookie| secure_channel || !cookie.secure)
            .cloned()
            .collect()
    }
}

fn bucket_key(url: &Url) -> Option<String> {
    url.host_str()
        .map(|host| host.trim_end_matches('.').to_ascii_lowercase())
        .filter(|host| !host.is_empty())
}

fn purge_expired(buckets: &mut CookieBuckets, now_ms: i64) -> usize {
    let mut purged = 0;
    for cookies in buckets.values_mut() {
        let before = cookies.len();
        cookies.retain(|cookie| cookie.survives_at(now_ms));
        purged += before - cookies.len();
    }
    buckets.retain(|_, cookies| !cookies.is_empty());
    purged
}

fn domain_matches(host: &str, cookie_domain: &str) -> bool {
    let domain = cookie_domain.trim_start_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    host == domain
        || host
            .strip_suffix(domain.as_str())
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if cookie_path.is_empty() || cookie_path == "/" {
        return true;
    }
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}
