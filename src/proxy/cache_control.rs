use std::collections::HashSet;
use std::time::Duration;

use http::{HeaderMap, Method, StatusCode};

/// Parsed `Cache-Control` header: the set of directive keys plus the
/// `max-age` value when one was present and numeric.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub keys: HashSet<String>,
    pub max_age: Duration,
}

impl CacheControl {
    pub fn parse(value: &str) -> Self {
        let mut out = CacheControl::default();
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, val) = match part.split_once('=') {
                Some((key, val)) => (key.trim(), Some(val.trim())),
                None => (part, None),
            };
            let key = key.to_ascii_lowercase();
            if key == "max-age"
                && let Some(val) = val
                && let Ok(secs) = val.parse::<u64>()
            {
                out.max_age = Duration::from_secs(secs);
            }
            // Unrecognized directives are still recorded by key.
            out.keys.insert(key);
        }
        out
    }

    pub fn has(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut joined = String::new();
    for value in headers.get_all(http::header::CACHE_CONTROL) {
        if let Ok(s) = value.to_str() {
            if !joined.is_empty() {
                joined.push(',');
            }
            joined.push_str(s);
        }
    }
    CacheControl::parse(&joined)
}

/// A response that requires validation but whose max-age is this long is
/// treated as effectively immutable: validation will not happen within the
/// cache's useful lifetime.
const LONG_LIVED_MAX_AGE: Duration = Duration::from_secs(60 * 24 * 60 * 60);

/// Volatile responses are only held in memory when they expire sooner than
/// this.
const VOLATILE_CEILING: Duration = Duration::from_secs(60 * 60);

/// Reports whether the response to this request may be served from or stored
/// into the cache at all.
pub fn request_cacheable(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::GET && !parse_cache_control(headers).has("no-store")
}

/// Reports whether a response may be persisted to the local and remote
/// tiers. Only 200s qualify; the response must either be immutable or
/// revalidate-only with a max-age long enough that revalidation is moot.
pub fn response_durably_cacheable(status: StatusCode, headers: &HeaderMap) -> bool {
    if status != StatusCode::OK {
        return false;
    }
    let cc = parse_cache_control(headers);
    if cc.has("no-store") {
        return false;
    }
    if cc.has("immutable") {
        return true;
    }
    cc.has("must-revalidate") && cc.max_age > LONG_LIVED_MAX_AGE
}

/// Reports whether a response may be held in the memory tier, and for how
/// long. `no-cache` demands revalidation before reuse, which this proxy does
/// not perform, so it is treated like `no-store`.
pub fn response_memory_cacheable(status: StatusCode, headers: &HeaderMap) -> Option<Duration> {
    if status != StatusCode::OK {
        return None;
    }
    let cc = parse_cache_control(headers);
    if cc.has("no-store") || cc.has("no-cache") {
        return None;
    }
    if cc.max_age > Duration::ZERO && cc.max_age < VOLATILE_CEILING {
        return Some(cc.max_age);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CACHE_CONTROL, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn parse_records_keys_and_max_age() {
        let cc = CacheControl::parse("public, max-age=3600, immutable");
        assert!(cc.has("public"));
        assert!(cc.has("max-age"));
        assert!(cc.has("immutable"));
        assert_eq!(cc.max_age, Duration::from_secs(3600));
    }

    #[test]
    fn parse_keeps_key_on_bad_max_age() {
        let cc = CacheControl::parse("max-age=banana");
        assert!(cc.has("max-age"));
        assert_eq!(cc.max_age, Duration::ZERO);
    }

    #[test]
    fn parse_keeps_unrecognized_directives() {
        let cc = CacheControl::parse("stale-while-revalidate=60, x-custom");
        assert!(cc.has("stale-while-revalidate"));
        assert!(cc.has("x-custom"));
    }

    #[test]
    fn parse_empty_value() {
        let cc = CacheControl::parse("");
        assert!(cc.keys.is_empty());
        assert_eq!(cc.max_age, Duration::ZERO);
    }

    #[test]
    fn request_cacheable_requires_get() {
        let headers = HeaderMap::new();
        assert!(request_cacheable(&Method::GET, &headers));
        assert!(!request_cacheable(&Method::POST, &headers));
        assert!(!request_cacheable(&Method::HEAD, &headers));
    }

    #[test]
    fn request_no_store_suppresses_caching() {
        let headers = headers_with("no-store");
        assert!(!request_cacheable(&Method::GET, &headers));
    }

    #[test]
    fn durable_requires_ok_status() {
        let headers = headers_with("immutable");
        assert!(!response_durably_cacheable(StatusCode::NOT_FOUND, &headers));
        assert!(response_durably_cacheable(StatusCode::OK, &headers));
    }

    #[test]
    fn durable_rejects_no_store_even_with_immutable() {
        let headers = headers_with("immutable, no-store");
        assert!(!response_durably_cacheable(StatusCode::OK, &headers));
    }

    #[test]
    fn durable_accepts_long_lived_must_revalidate() {
        // 90 days, beyond the 60-day threshold.
        let headers = headers_with("must-revalidate, max-age=7776000");
        assert!(response_durably_cacheable(StatusCode::OK, &headers));

        // 1 day is not long enough.
        let headers = headers_with("must-revalidate, max-age=86400");
        assert!(!response_durably_cacheable(StatusCode::OK, &headers));
    }

    #[test]
    fn memory_cacheable_within_one_hour() {
        let headers = headers_with("max-age=30");
        assert_eq!(
            response_memory_cacheable(StatusCode::OK, &headers),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn memory_rejects_no_cache_and_no_store() {
        let headers = headers_with("max-age=30, no-cache");
        assert_eq!(response_memory_cacheable(StatusCode::OK, &headers), None);
        let headers = headers_with("max-age=30, no-store");
        assert_eq!(response_memory_cacheable(StatusCode::OK, &headers), None);
    }

    #[test]
    fn memory_rejects_hour_or_longer() {
        let headers = headers_with("max-age=3600");
        assert_eq!(response_memory_cacheable(StatusCode::OK, &headers), None);
        let headers = headers_with("max-age=0");
        assert_eq!(response_memory_cacheable(StatusCode::OK, &headers), None);
    }

    #[test]
    fn memory_requires_ok_status() {
        let headers = headers_with("max-age=30");
        assert_eq!(response_memory_cacheable(StatusCode::FOUND, &headers), None);
    }
}
