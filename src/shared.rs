use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::http::{header, HeaderMap, Method, StatusCode};
use bytes::Bytes;
use cookie::time::OffsetDateTime;
use cookie::{Cookie, SameSite};
use url::Url;

use crate::config::Config;
use crate::error::FetchError;
use crate::session::SessionStore;
use crate::upstream::{Fetcher, HttpClient, Upstream};

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub fetcher: Arc<Fetcher>,
}

impl AppState {
    /// Production state: a real HTTP client configured from `config`.
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let client = HttpClient::new(config.upstream_timeout(), config.connect_timeout())?;
        Ok(Self::with_upstream(
            Arc::new(client),
            config.max_redirects,
            config.session_ttl(),
        ))
    }

    pub fn with_upstream(upstream: Arc<dyn Upstream>, max_redirects: usize, session_ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(SessionStore::new(session_ttl)),
            fetcher: Arc::new(Fetcher::new(upstream, max_redirects)),
        }
    }
}

/// A validated request for one upstream resource.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The final response of a fetch, after redirects were followed.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub final_url: Url,
    pub redirects: usize,
    /// Cookies received on every hop, in arrival order.
    pub cookies: Vec<UpstreamCookie>,
}

impl UpstreamResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
    }
}

/// 9999-12-31T23:59:59Z, the last instant a cookie date can carry.
const LATEST_EXPIRY_SECS: u64 = 253_402_300_799;

fn latest_expiry() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(LATEST_EXPIRY_SECS)
}

/// A `Set-Cookie` received from upstream, with its attributes resolved
/// against the URL that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Option<SystemTime>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

impl UpstreamCookie {
    pub fn parse(raw: &str, origin: &Url) -> Option<Self> {
        let parsed = Cookie::parse(raw).ok()?;
        if parsed.name().is_empty() {
            return None;
        }

        let domain = parsed
            .domain()
            .map(|d| d.trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .or_else(|| origin.host_str().map(str::to_ascii_lowercase))?;

        // Max-Age takes precedence over Expires
        let expires = match parsed.max_age() {
            Some(max_age) if max_age.whole_seconds() <= 0 => Some(SystemTime::UNIX_EPOCH),
            Some(max_age) => {
                let lifetime = Duration::from_secs(max_age.whole_seconds().unsigned_abs());
                let latest = latest_expiry();
                Some(
                    SystemTime::now()
                        .checked_add(lifetime)
                        .map_or(latest, |at| at.min(latest)),
                )
            }
            None => parsed.expires_datetime().map(SystemTime::from),
        };

        Some(Self {
            name: parsed.name().to_string(),
            value: parsed.value().to_string(),
            domain,
            path: parsed.path().unwrap_or("/").to_string(),
            expires,
            secure: parsed.secure().unwrap_or(false),
            http_only: parsed.http_only().unwrap_or(false),
            same_site: parsed.same_site(),
        })
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    /// The expiry as a cookie date. Times before the epoch map to the epoch.
    pub fn expiry_datetime(&self) -> Option<OffsetDateTime> {
        let at = self.expires?.min(latest_expiry());
        let secs = match at.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(since) => i64::try_from(since.as_secs()).ok()?,
            Err(_) => 0,
        };
        OffsetDateTime::from_unix_timestamp(secs).ok()
    }
}

/// Every parseable `Set-Cookie` header in `headers`, in order.
pub fn parse_set_cookies(headers: &HeaderMap, origin: &Url) -> Vec<UpstreamCookie> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|raw| UpstreamCookie::parse(raw, origin))
        .collect()
}
