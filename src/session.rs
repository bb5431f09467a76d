//! Per-client sessions holding the cookies upstream sites have set.
//!
//! All state sits behind one mutex. Every get-or-create, jar update and sweep
//! takes the lock for its whole read-modify-write, so concurrent requests on
//! the same session never lose each other's cookies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::shared::UpstreamCookie;

/// Name of the cookie carrying the session id between client and proxy.
pub const SESSION_COOKIE: &str = "proxy_session";

const SESSION_ID_BYTES: usize = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredCookie {
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Option<SystemTime>,
    pub secure: bool,
}

impl StoredCookie {
    /// Whether this cookie goes out on a request to `host`.
    fn sent_to(&self, host: &str, https: bool, now: SystemTime) -> bool {
        let domain_matches = host == self.domain
            || host
                .strip_suffix(self.domain.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'));
        let live = self.expires.map_or(true, |at| at > now);
        domain_matches && live && (https || !self.secure)
    }
}

impl From<&UpstreamCookie> for StoredCookie {
    fn from(cookie: &UpstreamCookie) -> Self {
        Self {
            value: cookie.value.clone(),
            domain: cookie.domain.clone(),
            path: cookie.path.clone(),
            expires: cookie.expires,
            secure: cookie.secure,
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    last_touched: Instant,
    /// Keyed by cookie name alone; the last write wins.
    jar: HashMap<String, StoredCookie>,
}

impl SessionEntry {
    fn new(now: Instant) -> Self {
        Self {
            last_touched: now,
            jar: HashMap::new(),
        }
    }
}

/// The session a request belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    /// True when the client presented no usable id and one was issued.
    pub created: bool,
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the live session for `id`, or issues a new one when `id` is
    /// absent or unknown. Either way the session is marked as touched.
    pub fn get_or_create(&self, id: Option<&str>) -> Session {
        let now = Instant::now();
        let mut sessions = self.lock();

        if let Some(id) = id {
            if let Some(entry) = sessions.get_mut(id) {
                entry.last_touched = now;
                return Session {
                    id: id.to_string(),
                    created: false,
                };
            }
        }

        let id = loop {
            let candidate = new_session_id();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(id.clone(), SessionEntry::new(now));
        debug!(sessions = sessions.len(), "created session");
        Session { id, created: true }
    }

    /// Merges `cookies` into the session's jar in order. Cookies that arrive
    /// already expired delete any stored cookie of the same name.
    pub fn record_cookies(&self, id: &str, cookies: &[UpstreamCookie]) {
        if cookies.is_empty() {
            return;
        }
        let now = SystemTime::now();
        let mut sessions = self.lock();
        let entry = sessions
            .entry(id.to_string())
            .or_insert_with(|| SessionEntry::new(Instant::now()));
        entry.last_touched = Instant::now();

        for cookie in cookies {
            if cookie.is_expired(now) {
                entry.jar.remove(&cookie.name);
            } else {
                entry.jar.insert(cookie.name.clone(), StoredCookie::from(cookie));
            }
        }
    }

    /// The `Cookie` header value for a request to `url`, if any cookie applies.
    pub fn cookie_header(&self, id: &str, url: &Url) -> Option<String> {
        let host = url.host_str()?.to_ascii_lowercase();
        let https = url.scheme() == "https";
        let now = SystemTime::now();

        let sessions = self.lock();
        let entry = sessions.get(id)?;
        let mut pairs: Vec<String> = entry
            .jar
            .iter()
            .filter(|(_, cookie)| cookie.sent_to(&host, https, now))
            .map(|(name, cookie)| format!("{}={}", name, cookie.value))
            .collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort();
        Some(pairs.join("; "))
    }

    /// Evicts sessions idle for longer than the TTL as of `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| now.saturating_duration_since(entry.last_touched) <= self.ttl);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of a session's jar.
    pub fn jar(&self, id: &str) -> Option<HashMap<String, StoredCookie>> {
        self.lock().get(id).map(|entry| entry.jar.clone())
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Runs [`SessionStore::sweep`] every `every` until the runtime shuts down.
pub fn spawn_sweeper(store: Arc<SessionStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = store.sweep(Instant::now());
            if evicted > 0 {
                info!(evicted, remaining = store.len(), "swept idle sessions");
            }
        }
    })
}
