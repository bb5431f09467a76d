//! Fetching from destination servers.
//!
//! [`Upstream`] is the transport seam: one request in, one response out, no
//! redirects followed. [`Fetcher`] drives it through the redirect loop, keeps
//! the session jar current on every hop and owns the one-shot TLS fallback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use bytes::Bytes;
use tracing::{debug, warn};
use url::Url;

use crate::error::FetchError;
use crate::rewrite::url::unproxied;
use crate::session::SessionStore;
use crate::shared::{parse_set_cookies, ProxyRequest, UpstreamResponse};
use crate::sites;

/// Inbound headers never forwarded upstream. Hop-by-hop headers belong to
/// the client connection; `Cookie` is rebuilt from the session jar and the
/// transport negotiates its own `Accept-Encoding`.
const DROPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "cookie",
    "accept-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const BROWSER_IDENTITY: &[(&str, &str)] = &[
    (
        "user-agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36",
    ),
    (
        "accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
    ),
    ("accept-language", "ja,en-US;q=0.9,en;q=0.8"),
    ("cache-control", "no-cache"),
    ("pragma", "no-cache"),
    (
        "sec-ch-ua",
        r#""Not.A/Brand";v="8", "Chromium";v="114", "Google Chrome";v="114""#,
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", r#""Windows""#),
    ("upgrade-insecure-requests", "1"),
    ("sec-fetch-site", "none"),
    ("sec-fetch-mode", "navigate"),
    ("sec-fetch-user", "?1"),
    ("sec-fetch-dest", "document"),
    ("dnt", "1"),
];

const X_REQUESTED_WITH: &str = "x-requested-with";
const X_REQUEST_ID: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// False only for the retry after a certificate failure.
    pub verify_tls: bool,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A single request/response exchange with a destination server.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, request: UpstreamRequest) -> Result<RawResponse, FetchError>;
}

/// [`Upstream`] over `reqwest`, with automatic redirects disabled.
pub struct HttpClient {
    strict: reqwest::Client,
    insecure: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration, connect_timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            strict: build_client(timeout, connect_timeout, false)?,
            insecure: build_client(timeout, connect_timeout, true)?,
        })
    }
}

fn build_client(
    timeout: Duration,
    connect_timeout: Duration,
    accept_invalid_certs: bool,
) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .map_err(|e| FetchError::Client(e.to_string()))
}

#[async_trait]
impl Upstream for HttpClient {
    async fn fetch(&self, request: UpstreamRequest) -> Result<RawResponse, FetchError> {
        let client = if request.verify_tls {
            &self.strict
        } else {
            &self.insecure
        };
        let target = request.url.to_string();

        let response = client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| classify(&target, &e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| classify(&target, &e))?;
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(url: &str, err: &reqwest::Error) -> FetchError {
    let url = url.to_string();
    if err.is_timeout() {
        return FetchError::Timeout { url };
    }

    let reason = error_chain(err);
    if is_certificate_error(&reason) {
        FetchError::Tls { url, reason }
    } else if err.is_connect() {
        FetchError::Connect { url, reason }
    } else {
        FetchError::Other { url, reason }
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

fn is_certificate_error(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    ["certificate", "self signed", "self-signed", "unknown issuer", "unknownissuer"]
        .iter()
        .any(|needle| text.contains(needle))
}

/// Headers for one upstream request to `url`.
pub fn build_headers(inbound: &HeaderMap, url: &Url, cookie: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if !DROPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    for &(name, value) in BROWSER_IDENTITY {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }

    // a referer pointing at the proxy is translated back to the page it wraps
    let translated = headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .and_then(proxied_referer);
    if let Some(referer) = translated {
        match HeaderValue::from_str(&referer) {
            Ok(value) => {
                headers.insert(header::REFERER, value);
            }
            Err(_) => {
                headers.remove(header::REFERER);
            }
        }
    }

    if let Some(rule) = url.host_str().and_then(sites::lookup) {
        if let Some(origin) = rule.origin {
            headers.insert(header::ORIGIN, HeaderValue::from_static(origin));
        }
        if let Some(referer) = rule.referer {
            headers.insert(header::REFERER, HeaderValue::from_static(referer));
        }
        if rule.api_client {
            headers.insert(
                HeaderName::from_static(X_REQUESTED_WITH),
                HeaderValue::from_static("XMLHttpRequest"),
            );
            if let Ok(id) = HeaderValue::from_str(&request_id()) {
                headers.insert(HeaderName::from_static(X_REQUEST_ID), id);
            }
        }
    }

    if let Some(cookie) = cookie {
        match HeaderValue::from_str(cookie) {
            Ok(value) => {
                headers.insert(header::COOKIE, value);
            }
            Err(e) => warn!(error = %e, "dropping unsendable cookie header"),
        }
    }
    headers
}

fn proxied_referer(referer: &str) -> Option<String> {
    let url = Url::parse(referer).ok()?;
    let path_and_query = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    unproxied(&path_and_query)
}

fn request_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// The absolute http(s) target of a redirect response, if it has a usable one.
pub fn redirect_target(headers: &HeaderMap, current: &Url) -> Option<Url> {
    let location = headers.get(header::LOCATION)?.to_str().ok()?.trim();
    if location.is_empty() {
        return None;
    }
    let next = current.join(location).ok()?;
    matches!(next.scheme(), "http" | "https").then_some(next)
}

/// Runs a [`ProxyRequest`] against an [`Upstream`], following redirects by hand.
pub struct Fetcher {
    upstream: Arc<dyn Upstream>,
    max_redirects: usize,
}

impl Fetcher {
    pub fn new(upstream: Arc<dyn Upstream>, max_redirects: usize) -> Self {
        Self {
            upstream,
            max_redirects,
        }
    }

    pub async fn fetch(
        &self,
        request: &ProxyRequest,
        session: &str,
        sessions: &SessionStore,
    ) -> Result<UpstreamResponse, FetchError> {
        let mut url = request.url.clone();
        let mut method = request.method.clone();
        let mut body = request.body.clone();
        let mut inbound = request.headers.clone();
        let mut redirects = 0;
        let mut cookies = Vec::new();

        loop {
            let jar = sessions.cookie_header(session, &url);
            let headers = build_headers(&inbound, &url, jar.as_deref());
            let response = self
                .send(UpstreamRequest {
                    method: method.clone(),
                    url: url.clone(),
                    headers,
                    body: body.clone(),
                    verify_tls: true,
                })
                .await?;

            let received = parse_set_cookies(&response.headers, &url);
            sessions.record_cookies(session, &received);
            cookies.extend(received);

            let next = if is_followed_redirect(response.status) && redirects < self.max_redirects {
                redirect_target(&response.headers, &url)
            } else {
                None
            };
            let Some(next) = next else {
                return Ok(UpstreamResponse {
                    status: response.status,
                    headers: response.headers,
                    body: response.body,
                    final_url: url,
                    redirects,
                    cookies,
                });
            };

            redirects += 1;
            debug!(
                hop = redirects,
                status = response.status.as_u16(),
                from = %url,
                to = %next,
                "following redirect"
            );
            if !matches!(
                response.status,
                StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
            ) {
                method = Method::GET;
                body = Bytes::new();
                inbound.remove(header::CONTENT_TYPE);
            }
            url = next;
        }
    }

    async fn send(&self, request: UpstreamRequest) -> Result<RawResponse, FetchError> {
        match self.upstream.fetch(request.clone()).await {
            Err(FetchError::Tls { url, reason }) => {
                warn!(%url, %reason, "certificate verification failed, retrying without verification");
                self.upstream
                    .fetch(UpstreamRequest {
                        verify_tls: false,
                        ..request
                    })
                    .await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Script = Box<dyn Fn(&UpstreamRequest, usize) -> Result<RawResponse, FetchError> + Send + Sync>;

    /// Answers from a script and keeps every request it saw.
    struct FakeUpstream {
        script: Script,
        seen: Mutex<Vec<UpstreamRequest>>,
    }

    impl FakeUpstream {
        fn new(
            script: impl Fn(&UpstreamRequest, usize) -> Result<RawResponse, FetchError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<UpstreamRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn fetch(&self, request: UpstreamRequest) -> Result<RawResponse, FetchError> {
            let call = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(request.clone());
                seen.len() - 1
            };
            (self.script)(&request, call)
        }
    }

    fn respond(status: StatusCode, headers: &[(&'static str, &str)], body: &'static str) -> RawResponse {
        let mut map = HeaderMap::new();
        for &(name, value) in headers {
            map.append(HeaderName::from_static(name), HeaderValue::from_str(value).unwrap());
        }
        RawResponse {
            status,
            headers: map,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn request(method: Method, url: &str, body: &'static str) -> ProxyRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded"));
        ProxyRequest {
            url: Url::parse(url).unwrap(),
            method,
            headers,
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn store() -> (SessionStore, String) {
        let store = SessionStore::new(Duration::from_secs(60));
        let id = store.get_or_create(None).id;
        (store, id)
    }

    #[test]
    fn headers_drop_client_specifics_and_add_identity() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("localhost:8000"));
        inbound.insert(header::COOKIE, HeaderValue::from_static("proxy_session=abc"));
        inbound.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("zstd"));
        inbound.insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        inbound.insert(header::USER_AGENT, HeaderValue::from_static("curl/8.0"));
        inbound.insert("x-custom", HeaderValue::from_static("kept"));

        let url = Url::parse("https://example.com/").unwrap();
        let headers = build_headers(&inbound, &url, Some("sid=1"));

        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::ACCEPT_ENCODING).is_none());
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(headers["cookie"], "sid=1");
        assert_eq!(headers["x-custom"], "kept");
        assert!(headers["user-agent"].to_str().unwrap().contains("Chrome/114"));
        assert_eq!(headers["accept-language"], "ja,en-US;q=0.9,en;q=0.8");
        assert_eq!(headers["sec-fetch-mode"], "navigate");
        assert!(headers.get(header::ORIGIN).is_none());
    }

    #[test]
    fn site_overrides_apply() {
        let google = build_headers(&HeaderMap::new(), &Url::parse("https://www.google.com/search").unwrap(), None);
        assert_eq!(google["origin"], "https://www.google.com");
        assert_eq!(google["referer"], "https://www.google.com/");
        assert!(google.get(X_REQUESTED_WITH).is_none());

        let xbox = build_headers(&HeaderMap::new(), &Url::parse("https://www.xbox.com/ja-JP").unwrap(), None);
        assert_eq!(xbox[X_REQUESTED_WITH], "XMLHttpRequest");
        let id = xbox[X_REQUEST_ID].to_str().unwrap();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn proxied_referer_is_translated() {
        let mut inbound = HeaderMap::new();
        inbound.insert(
            header::REFERER,
            HeaderValue::from_static("http://localhost:8000/proxy?url=https%3A%2F%2Fnews.example.org%2Fa"),
        );
        let headers = build_headers(&inbound, &Url::parse("https://news.example.org/b").unwrap(), None);
        assert_eq!(headers["referer"], "https://news.example.org/a");
    }

    #[tokio::test]
    async fn redirect_loop_stops_at_the_cap() {
        let upstream = FakeUpstream::new(|_, call| {
            Ok(respond(StatusCode::FOUND, &[("location", format!("/loop/{}", call + 1).as_str())], ""))
        });
        let fetcher = Fetcher::new(upstream.clone(), 10);
        let (sessions, id) = store();

        let response = fetcher
            .fetch(&request(Method::GET, "http://example.com/loop/0", ""), &id, &sessions)
            .await
            .unwrap();

        assert_eq!(response.redirects, 10);
        assert_eq!(response.status, StatusCode::FOUND);
        assert_eq!(upstream.seen().len(), 11);
        assert_eq!(response.final_url.as_str(), "http://example.com/loop/10");
    }

    #[tokio::test]
    async fn see_other_becomes_get_but_307_keeps_the_body() {
        let upstream = FakeUpstream::new(|req, _| match req.url.path() {
            "/submit" => Ok(respond(StatusCode::SEE_OTHER, &[("location", "/done")], "")),
            "/moved" => Ok(respond(StatusCode::TEMPORARY_REDIRECT, &[("location", "/submit2")], "")),
            _ => Ok(respond(StatusCode::OK, &[], "ok")),
        });
        let fetcher = Fetcher::new(upstream.clone(), 10);
        let (sessions, id) = store();

        fetcher
            .fetch(&request(Method::POST, "http://example.com/submit", "a=1"), &id, &sessions)
            .await
            .unwrap();
        let seen = upstream.seen();
        assert_eq!(seen[1].method, Method::GET);
        assert!(seen[1].body.is_empty());
        assert!(seen[1].headers.get(header::CONTENT_TYPE).is_none());

        fetcher
            .fetch(&request(Method::POST, "http://example.com/moved", "b=2"), &id, &sessions)
            .await
            .unwrap();
        let seen = upstream.seen();
        assert_eq!(seen[3].url.path(), "/submit2");
        assert_eq!(seen[3].method, Method::POST);
        assert_eq!(seen[3].body, Bytes::from_static(b"b=2"));
    }

    #[tokio::test]
    async fn cookies_from_every_hop_are_kept_and_sent_on() {
        let upstream = FakeUpstream::new(|req, _| match req.url.path() {
            "/login" => Ok(respond(
                StatusCode::FOUND,
                &[("location", "https://example.com/home"), ("set-cookie", "sid=s1; Path=/")],
                "",
            )),
            _ => Ok(respond(StatusCode::OK, &[("set-cookie", "theme=dark")], "home")),
        });
        let fetcher = Fetcher::new(upstream.clone(), 10);
        let (sessions, id) = store();

        let response = fetcher
            .fetch(&request(Method::GET, "https://example.com/login", ""), &id, &sessions)
            .await
            .unwrap();

        let names: Vec<_> = response.cookies.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["sid", "theme"]);
        assert_eq!(upstream.seen()[1].headers["cookie"], "sid=s1");
        assert_eq!(sessions.jar(&id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_location_ends_the_loop() {
        let upstream = FakeUpstream::new(|_, _| Ok(respond(StatusCode::MOVED_PERMANENTLY, &[], "")));
        let fetcher = Fetcher::new(upstream.clone(), 10);
        let (sessions, id) = store();

        let response = fetcher
            .fetch(&request(Method::GET, "http://example.com/", ""), &id, &sessions)
            .await
            .unwrap();
        assert_eq!(response.redirects, 0);
        assert_eq!(upstream.seen().len(), 1);
    }

    #[tokio::test]
    async fn certificate_failure_is_retried_once_without_verification() {
        let upstream = FakeUpstream::new(|req, _| {
            if req.verify_tls {
                Err(FetchError::Tls {
                    url: req.url.to_string(),
                    reason: "certificate verify failed".into(),
                })
            } else {
                Ok(respond(StatusCode::OK, &[], "insecure but here"))
            }
        });
        let fetcher = Fetcher::new(upstream.clone(), 10);
        let (sessions, id) = store();

        let response = fetcher
            .fetch(&request(Method::GET, "https://self-signed.example/", ""), &id, &sessions)
            .await
            .unwrap();
        assert_eq!(response.body, Bytes::from_static(b"insecure but here"));
        let seen = upstream.seen();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].verify_tls && !seen[1].verify_tls);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let upstream = FakeUpstream::new(|req, _| {
            Err(FetchError::Connect {
                url: req.url.to_string(),
                reason: "connection refused".into(),
            })
        });
        let fetcher = Fetcher::new(upstream.clone(), 10);
        let (sessions, id) = store();

        let err = fetcher
            .fetch(&request(Method::GET, "http://down.example/", ""), &id, &sessions)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Connect { .. }));
        assert_eq!(upstream.seen().len(), 1);
    }

    #[test]
    fn certificate_errors_are_recognized_by_message() {
        assert!(is_certificate_error("error sending request: invalid peer certificate: UnknownIssuer"));
        assert!(is_certificate_error("SSL routines: certificate verify failed: self signed certificate"));
        assert!(!is_certificate_error("tcp connect error: Connection refused"));
    }
}
