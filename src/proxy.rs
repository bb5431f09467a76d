use axum::{
    body::{Body, Bytes},
    extract::{RawQuery, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use cookie::{Cookie, SameSite};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use url::{form_urlencoded, Url};

use crate::encoding;
use crate::error::{ProxyError, Result};
use crate::rewrite::html::{escape_html, ORIGINAL_ACTION};
use crate::rewrite::{proxied, rewrite, rewrite_css, rewrite_html, rewrite_js, PROXY_PATH};
use crate::session::{Session, SESSION_COOKIE};
use crate::shared::{AppState, ProxyRequest, UpstreamCookie, UpstreamResponse};
use crate::sites;

const INDEX_TEMPLATE: &str = include_str!("../assets/index.html");

/// Upstream response headers never passed to the client. `Set-Cookie` is
/// re-emitted separately and `Content-Type` is set from the classified body.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "transfer-encoding",
    "content-length",
    "connection",
    "keep-alive",
    "set-cookie",
    "content-security-policy",
    "content-security-policy-report-only",
    "x-frame-options",
    "content-type",
];

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

async fn log_requests(req: Request, next: Next) -> Response {
    info!(method = %req.method(), uri = %req.uri(), "proxy request");
    next.run(req).await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route(PROXY_PATH, get(proxy_handler).post(proxy_handler))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
        .layer(TraceLayer::new_for_http())
}

async fn index_handler() -> Html<String> {
    Html(landing_page(None))
}

async fn proxy_handler(
    State(state): State<AppState>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(&state, method, query.as_deref(), &headers, body).await
}

/// Serves one `/proxy` request: validate, fetch, rewrite, assemble.
///
/// Every failure is turned into the landing page carrying the error, so this
/// always produces a response.
pub async fn dispatch(
    state: &AppState,
    method: Method,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let params: Vec<(String, String)> = query
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let presented = session_cookie(headers);
    let session = state.sessions.get_or_create(presented.as_deref());

    let mut response = match handle(state, &session, method, &params, headers, body).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                ProxyError::Transform(_) => error!(error = %err, "rewriting failed"),
                ProxyError::Upstream(_) => warn!(error = %err, "upstream request failed"),
                _ => debug!(error = %err, "rejected request"),
            }
            err.into_response()
        }
    };

    if session.created {
        let cookie = Cookie::build((SESSION_COOKIE, session.id.as_str()))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .build();
        append_set_cookie(response.headers_mut(), &cookie);
    }
    response
}

async fn handle(
    state: &AppState,
    session: &Session,
    method: Method,
    params: &[(String, String)],
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    if let Some(location) = search_resubmission(params) {
        debug!(%location, "redirecting search form resubmission");
        let mut response = StatusCode::FOUND.into_response();
        if let Ok(value) = HeaderValue::from_str(&location) {
            response.headers_mut().insert(header::LOCATION, value);
        }
        return Ok(response);
    }

    let url = target_url(params)?;
    let body = if method == Method::POST { body } else { Bytes::new() };
    let request = ProxyRequest {
        url,
        method,
        headers: headers.clone(),
        body,
    };

    let upstream = state
        .fetcher
        .fetch(&request, &session.id, &state.sessions)
        .await?;
    if upstream.redirects > 0 {
        info!(from = %request.url, to = %upstream.final_url, hops = upstream.redirects, "followed redirects");
    }

    let host = proxy_host(headers);
    assemble(upstream, host.as_deref())
}

/// The destination named by `url`, with any extra query parameters merged in.
fn target_url(params: &[(String, String)]) -> Result<Url> {
    let raw = params
        .iter()
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or(ProxyError::MissingUrl)?;

    let mut url = Url::parse(raw).map_err(|e| ProxyError::InvalidUrl(format!("{raw} ({e})")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ProxyError::InvalidUrl(raw.to_string()));
    }

    let extras: Vec<&(String, String)> = params
        .iter()
        .filter(|(key, _)| key != "url" && key != ORIGINAL_ACTION)
        .collect();
    if !extras.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in extras {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// A search form rewritten by the HTML transform comes back with the real
/// target in `original_action` and no `url`.
fn search_resubmission(params: &[(String, String)]) -> Option<String> {
    if params.iter().any(|(key, _)| key == "url") {
        return None;
    }
    let (_, action) = params.iter().find(|(key, _)| key == ORIGINAL_ACTION)?;
    let mut target = Url::parse(action).ok()?;

    let rest: Vec<&(String, String)> = params
        .iter()
        .filter(|(key, _)| key != ORIGINAL_ACTION)
        .collect();
    if !rest.is_empty() {
        let mut pairs = target.query_pairs_mut();
        for (key, value) in rest {
            pairs.append_pair(key, value);
        }
    }
    Some(proxied(target.as_str()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentKind {
    Html,
    Css,
    Js,
    Text,
    Binary,
}

impl ContentKind {
    fn classify(content_type: &str) -> Self {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("text/html") || ct.contains("application/xhtml") {
            ContentKind::Html
        } else if ct.contains("text/css") {
            ContentKind::Css
        } else if ct.contains("javascript") || ct.contains("ecmascript") {
            ContentKind::Js
        } else if ct.contains("json") || ct.starts_with("text/") {
            ContentKind::Text
        } else {
            ContentKind::Binary
        }
    }
}

fn guess_content_type(url: &Url) -> String {
    mime_guess::from_path(url.path())
        .first_raw()
        .unwrap_or(FALLBACK_CONTENT_TYPE)
        .to_string()
}

fn with_utf8_charset(content_type: &str) -> String {
    let essence = content_type.split(';').next().unwrap_or(content_type).trim();
    format!("{essence}; charset=utf-8")
}

fn assemble(upstream: UpstreamResponse, proxy_host: Option<&str>) -> Result<Response> {
    let base = &upstream.final_url;
    let content_type = upstream
        .content_type()
        .map(str::to_string)
        .unwrap_or_else(|| guess_content_type(base));
    let kind = ContentKind::classify(&content_type);

    let (body, content_type) = if kind == ContentKind::Binary {
        (upstream.body.clone(), content_type)
    } else {
        let detection = encoding::detect(&upstream.headers, &upstream.body, base);
        debug!(url = %base, encoding = detection.name(), source = ?detection.source, "decoding body");
        let text = encoding::decode(&upstream.body, detection.encoding);

        let rewritten = match kind {
            ContentKind::Html => {
                let site = base.host_str().and_then(sites::lookup);
                rewrite_html(&text, base, site)?
            }
            ContentKind::Css => rewrite_css(&text, base),
            ContentKind::Js => rewrite_js(&text, base),
            _ => text,
        };
        (Bytes::from(rewritten), with_utf8_charset(&content_type))
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = upstream.status;

    let headers = response.headers_mut();
    for (name, value) in &upstream.headers {
        if !STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }

    let location = headers
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(|location| rewrite(location, base));
    if let Some(location) = location {
        match HeaderValue::from_str(&location) {
            Ok(value) => {
                headers.insert(header::LOCATION, value);
            }
            Err(_) => {
                headers.remove(header::LOCATION);
            }
        }
    }

    let domain = proxy_host.and_then(mirror_domain);
    for cookie in &upstream.cookies {
        append_set_cookie(headers, &mirrored(cookie, domain));
    }
    Ok(response)
}

/// The client-facing copy of an upstream cookie.
fn mirrored<'c>(cookie: &'c UpstreamCookie, domain: Option<&'c str>) -> Cookie<'c> {
    let mut builder = Cookie::build((cookie.name.as_str(), cookie.value.as_str()))
        .path(cookie.path.as_str())
        .secure(cookie.secure)
        .http_only(cookie.http_only);
    if let Some(same_site) = cookie.same_site {
        builder = builder.same_site(same_site);
    }
    if let Some(expires) = cookie.expiry_datetime() {
        builder = builder.expires(expires);
    }
    if let Some(domain) = domain {
        builder = builder.domain(domain);
    }
    builder.build()
}

fn append_set_cookie(headers: &mut HeaderMap, cookie: &Cookie<'_>) {
    match HeaderValue::from_str(&cookie.to_string()) {
        Ok(value) => {
            headers.append(header::SET_COOKIE, value);
        }
        Err(e) => warn!(name = cookie.name(), error = %e, "dropping unrepresentable cookie"),
    }
}

/// Host name the client used to reach the proxy, without the port.
fn proxy_host(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?.trim();
    let name = if host.starts_with('[') {
        host.split_inclusive(']').next().unwrap_or(host)
    } else {
        host.split(':').next().unwrap_or(host)
    };
    (!name.is_empty()).then(|| name.to_ascii_lowercase())
}

/// `Domain` for mirrored cookies. Browsers reject a domain attribute for
/// local and dot-less hosts, so those get host-only cookies.
fn mirror_domain(host: &str) -> Option<&str> {
    let local = matches!(host, "localhost" | "127.0.0.1") || host.starts_with('[');
    (!local && host.contains('.')).then_some(host)
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(|c| c.ok())
        .find(|c| c.name() == SESSION_COOKIE)
        .map(|c| c.value().to_string())
}

fn landing_page(error: Option<&str>) -> String {
    let block = error
        .map(|message| format!(r#"<p class="error">{}</p>"#, escape_html(message)))
        .unwrap_or_default();
    INDEX_TEMPLATE.replace("{{ERROR}}", &block)
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Html(landing_page(Some(&self.to_string())))).into_response()
    }
}
