use url::Url;

/// Route every rewritten reference points at.
pub const PROXY_PATH: &str = "/proxy";
const PROXY_PREFIX: &str = "/proxy?url=";

/// Schemes the proxy never intercepts.
const SKIPPED_SCHEMES: &[&str] = &["data:", "mailto:", "tel:", "javascript:", "blob:"];

/// Wraps an absolute URL in the proxy endpoint.
pub fn proxied(absolute: &str) -> String {
    format!("{}{}", PROXY_PREFIX, urlencoding::encode(absolute))
}

/// True for values that already point at the proxy endpoint.
pub fn is_proxied(value: &str) -> bool {
    value == PROXY_PATH || value.starts_with(PROXY_PREFIX)
}

/// The target carried by a proxied reference, decoded once.
pub fn unproxied(value: &str) -> Option<String> {
    let encoded = value.strip_prefix(PROXY_PREFIX)?;
    let encoded = encoded.split('&').next().unwrap_or(encoded);
    urlencoding::decode(encoded).ok().map(|s| s.into_owned())
}

/// Rewrites `raw` so that loading it goes through the proxy. Values the proxy
/// must not touch, or that cannot be resolved against `base`, come back as-is.
pub fn rewrite(raw: &str, base: &Url) -> String {
    match absolutize(raw, base) {
        Some(absolute) => proxied(&absolute),
        None => raw.to_string(),
    }
}

/// Absolute form of `raw` relative to `base`, or `None` when it must be left alone.
pub fn absolutize(raw: &str, base: &Url) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || value.starts_with('#') || is_proxied(value) {
        return None;
    }

    let lower = value.to_ascii_lowercase();
    if SKIPPED_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
        return None;
    }
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(value.to_string());
    }
    if value.starts_with("//") {
        return Some(format!("{}:{}", base.scheme(), value));
    }
    // Any other explicit scheme (ftp:, about:, intent: ...) is not ours to fetch
    if Url::parse(value).is_ok() {
        return None;
    }

    base.join(value).ok().map(String::from)
}
