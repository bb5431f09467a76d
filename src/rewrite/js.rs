//! Best-effort textual rewriting of script bodies.
//!
//! Nothing here parses JavaScript. Only absolute and protocol-relative URLs in
//! a few recognizable shapes are rewritten, so both misses and false hits are
//! expected.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use super::url::{absolutize, proxied};

static API_LITERAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(["'])(https?://[^"'\s]+/(?:api|service|gateway|rest)/[^"'\s]*)["']"#)
        .expect("valid API literal regex")
});
static FETCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(\bfetch\s*\(\s*)(["'])((?:https?:)?//[^"'\s]+)["']"#).expect("valid fetch regex")
});
static OPEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(\.open\s*\(\s*(?:["'][A-Za-z]+["']\s*,\s*)?)(["'])((?:https?:)?//[^"'\s]+)["']"#)
        .expect("valid open regex")
});

/// Protocol-relative `fetch`/`open` targets take the scheme of `base`.
pub fn rewrite_js(script: &str, base: &Url) -> String {
    let api = API_LITERAL_RE.replace_all(script, |caps: &Captures| {
        let quote = &caps[1];
        format!("{quote}{}{quote}", proxied(&caps[2]))
    });

    let call_site = |caps: &Captures| {
        let quote = &caps[2];
        match absolutize(&caps[3], base) {
            Some(absolute) => format!("{}{quote}{}{quote}", &caps[1], proxied(&absolute)),
            None => caps[0].to_string(),
        }
    };
    let fetches = FETCH_RE.replace_all(&api, call_site);
    OPEN_RE.replace_all(&fetches, call_site).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://www.example.com/app.js").unwrap()
    }

    #[test]
    fn api_endpoint_literals() {
        let out = rewrite_js(r#"const ENDPOINT = 'https://api.example.com/v2/api/items';"#, &base());
        assert_eq!(
            out,
            "const ENDPOINT = '/proxy?url=https%3A%2F%2Fapi.example.com%2Fv2%2Fapi%2Fitems';"
        );
    }

    #[test]
    fn fetch_and_xhr_open_arguments() {
        let script = r#"fetch("https://example.com/data.json"); xhr.open("GET", "https://example.com/feed");"#;
        let out = rewrite_js(script, &base());
        assert!(out.contains(r#"fetch("/proxy?url=https%3A%2F%2Fexample.com%2Fdata.json")"#));
        assert!(out.contains(r#"xhr.open("GET", "/proxy?url=https%3A%2F%2Fexample.com%2Ffeed")"#));
    }

    #[test]
    fn protocol_relative_calls_take_the_script_scheme() {
        let script = r#"fetch('//cdn.example.net/feed.json'); req.open("POST", "//api.example.net/log");"#;
        let out = rewrite_js(script, &base());
        assert!(out.contains("fetch('/proxy?url=https%3A%2F%2Fcdn.example.net%2Ffeed.json')"));
        assert!(out.contains(r#"req.open("POST", "/proxy?url=https%3A%2F%2Fapi.example.net%2Flog")"#));
    }

    #[test]
    fn relative_and_unrelated_strings_are_untouched() {
        let script = r#"fetch("/local/path"); const home = "https://example.com/about";"#;
        assert_eq!(rewrite_js(script, &base()), script);
    }

    #[test]
    fn api_literal_inside_fetch_is_wrapped_once() {
        let out = rewrite_js(r#"fetch("https://example.com/rest/users")"#, &base());
        assert_eq!(out.matches("/proxy?url=").count(), 1);
    }
}
