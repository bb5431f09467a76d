//! Per-destination behavior overrides.
//!
//! Every special case the proxy applies to a particular site lives in
//! [`SITE_RULES`]: encoding preferences for the detector, header overrides for
//! the upstream request, and search-page handling for the HTML transform.
//! Hosts are matched by substring against the lowercased host name, first
//! match wins.

#[derive(Debug)]
pub struct SiteRule {
    /// Substring of the host this rule applies to.
    pub host: &'static str,
    /// Encodings tried ahead of `<meta>` sniffing. Still validated against the body.
    pub encodings: &'static [&'static str],
    pub origin: Option<&'static str>,
    pub referer: Option<&'static str>,
    /// Send `X-Requested-With` and a fresh `X-Request-Id` on every request.
    pub api_client: bool,
    pub search: Option<SearchPage>,
}

/// Search result page handling.
#[derive(Debug)]
pub struct SearchPage {
    /// Name that marks a form action as the engine's own search form.
    pub engine: &'static str,
    /// Path prefix of redirector links wrapping the real destination.
    pub result_path: &'static str,
    /// Query parameter holding the real destination on redirector links.
    pub result_param: &'static str,
    /// Inject a script routing absolute `XMLHttpRequest` URLs through the proxy.
    pub intercept_xhr: bool,
}

const NONE: SiteRule = SiteRule {
    host: "",
    encodings: &[],
    origin: None,
    referer: None,
    api_client: false,
    search: None,
};

pub static SITE_RULES: &[SiteRule] = &[
    SiteRule {
        host: "google",
        encodings: &["utf-8"],
        origin: Some("https://www.google.com"),
        referer: Some("https://www.google.com/"),
        search: Some(SearchPage {
            engine: "google",
            result_path: "/url",
            result_param: "q",
            intercept_xhr: true,
        }),
        ..NONE
    },
    SiteRule {
        host: "xbox.com",
        origin: Some("https://www.xbox.com"),
        referer: Some("https://www.xbox.com/"),
        api_client: true,
        ..NONE
    },
    SiteRule {
        host: "5ch.net",
        encodings: &["shift_jis"],
        ..NONE
    },
    SiteRule {
        host: "2ch.net",
        encodings: &["shift_jis"],
        ..NONE
    },
    SiteRule {
        host: "bbspink.com",
        encodings: &["shift_jis"],
        ..NONE
    },
    SiteRule {
        host: "shitaraba.net",
        encodings: &["euc-jp"],
        ..NONE
    },
];

pub fn lookup(host: &str) -> Option<&'static SiteRule> {
    let host = host.to_ascii_lowercase();
    SITE_RULES.iter().find(|rule| host.contains(rule.host))
}
