use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use super::url::rewrite;

static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"@import\s+(["'])([^"']+)["']"#).expect("valid CSS import regex")
});
static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"url\(\s*(?:"([^"]*)"|'([^']*)'|([^)"'\s]*))\s*\)"#).expect("valid CSS url regex")
});

/// Routes every `@import` target and `url(...)` reference in `css` through the proxy.
pub fn rewrite_css(css: &str, base: &Url) -> String {
    if css.is_empty() {
        return String::new();
    }

    let imports = IMPORT_RE.replace_all(css, |caps: &Captures| {
        let quote = &caps[1];
        let target = &caps[2];
        format!("@import {quote}{}{quote}", rewrite(target, base))
    });

    URL_RE
        .replace_all(&imports, |caps: &Captures| {
            let (quote, target) = match (caps.get(1), caps.get(2), caps.get(3)) {
                (Some(double), _, _) => ("\"", double.as_str()),
                (_, Some(single), _) => ("'", single.as_str()),
                (_, _, Some(bare)) => ("", bare.as_str()),
                _ => return caps[0].to_string(),
            };
            let target = target.trim();
            if target.is_empty() || target.to_ascii_lowercase().starts_with("data:") {
                return caps[0].to_string();
            }
            format!("url({quote}{}{quote})", rewrite(target, base))
        })
        .into_owned()
}
