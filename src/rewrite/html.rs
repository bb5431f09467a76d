//! HTML document rewriting.
//!
//! One streaming `lol_html` pass visits every element in document order, so a
//! `<base href>` only affects the elements that follow it, the same way a
//! browser resolves them.

use std::cell::RefCell;
use std::rc::Rc;

use lol_html::html_content::{ContentType, Element, TextChunk};
use lol_html::{element, end, text, HtmlRewriter, Settings};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use super::css::rewrite_css;
use super::url::{absolutize, proxied, rewrite, unproxied, PROXY_PATH};
use crate::error::TransformError;
use crate::sites::{SearchPage, SiteRule};

/// Tags and the attributes on them that carry a URL.
pub static REWRITE_RULES: &[(&str, &[&str])] = &[
    ("a", &["href"]),
    ("img", &["src", "srcset", "data-src"]),
    ("link", &["href"]),
    ("script", &["src"]),
    ("iframe", &["src"]),
    ("form", &["action"]),
    ("meta", &["content"]),
    ("video", &["src", "poster"]),
    ("source", &["src", "srcset"]),
    ("object", &["data"]),
    ("embed", &["src"]),
    ("audio", &["src"]),
    ("input", &["src"]),
    ("track", &["src"]),
    ("area", &["href"]),
];

/// Hidden form field carrying a search form's real target.
pub const ORIGINAL_ACTION: &str = "original_action";

const OPEN_GRAPH_URL_PROPERTIES: &[&str] = &["og:image", "og:url", "og:video"];

const XHR_INTERCEPTOR: &str = r#"<script>(function(){var open=XMLHttpRequest.prototype.open;XMLHttpRequest.prototype.open=function(method,url){if(typeof url==="string"&&url.indexOf("http")===0){arguments[1]="/proxy?url="+encodeURIComponent(url);}return open.apply(this,arguments);};})();</script>"#;

static REFRESH_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(\burl\s*=\s*)(["']?)([^"']+)"#).expect("valid refresh regex")
});
static META_CHARSET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)charset\s*=\s*["']?[^\s;"']+["']?"#).expect("valid meta charset regex")
});

/// Rewrites every URL-bearing part of `html` to go through the proxy.
///
/// `base` is the URL the document was fetched from. `site` enables the
/// search-page behaviors of the destination, if it has any.
pub fn rewrite_html(
    html: &str,
    base: &Url,
    site: Option<&'static SiteRule>,
) -> Result<String, TransformError> {
    let pass = Rc::new(RefCell::new(Pass::new(base, site)));
    let on_element = Rc::clone(&pass);
    let on_style = Rc::clone(&pass);
    let on_end = Rc::clone(&pass);

    let mut output = Vec::with_capacity(html.len() + 512);
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("*", move |el| Ok(on_element.borrow_mut().visit(el)?)),
                text!("style", move |chunk| {
                    on_style.borrow_mut().style_text(chunk);
                    Ok(())
                }),
            ],
            document_content_handlers: vec![end!(move |end| {
                let mut pass = on_end.borrow_mut();
                if !pass.injected {
                    end.append(&pass.bootstrap, ContentType::Html);
                    pass.injected = true;
                }
                Ok(())
            })],
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );

    rewriter
        .write(html.as_bytes())
        .map_err(|e| TransformError::Html(e.to_string()))?;
    rewriter
        .end()
        .map_err(|e| TransformError::Html(e.to_string()))?;

    Ok(String::from_utf8(output)?)
}

/// Rewrites the URL of each `url descriptor` candidate, keeping descriptors and order.
pub fn rewrite_srcset(srcset: &str, base: &Url) -> String {
    srcset
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .map(|candidate| {
            let mut parts = candidate.split_whitespace();
            let url = parts.next().unwrap_or_default();
            let descriptors: Vec<&str> = parts.collect();
            let rewritten = rewrite(url, base);
            if descriptors.is_empty() {
                rewritten
            } else {
                format!("{} {}", rewritten, descriptors.join(" "))
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Escapes text for use inside HTML content or a double-quoted attribute.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_attr(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn set(el: &mut Element, name: &str, value: &str) -> Result<(), TransformError> {
    el.set_attribute(name, value)
        .map_err(|e| TransformError::Attribute {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

fn bootstrap_script(base: &Url, site: Option<&SiteRule>) -> String {
    let literal = match serde_json::to_string(base.as_str()) {
        Ok(literal) => literal.replace("</", "<\\/"),
        Err(_) => "\"\"".to_string(),
    };
    let mut script = format!("<script>window.proxyBaseUrl = {};</script>", literal);
    if site.and_then(|s| s.search.as_ref()).is_some_and(|s| s.intercept_xhr) {
        script.push_str(XHR_INTERCEPTOR);
    }
    script
}

struct Pass {
    base: Url,
    site: Option<&'static SiteRule>,
    bootstrap: String,
    injected: bool,
    style: String,
}

impl Pass {
    fn new(base: &Url, site: Option<&'static SiteRule>) -> Self {
        Self {
            base: base.clone(),
            site,
            bootstrap: bootstrap_script(base, site),
            injected: false,
            style: String::new(),
        }
    }

    fn search(&self) -> Option<&'static SearchPage> {
        self.site.and_then(|s| s.search.as_ref())
    }

    fn visit(&mut self, el: &mut Element) -> Result<(), TransformError> {
        let tag = el.tag_name();
        match tag.as_str() {
            "head" | "body" => self.inject_bootstrap(el),
            "base" => return self.rebase(el),
            "meta" => return self.meta(el),
            _ => {}
        }

        let mut handled: &[&str] = &[];
        if let Some(search) = self.search() {
            if tag == "form" && self.search_form(el, search)? {
                handled = &["action"];
            } else if tag == "a" && self.result_link(el, search)? {
                handled = &["href"];
            }
        }

        if let Some((_, attrs)) = REWRITE_RULES.iter().find(|(name, _)| *name == tag) {
            for attr in attrs.iter().filter(|a| !handled.contains(a)) {
                self.rewrite_attribute(el, attr)?;
            }
        }

        if let Some(style) = el.get_attribute("style") {
            let style = unescape_attr(&style);
            let rewritten = rewrite_css(&style, &self.base);
            if rewritten != style {
                set(el, "style", &rewritten)?;
            }
        }
        Ok(())
    }

    fn inject_bootstrap(&mut self, el: &mut Element) {
        if !self.injected {
            el.prepend(&self.bootstrap, ContentType::Html);
            self.injected = true;
        }
    }

    fn rewrite_attribute(&self, el: &mut Element, name: &str) -> Result<(), TransformError> {
        let Some(value) = el.get_attribute(name) else {
            return Ok(());
        };
        let raw = unescape_attr(&value);
        let rewritten = if name == "srcset" {
            rewrite_srcset(&raw, &self.base)
        } else {
            rewrite(&raw, &self.base)
        };
        if rewritten != raw {
            set(el, name, &rewritten)?;
        }
        Ok(())
    }

    /// `<base href>` moves the base for everything after it.
    fn rebase(&mut self, el: &mut Element) -> Result<(), TransformError> {
        let Some(href) = el.get_attribute("href") else {
            return Ok(());
        };
        let href = unescape_attr(href.trim());

        if let Some(target) = unproxied(&href) {
            if let Ok(url) = Url::parse(&target) {
                self.base = url;
            }
            return Ok(());
        }

        let Ok(resolved) = self.base.join(&href) else {
            return Ok(());
        };
        set(el, "href", &proxied(resolved.as_str()))?;
        self.base = resolved;
        Ok(())
    }

    fn meta(&mut self, el: &mut Element) -> Result<(), TransformError> {
        let http_equiv = el
            .get_attribute("http-equiv")
            .map(|v| v.trim().to_ascii_lowercase());

        match http_equiv.as_deref() {
            Some("refresh") => {
                if let Some(content) = el.get_attribute("content") {
                    let content = unescape_attr(&content);
                    let rewritten = rewrite_refresh(&content, &self.base);
                    if rewritten != content {
                        set(el, "content", &rewritten)?;
                    }
                }
            }
            Some("content-type") => {
                if let Some(content) = el.get_attribute("content") {
                    let rewritten = META_CHARSET_RE.replace(&content, "charset=utf-8");
                    if rewritten != content {
                        set(el, "content", &rewritten)?;
                    }
                }
            }
            _ => {}
        }

        // the body is always re-served as UTF-8
        if el.has_attribute("charset") {
            set(el, "charset", "utf-8")?;
        }

        let is_open_graph_url = el
            .get_attribute("property")
            .is_some_and(|p| OPEN_GRAPH_URL_PROPERTIES.contains(&p.trim()));
        if is_open_graph_url {
            self.rewrite_attribute(el, "content")?;
        }
        Ok(())
    }

    /// Points the engine's own search form at the proxy, keeping the real
    /// target in a hidden field so the resubmission can be redirected.
    fn search_form(&self, el: &mut Element, search: &SearchPage) -> Result<bool, TransformError> {
        let Some(action) = el.get_attribute("action") else {
            return Ok(false);
        };
        let action = unescape_attr(&action);
        let lower = action.to_ascii_lowercase();
        if !lower.contains("search") && !lower.contains(search.engine) {
            return Ok(false);
        }
        let Some(target) = absolutize(&action, &self.base) else {
            return Ok(false);
        };

        set(el, "method", "GET")?;
        set(el, "action", PROXY_PATH)?;
        el.append(
            &format!(
                r#"<input type="hidden" name="{}" value="{}">"#,
                ORIGINAL_ACTION,
                escape_html(&target)
            ),
            ContentType::Html,
        );
        Ok(true)
    }

    /// Unwraps redirector links (`/url?q=<destination>`) to the destination itself.
    fn result_link(&self, el: &mut Element, search: &SearchPage) -> Result<bool, TransformError> {
        let Some(href) = el.get_attribute("href") else {
            return Ok(false);
        };
        let href = unescape_attr(&href);
        if !href.starts_with(search.result_path) {
            return Ok(false);
        }
        let Ok(link) = self.base.join(&href) else {
            return Ok(false);
        };
        if link.path() != search.result_path {
            return Ok(false);
        }

        let destination = link
            .query_pairs()
            .find(|(key, _)| key == search.result_param)
            .map(|(_, value)| value.into_owned());
        let Some(destination) = destination else {
            return Ok(false);
        };
        if !destination.starts_with("http://") && !destination.starts_with("https://") {
            return Ok(false);
        }

        set(el, "href", &proxied(&destination))?;
        Ok(true)
    }

    /// `<style>` text can arrive in several chunks; it is rewritten as a whole.
    fn style_text(&mut self, chunk: &mut TextChunk) {
        self.style.push_str(chunk.as_str());
        if chunk.last_in_text_node() {
            let css = std::mem::take(&mut self.style);
            chunk.replace(&rewrite_css(&css, &self.base), ContentType::Html);
        } else {
            chunk.remove();
        }
    }
}

/// Rewrites only the `url=` part of a refresh value, keeping the delay prefix.
fn rewrite_refresh(content: &str, base: &Url) -> String {
    REFRESH_URL_RE
        .replace(content, |caps: &Captures| {
            format!("{}{}{}", &caps[1], &caps[2], rewrite(caps[3].trim(), base))
        })
        .into_owned()
}
