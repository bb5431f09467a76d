//! Character encoding detection for fetched bodies.
//!
//! Candidates are collected from the strongest signal to the weakest and each
//! one is only accepted if the leading sample of the body actually decodes
//! under it. Detection never fails: UTF-8 is the last resort.

use chardetng::EncodingDetector;
use encoding_rs::{DecoderResult, Encoding, REPLACEMENT, UTF_8};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::sites;

/// Bytes decoded strictly to validate a candidate.
pub const SAMPLE_LEN: usize = 4000;
/// Bytes searched for `<meta>` charset declarations.
const META_SCAN_LEN: usize = 10_000;
/// Bytes fed to the statistical detector.
const GUESS_LEN: usize = 8000;

const FALLBACK_LABELS: &[&str] = &[
    "utf-8",
    "shift_jis",
    "euc-jp",
    "iso-2022-jp",
    "cp932",
    "latin1",
    "utf-16",
    "windows-1251",
    "windows-1252",
];

const LABEL_ALIASES: &[(&str, &str)] = &[
    ("shiftjis", "shift_jis"),
    ("shift-jis", "shift_jis"),
    ("sjis", "shift_jis"),
    ("cp932", "shift_jis"),
    ("ms932", "shift_jis"),
    ("windows-932", "shift_jis"),
    ("eucjp", "euc-jp"),
    ("euc_jp", "euc-jp"),
    ("utf8", "utf-8"),
    ("latin1", "iso-8859-1"),
    ("latin-1", "iso-8859-1"),
];

static CHARSET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)charset\s*=\s*["']?([^\s;"']+)"#).expect("valid charset regex")
});

/// Where the chosen encoding came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Header,
    SitePreference,
    MetaTag,
    Statistical,
    ByteOrderMark,
    Fallback,
    Default,
}

#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub encoding: &'static Encoding,
    pub source: Source,
}

impl Detection {
    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }
}

/// Picks the encoding used to turn `body` into text.
pub fn detect(headers: &HeaderMap, body: &[u8], url: &Url) -> Detection {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    let sample = &body[..body.len().min(SAMPLE_LEN)];
    let complete = body.len() <= SAMPLE_LEN;
    let accept = |label: &str| lookup(label).filter(|enc| decodes_cleanly(*enc, sample, complete));

    if let Some(label) = charset_param(&content_type) {
        if let Some(encoding) = accept(label) {
            return found(encoding, Source::Header, url);
        }
        debug!("Content-Type charset {} rejected for {}", label, url);
    }

    if let Some(rule) = url.host_str().and_then(sites::lookup) {
        for label in rule.encodings {
            if let Some(encoding) = accept(*label) {
                return found(encoding, Source::SitePreference, url);
            }
        }
    }

    if content_type.is_empty() || content_type.contains("html") {
        let head = &body[..body.len().min(META_SCAN_LEN)];
        for label in meta_charsets(head) {
            if let Some(encoding) = accept(&label) {
                return found(encoding, Source::MetaTag, url);
            }
        }
    }

    if let Some(encoding) = statistical_guess(body, url) {
        if decodes_cleanly(encoding, sample, complete) {
            return found(encoding, Source::Statistical, url);
        }
    }

    if let Some((encoding, _)) = Encoding::for_bom(body) {
        if decodes_cleanly(encoding, sample, complete) {
            return found(encoding, Source::ByteOrderMark, url);
        }
    }

    for label in FALLBACK_LABELS {
        if let Some(encoding) = accept(*label) {
            return found(encoding, Source::Fallback, url);
        }
    }

    found(UTF_8, Source::Default, url)
}

/// Decodes the whole body, substituting U+FFFD for malformed sequences.
pub fn decode(body: &[u8], encoding: &'static Encoding) -> String {
    let (text, used, had_errors) = encoding.decode(body);
    if had_errors {
        debug!("malformed sequences replaced while decoding as {}", used.name());
    }
    text.into_owned()
}

/// Resolves a charset label to an encoding after normalizing common variants.
pub fn lookup(label: &str) -> Option<&'static Encoding> {
    let normalized = label
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_ascii_lowercase();
    if normalized.is_empty() {
        return None;
    }

    let aliased = LABEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, canonical)| *canonical);

    aliased
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .or_else(|| Encoding::for_label(normalized.as_bytes()))
        .or_else(|| Encoding::for_label(normalized.replace('_', "-").as_bytes()))
        .filter(|encoding| *encoding != REPLACEMENT)
}

/// The `charset` parameter of a content type value, if any.
pub fn charset_param(content_type: &str) -> Option<&str> {
    CHARSET_RE
        .captures(content_type)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn found(encoding: &'static Encoding, source: Source, url: &Url) -> Detection {
    debug!("decoding {} as {} ({:?})", url, encoding.name(), source);
    Detection { encoding, source }
}

/// Strict decode of `sample`. When the sample is a prefix of a longer body, a
/// multibyte sequence cut at the end is not counted as an error.
fn decodes_cleanly(encoding: &'static Encoding, sample: &[u8], complete: bool) -> bool {
    let mut decoder = encoding.new_decoder_without_bom_handling();
    let Some(capacity) = decoder.max_utf8_buffer_length_without_replacement(sample.len()) else {
        return false;
    };
    let mut out = String::with_capacity(capacity);
    let (result, _) = decoder.decode_to_string_without_replacement(sample, &mut out, complete);
    matches!(result, DecoderResult::InputEmpty)
}

/// Charset labels declared by `<meta>` tags, in document order.
fn meta_charsets(head: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(head);
    let document = Html::parse_document(&text);
    let Ok(selector) = Selector::parse("meta") else {
        return Vec::new();
    };

    let mut labels = Vec::new();
    for meta in document.select(&selector) {
        let element = meta.value();
        if let Some(charset) = element.attr("charset") {
            labels.push(charset.to_string());
            continue;
        }
        let is_content_type = element
            .attr("http-equiv")
            .is_some_and(|v| v.eq_ignore_ascii_case("content-type"));
        if is_content_type {
            if let Some(label) = element.attr("content").and_then(charset_param) {
                labels.push(label.to_string());
            }
        }
    }
    labels
}

fn statistical_guess(body: &[u8], url: &Url) -> Option<&'static Encoding> {
    let sample = &body[..body.len().min(GUESS_LEN)];
    // pure ASCII carries no signal
    if sample.is_ascii() {
        return None;
    }
    let mut detector = EncodingDetector::new();
    detector.feed(sample, sample.len() == body.len());

    // chardetng wants a lowercase ASCII label without dots
    let tld = url
        .domain()
        .and_then(|d| d.rsplit('.').next())
        .filter(|t| !t.is_empty() && t.bytes().all(|b| b.is_ascii_lowercase()));
    let (encoding, confident) = detector.guess_assess(tld.map(str::as_bytes), true);
    confident.then_some(encoding)
}
