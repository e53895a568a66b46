//! Subject-line sanitization and password extraction
//!
//! Usenet subjects typically carry the filename in double quotes, e.g.
//! `Some.Release [01/50] - "Some.Release.part01.rar" yEnc (1/100)`.
//! When no quoted section exists we fall back to stripping the leading
//! `[n/m]` counter and the trailing `yEnc ...` marker.

use regex::Regex;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static RE_YENC_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+yenc.*$").expect("static regex"));

#[allow(clippy::expect_used)]
static RE_LEADING_COUNTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\d+/\d+\]\s+").expect("static regex"));

#[allow(clippy::expect_used)]
static RE_BAD_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/:*?"<>|]"#).expect("static regex"));

#[allow(clippy::expect_used)]
static RE_PASSWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("static regex"));

/// Derive a filesystem-safe filename from a Usenet subject line.
///
/// Steps: HTML-entity unescape, quoted-substring extraction (or counter
/// and `yEnc` suffix stripping), reserved-character replacement with
/// `_`, whitespace trim.
pub fn sanitize_file_name(subject: &str) -> String {
    let unescaped = html_escape::decode_html_entities(subject).into_owned();

    let first_quote = unescaped.find('"');
    let last_quote = unescaped.rfind('"');

    let mut res = match (first_quote, last_quote) {
        (Some(first), Some(last)) if first < last => unescaped[first + 1..last].to_string(),
        _ => {
            let stripped = RE_YENC_SUFFIX.replace(&unescaped, "");
            RE_LEADING_COUNTER.replace(&stripped, "").into_owned()
        }
    };

    res = RE_BAD_CHARS.replace_all(&res, "_").into_owned();
    res.trim().to_string()
}

/// Extract an archive password embedded as `{{password}}` in a filename
/// or subject, returning the inner text.
pub fn extract_password(text: &str) -> Option<String> {
    RE_PASSWORD
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
