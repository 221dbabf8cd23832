use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex")
}

static BLOCK_COMMENT: LazyLock<Regex> = LazyLock::new(|| re(r"(?s)/\*[^!].*?\*/"));
static LINE_COMMENT: LazyLock<Regex> = LazyLock::new(|| re(r"(?m)(?:--|#)[^\n]*$"));
static USE_DB: LazyLock<Regex> = LazyLock::new(|| re(r"(?i)^\s*use\s+\S+"));
static CALL: LazyLock<Regex> = LazyLock::new(|| re(r"(?i)^\s*call\s+(\S+?)\s*\(.*$"));
static SINGLE_QUOTED: LazyLock<Regex> = LazyLock::new(|| re(r"'(?:[^'\\]|\\.|'')*'"));
static DOUBLE_QUOTED: LazyLock<Regex> = LazyLock::new(|| re(r#""(?:[^"\\]|\\.|"")*""#));
static HEX: LazyLock<Regex> = LazyLock::new(|| re(r"\b0x[0-9a-f]+\b"));
static NUMBER: LazyLock<Regex> = LazyLock::new(|| re(r"\b\d+(?:\.\d+)?(?:e[-+]?\d+)?\b"));
static NULL: LazyLock<Regex> = LazyLock::new(|| re(r"\bnull\b"));
static SPACE: LazyLock<Regex> = LazyLock::new(|| re(r"\s+"));
static IN_LIST: LazyLock<Regex> = LazyLock::new(|| re(r"\bin\s*\(\s*\?(?:\s*,\s*\?)*\s*\)"));
static VALUES: LazyLock<Regex> = LazyLock::new(|| re(r"\bvalues\s*\(.*$"));
static LIMIT: LazyLock<Regex> = LazyLock::new(|| re(r"\blimit \?(?:\s*,\s*\?| offset \?)?"));

/// Normalize a query into its class key: literals become `?`, value lists
/// collapse, comments and redundant whitespace go away.
pub fn fingerprint(query: &str) -> String {
    let query = query.trim();

    if query
        .get(..22)
        .is_some_and(|p| p.eq_ignore_ascii_case("administrator command:"))
    {
        return query.to_string();
    }

    if USE_DB.is_match(query) {
        return "use ?".to_string();
    }

    if let Some(caps) = CALL.captures(query) {
        return format!("call {}", caps[1].to_lowercase());
    }

    let q = BLOCK_COMMENT.replace_all(query, "");
    let q = SINGLE_QUOTED.replace_all(&q, "?");
    let q = DOUBLE_QUOTED.replace_all(&q, "?");
    let q = LINE_COMMENT.replace_all(&q, "");

    let q = q.to_lowercase();
    let q = HEX.replace_all(&q, "?");
    let q = NUMBER.replace_all(&q, "?");
    let q = NULL.replace_all(&q, "?");
    let q = SPACE.replace_all(&q, " ");
    let q = IN_LIST.replace_all(&q, "in(?+)");

    let q = if q.starts_with("insert") || q.starts_with("replace") {
        VALUES.replace(&q, "values(?+)")
    } else {
        q
    };
    let q = LIMIT.replace_all(&q, "limit ?");

    q.trim().trim_end_matches(';').trim_end().to_string()
}

/// Class id of a fingerprint: the first 8 bytes of its SHA-256, upper hex.
pub fn class_id(fingerprint: &str) -> String {
    let digest = Sha256::digest(fingerprint.as_bytes());
    hex::encode_upper(&digest[..8])
}
