use std::sync::OnceLock;

use regex::{Captures, Regex};

pub const REDACTION_TOKEN: &str = "[REDACTED]";
pub const DEFAULT_DIAGNOSTIC_MAX_CHARS: usize = 2_000;

struct RegexRedactionMatcher {
    regex: fn() -> &'static Regex,
    replacement: for<'a> fn(&Captures<'a>) -> String,
}

/// Scrubs credentials that upstream services sometimes echo back in error
/// bodies, then truncates to `max_chars`.
#[must_use]
pub fn redact_diagnostic_text(value: &str, max_chars: usize) -> String {
    let mut redacted = value.to_string();
    for matcher in redaction_matcher_catalog() {
        redacted = (matcher.regex)()
            .replace_all(&redacted, |captures: &Captures<'_>| {
                (matcher.replacement)(captures)
            })
            .to_string();
    }
    truncate_deterministic(&redacted, max_chars)
}

fn truncate_deterministic(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    if max_chars <= 3 {
        return ".".repeat(max_chars);
    }

    let prefix = value.chars().take(max_chars - 3).collect::<String>();
    format!("{prefix}...")
}

fn redaction_matcher_catalog() -> &'static [RegexRedactionMatcher] {
    static CATALOG: OnceLock<Vec<RegexRedactionMatcher>> = OnceLock::new();
    CATALOG.get_or_init(|| {
        vec![
            RegexRedactionMatcher {
                regex: bearer_token_regex,
                replacement: replace_bearer_token,
            },
            RegexRedactionMatcher {
                regex: api_token_regex,
                replacement: replace_with_redaction,
            },
            RegexRedactionMatcher {
                regex: secret_assignment_regex,
                replacement: replace_secret_assignment,
            },
            RegexRedactionMatcher {
                regex: url_query_token_regex,
                replacement: replace_url_query_token,
            },
        ]
    })
}

fn bearer_token_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._=\-]{8,}")
            .expect("bearer token regex should compile")
    })
}

fn api_token_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"\bsk-[A-Za-z0-9_\-]{8,}").expect("api token regex should compile")
    })
}

fn secret_assignment_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#"(?i)\b(password|passwd|secret|api[_\-]?key|token)\b(\s*[:=]\s*)([^\s,;"']+)"#)
            .expect("secret assignment regex should compile")
    })
}

fn url_query_token_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)([?&](?:access_token|token|api_key|key)=)([^&\s]+)")
            .expect("url query token regex should compile")
    })
}

fn replace_with_redaction(_captures: &Captures<'_>) -> String {
    REDACTION_TOKEN.to_string()
}

fn replace_bearer_token(_captures: &Captures<'_>) -> String {
    format!("Bearer {REDACTION_TOKEN}")
}

fn replace_secret_assignment(captures: &Captures<'_>) -> String {
    format!("{}{}{}", &captures[1], &captures[2], REDACTION_TOKEN)
}

fn replace_url_query_token(captures: &Captures<'_>) -> String {
    format!("{}{}", &captures[1], REDACTION_TOKEN)
}
