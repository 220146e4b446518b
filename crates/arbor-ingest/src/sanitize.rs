//! Helpers for sanitizing data before it enters tracing span attributes
//! or object-store paths.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Strips userinfo, query string and fragment from a URL so signed or
/// token-bearing image links can be logged.
///
/// - `https://user:pw@cdn.example/a/b.jpg?token=x` → `https://****@cdn.example/a/b.jpg`
/// - `src/batch-1/page-1-a.jpg` → unchanged
pub fn redact_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);

    if let Some(scheme_end) = without_query.find("://") {
        let after_scheme = &without_query[scheme_end + 3..];
        let authority_end = after_scheme.find('/').unwrap_or(after_scheme.len());
        if let Some(at_pos) = after_scheme[..authority_end].rfind('@') {
            let scheme = &without_query[..scheme_end + 3];
            return format!("{}****@{}", scheme, &after_scheme[at_pos + 1..]);
        }
    }

    without_query.to_string()
}

/// Short deterministic hash for correlating a value without exposing it.
pub fn hash_value(value: &str) -> String {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Reduces an uploaded file name to `[A-Za-z0-9._-]` so it is safe as the
/// last segment of an object path. Never returns an empty or dot-only name.
pub fn object_file_name(original: &str) -> String {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original);

    let mut cleaned = String::with_capacity(base.len());
    let mut last_dash = false;
    for c in base.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            cleaned.push(c);
            last_dash = c == '-';
        } else if !last_dash {
            cleaned.push('-');
            last_dash = true;
        }
    }

    let trimmed = cleaned.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "image".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_url_userinfo_and_query() {
        assert_eq!(
            redact_url("https://user:pw@cdn.example/a/b.jpg?token=x#frag"),
            "https://****@cdn.example/a/b.jpg"
        );
    }

    #[test]
    fn test_redact_url_plain() {
        assert_eq!(
            redact_url("https://cdn.example/kb/X/batch-1/page-1-a.jpg"),
            "https://cdn.example/kb/X/batch-1/page-1-a.jpg"
        );
        assert_eq!(redact_url("X/batch-1/page-1-a.jpg"), "X/batch-1/page-1-a.jpg");
    }

    #[test]
    fn test_redact_url_at_in_path_is_kept() {
        assert_eq!(
            redact_url("https://cdn.example/users/a@b/scan.jpg"),
            "https://cdn.example/users/a@b/scan.jpg"
        );
    }

    #[test]
    fn test_hash_value_deterministic() {
        assert_eq!(hash_value("sk-abc"), hash_value("sk-abc"));
        assert_ne!(hash_value("sk-abc"), hash_value("sk-abd"));
        assert_eq!(hash_value("x").len(), 16);
    }

    #[test]
    fn test_object_file_name() {
        assert_eq!(object_file_name("Seite 12 (Eiche).JPG"), "Seite-12-Eiche-.JPG");
        assert_eq!(object_file_name("../../etc/passwd"), "passwd");
        assert_eq!(object_file_name("C:\\scans\\page_01.png"), "page_01.png");
        assert_eq!(object_file_name("..."), "image");
        assert_eq!(object_file_name("???"), "image");
    }
}
