//! Subdomain normalization and validation
//!
//! Every public hostname the fleet hands out is built from a single DNS
//! label derived here, so the proxy route table, the container labels and
//! the uniqueness check all agree on the same canonical form.

/// Maximum length of a single DNS label
pub const MAX_SUBDOMAIN_LENGTH: usize = 63;

/// Map an arbitrary display name to a canonical DNS label.
///
/// Lowercases the input, collapses every run of characters outside
/// `[a-z0-9]` into a single hyphen and strips leading/trailing hyphens.
/// Total and idempotent; an empty result means the input had no usable
/// characters and must be rejected by the caller.
///
/// ```
/// use craftgate::subdomain::normalize;
/// assert_eq!(normalize("My Server!"), "my-server");
/// assert_eq!(normalize("___"), "");
/// ```
pub fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_hyphen = false;

    for c in input.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    out
}

/// Check that `s` is a usable DNS label: `^[a-z0-9]([a-z0-9-]*[a-z0-9])?$`, at most 63 bytes
pub fn is_valid_subdomain(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_SUBDOMAIN_LENGTH {
        return false;
    }

    let bytes = s.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return false;
    }

    bytes.iter().all(|&b| edge_ok(b) || b == b'-')
}

/// Subdomain a caller asked for: the explicit one when present and
/// non-empty, otherwise the normalized name. May be empty.
pub fn requested_subdomain(explicit: Option<&str>, name: &str) -> String {
    match explicit.map(str::trim) {
        Some(s) if !s.is_empty() => normalize(s),
        _ => normalize(name),
    }
}

/// Subdomain for a stored descriptor that lacks one: the requested
/// subdomain, otherwise the normalized id
pub fn effective_subdomain(explicit: Option<&str>, name: &str, id: &str) -> String {
    let requested = requested_subdomain(explicit, name);
    if requested.is_empty() {
        normalize(id)
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_examples() {
        assert_eq!(normalize("My Server!"), "my-server");
        assert_eq!(normalize("Test_123"), "test-123");
        assert_eq!(normalize("___"), "");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("  Survival  "), "survival");
        assert_eq!(normalize("a--b"), "a-b");
        assert_eq!(normalize("Crème Brûlée"), "cr-me-br-l-e");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = [
            "My Server!",
            "--leading",
            "trailing--",
            "ÜBER server 2",
            "a.b.c",
            "日本語",
            "x",
            "MiXeD_CaSe-123",
            "İstanbul",
        ];

        for s in samples {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", s);
            assert!(once.is_empty() || is_valid_subdomain(&once) || once.len() > MAX_SUBDOMAIN_LENGTH);
        }
    }

    #[test]
    fn test_is_valid_subdomain() {
        assert!(is_valid_subdomain("survival"));
        assert!(is_valid_subdomain("a"));
        assert!(is_valid_subdomain("my-server-2"));
        assert!(!is_valid_subdomain(""));
        assert!(!is_valid_subdomain("-lead"));
        assert!(!is_valid_subdomain("trail-"));
        assert!(!is_valid_subdomain("Upper"));
        assert!(!is_valid_subdomain("has space"));
        assert!(!is_valid_subdomain(&"a".repeat(64)));
        assert!(is_valid_subdomain(&"a".repeat(63)));
    }

    #[test]
    fn test_effective_subdomain_fallbacks() {
        assert_eq!(effective_subdomain(Some("Lobby"), "ignored", "id"), "lobby");
        assert_eq!(effective_subdomain(Some("  "), "Creative World", "id"), "creative-world");
        assert_eq!(effective_subdomain(None, "!!!", "abc-123"), "abc-123");
        assert_eq!(requested_subdomain(None, "!!!"), "");
        assert_eq!(requested_subdomain(Some(""), "Creative World"), "creative-world");
    }
}
