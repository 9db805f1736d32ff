//! Kubernetes naming rules checked before any manifest is rendered.

use std::net::IpAddr;

const MAX_LABEL: usize = 63;
const MAX_SUBDOMAIN: usize = 253;

/// RFC 1035 label: what Service names must satisfy.
pub fn is_dns1035_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            s.len() <= MAX_LABEL
                && first.is_ascii_lowercase()
                && (last.is_ascii_lowercase() || last.is_ascii_digit())
                && bytes.iter().all(|b| is_label_byte(*b))
        }
        _ => false,
    }
}

/// RFC 1123 label.
pub fn is_dns1123_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            s.len() <= MAX_LABEL
                && is_alnum(*first)
                && is_alnum(*last)
                && bytes.iter().all(|b| is_label_byte(*b))
        }
        _ => false,
    }
}

/// RFC 1123 subdomain: dot separated labels, at most 253 bytes.
pub fn is_dns1123_subdomain(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_SUBDOMAIN
        && s.split('.').all(is_dns1123_label)
}

/// Ingress rule host: a subdomain, optionally behind a single `*.`
/// wildcard. IP literals are rejected by the API server.
pub fn is_ingress_host(s: &str) -> bool {
    if s.parse::<IpAddr>().is_ok() {
        return false;
    }
    let rest = s.strip_prefix("*.").unwrap_or(s);
    is_dns1123_subdomain(rest)
}

/// Image references are opaque to the controller beyond being non-empty and
/// free of whitespace.
pub fn is_image_ref(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(char::is_whitespace)
}

fn is_alnum(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

fn is_label_byte(b: u8) -> bool {
    is_alnum(b) || b == b'-'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns1035_requires_leading_letter() {
        assert!(is_dns1035_label("foo"));
        assert!(is_dns1035_label("foo-2"));
        assert!(!is_dns1035_label("2foo"));
        assert!(!is_dns1035_label("foo-"));
        assert!(!is_dns1035_label("Foo"));
        assert!(!is_dns1035_label(""));
        assert!(!is_dns1035_label(&"a".repeat(64)));
    }

    #[test]
    fn subdomain_checks_every_label() {
        assert!(is_dns1123_subdomain("foo.example.com"));
        assert!(is_dns1123_subdomain("0day.example"));
        assert!(!is_dns1123_subdomain("foo..example.com"));
        assert!(!is_dns1123_subdomain("foo_bar.example.com"));
        assert!(!is_dns1123_subdomain(".example.com"));
    }

    #[test]
    fn ingress_host_allows_wildcard_but_not_ip() {
        assert!(is_ingress_host("*.example.com"));
        assert!(is_ingress_host("foo.example.com"));
        assert!(!is_ingress_host("10.0.0.1"));
        assert!(!is_ingress_host("foo.*.example.com"));
        assert!(!is_ingress_host("https://foo.example.com"));
    }

    #[test]
    fn image_ref_rejects_whitespace() {
        assert!(is_image_ref("registry.local:5000/team/app:1.0"));
        assert!(!is_image_ref("app 1.0"));
        assert!(!is_image_ref(""));
    }
}
