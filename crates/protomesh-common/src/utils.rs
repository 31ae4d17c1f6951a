//! Utility functions for protomesh
//!
//! Helpers for naming generated objects and identifying the control plane.

use std::sync::LazyLock;

use if_addrs::IfAddr;

/// Characters not allowed in a generated object name
static INVALID_NAME_CHARS: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("[^a-z0-9.-]+").expect("Invalid regex pattern"));

/// Maximum length of a Kubernetes object name
pub const MAX_NAME_LEN: usize = 253;

/// Turn an arbitrary string into a valid object name
///
/// Lowercases, replaces runs of invalid characters with `-`, trims leading
/// and trailing separators and truncates to [`MAX_NAME_LEN`].
///
/// # Examples
///
/// ```
/// use protomesh_common::sanitize_name;
///
/// assert_eq!(sanitize_name("Dubbo_Svc.NS:20880"), "dubbo-svc.ns-20880");
/// assert_eq!(sanitize_name("--a--"), "a");
/// ```
pub fn sanitize_name(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let replaced = INVALID_NAME_CHARS.replace_all(&lowered, "-");
    let trimmed = replaced.trim_matches(|c| c == '-' || c == '.');
    let mut name: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    while name.ends_with('-') || name.ends_with('.') {
        name.pop();
    }
    name
}

/// Get the local IP address
///
/// Returns the first non-loopback IPv4 address found,
/// or "127.0.0.1" as fallback.
pub fn local_ip() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .into_iter()
                .find(|iface| !iface.is_loopback() && matches!(iface.addr, IfAddr::V4(_)))
                .and_then(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("svc.ns"), "svc.ns");
        assert_eq!(sanitize_name("Outbound|8080||svc.ns"), "outbound-8080-svc.ns");
        assert_eq!(sanitize_name("***"), "");
    }

    #[test]
    fn test_sanitize_name_truncates() {
        let long = "a".repeat(400);
        assert_eq!(sanitize_name(&long).len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_local_ip() {
        let ip = local_ip();
        assert!(ip.parse::<std::net::Ipv4Addr>().is_ok());
    }
}
