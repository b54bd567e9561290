use url::Url;

/// Derive the guard key for a target (scheme://host:port).
///
/// Targets that are not absolute URLs are keyed by their trimmed text,
/// so opaque payloads still get a limiter and breaker of their own.
/// Example: `"https://example.com/in/jane"` → `"https://example.com:443"`
pub fn target_key(target: &str) -> String {
    domain_key(target).unwrap_or_else(|| target.trim().to_string())
}

fn domain_key(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str.trim()).ok()?;
    let host = url.host_str()?;
    let port = url
        .port_or_known_default()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    Some(format!("{}://{}{}", url.scheme(), host, port))
}
