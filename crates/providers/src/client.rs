use reqwest::Client;
use std::time::Duration;
use tracing::warn;

/// Build the shared reqwest client used by the local LLM and backend probes.
///
/// Proxy settings come from the standard `HTTPS_PROXY`/`HTTP_PROXY`
/// variables, except for loopback targets which always connect directly.
pub fn build_http_client(api_base: &str, timeout: Duration) -> Client {
    let mut builder = Client::builder().timeout(timeout);
    if is_loopback(api_base) {
        builder = builder.no_proxy();
    }
    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}

/// Trim whitespace and trailing slashes so paths can be appended with `format!`.
pub fn normalize_base(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn extract_host(url: &str) -> Option<&str> {
    let without_scheme = url.find("://").map(|pos| &url[pos + 3..]).unwrap_or(url);
    let authority = without_scheme.split('/').next()?;
    let host = authority.rsplit('@').next()?;
    if let Some(v6) = host.strip_prefix('[') {
        return v6.split(']').next();
    }
    host.split(':').next()
}

fn is_loopback(url: &str) -> bool {
    matches!(extract_host(url), Some("localhost") | Some("127.0.0.1") | Some("::1"))
}
