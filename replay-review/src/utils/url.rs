//! URL helpers.

use url::Url;

/// Extracts the lowercase host of an absolute http(s) URL.
///
/// Returns `None` when the URL is not absolute http(s) or has no host.
pub fn extract_host(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str().map(|h| h.trim_end_matches('.').to_ascii_lowercase())
}

/// Whether `raw` points at a host covered by `allowed`.
///
/// An entry matches its exact host and any subdomain of it. An empty
/// allow-list admits every URL, including ones without a parseable host.
pub fn host_allowed(raw: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(host) = extract_host(raw) else {
        return false;
    };

    allowed.iter().any(|entry| {
        let entry = entry.trim().trim_end_matches('.').to_ascii_lowercase();
        !entry.is_empty()
            && (host == entry
                || host
                    .strip_suffix(entry.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.')))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_host_ignoring_port_and_case() {
        assert_eq!(
            extract_host("https://App.Example.com:8443/path?x=1"),
            Some("app.example.com".to_string())
        );
    }

    #[test]
    fn rejects_non_http() {
        assert_eq!(extract_host("file:///tmp/x"), None);
        assert_eq!(extract_host("/relative/path"), None);
    }

    #[test]
    fn allow_list_matches_exact_and_subdomains() {
        let allowed = vec!["example.com".to_string()];
        assert!(host_allowed("https://example.com/a", &allowed));
        assert!(host_allowed("https://app.example.com/a", &allowed));
        assert!(!host_allowed("https://badexample.com/a", &allowed));
        assert!(!host_allowed("https://example.com.evil.io/", &allowed));
        assert!(!host_allowed("not a url", &allowed));
    }

    #[test]
    fn empty_allow_list_admits_everything() {
        assert!(host_allowed("not a url", &[]));
    }
}
