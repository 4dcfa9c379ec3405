use url::Url;

/// Extracts the domain used to key per-domain state
///
/// This is the lowercase host of the URL. Ports are not part of the key, so
/// `example.com:8080` and `example.com` share one budget and one circuit.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use sumi_conductor::url::extract_domain;
///
/// let url = Url::parse("https://EXAMPLE.COM/path").unwrap();
/// assert_eq!(extract_domain(&url), Some("example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str()
        .filter(|h| !h.is_empty())
        .map(|h| h.to_lowercase())
}
