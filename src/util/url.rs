use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during feed URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// The URL points to a private/internal address.
    #[error("Private network address not allowed: {0}")]
    PrivateHost(String),
}

/// Validates a feed URL before the first fetch.
///
/// Rejects non-HTTP(S) schemes and host-less URLs. Unless `allow_private`
/// is set, localhost and private/link-local IP literals are rejected too,
/// so a submitted feed URL cannot be used to reach the internal network.
///
/// The returned URL is the canonical form (see [`normalize_url`]).
pub fn validate_feed_url(url_str: &str, allow_private: bool) -> Result<Url, UrlValidationError> {
    let mut url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or(UrlValidationError::MissingHost)?
        .to_owned();

    if !allow_private && is_private_host(&host) {
        return Err(UrlValidationError::PrivateHost(host));
    }

    url.set_fragment(None);
    Ok(url)
}

/// Canonical string form of an absolute http(s) URL.
///
/// Scheme and host are lowercased, default ports dropped and the fragment
/// removed. Returns `None` for anything that is not an absolute http(s) URL.
pub fn normalize_url(url_str: &str) -> Option<String> {
    let mut url = Url::parse(url_str.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);
    Some(url.into())
}

/// Resolve a feed item's link into a canonical absolute URL.
///
/// - absolute http(s) links are used as-is
/// - protocol-relative links (`//host/path`) get `https:`
/// - root- and path-relative links are joined onto the site URL
/// - scheme-less host links (`example.com/post`) are assumed to be https
pub fn normalize_post_url(site_url: &str, link: &str) -> Option<String> {
    let link = link.trim();
    if link.is_empty() {
        return None;
    }

    if let Some(url) = normalize_url(link) {
        return Some(url);
    }

    if let Some(rest) = link.strip_prefix("//") {
        return normalize_url(&format!("https://{}", rest));
    }

    // A link with a scheme we don't fetch (mailto:, ftp:) is unusable.
    if let Ok(parsed) = Url::parse(link) {
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
    }

    let base = Url::parse(site_url).ok();
    let site_host = base.as_ref().and_then(Url::host_str);
    if !link.starts_with('/') && looks_like_host(link, site_host) {
        return normalize_url(&format!("https://{}", link));
    }

    let joined = base?.join(link).ok()?;
    normalize_url(joined.as_str())
}

/// Extensions that make a dotted first segment a file name, not a host.
const PAGE_EXTENSIONS: &[&str] = &[
    "htm", "html", "shtml", "xhtml", "php", "asp", "aspx", "jsp", "cgi", "pl", "md", "txt",
    "xml", "rss", "atom", "json", "pdf",
];

/// `example.com/post` style link.
///
/// The first segment must be the site's own host, or a dotted name with an
/// alphabetic top-level label followed by a path. `post.html`,
/// `index.php?p=12` and `archive.2024/x` stay relative.
fn looks_like_host(link: &str, site_host: Option<&str>) -> bool {
    let (first, rest) = match link.split_once('/') {
        Some((first, rest)) => (first, Some(rest)),
        None => (link, None),
    };
    if site_host.is_some_and(|host| first.eq_ignore_ascii_case(host)) {
        return true;
    }
    if rest.is_none()
        || !first.contains('.')
        || !first
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return false;
    }

    let labels: Vec<&str> = first.split('.').collect();
    if labels.iter().any(|label| label.is_empty()) {
        return false;
    }
    let tld = labels[labels.len() - 1];
    tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
        && !PAGE_EXTENSIONS.contains(&tld.to_ascii_lowercase().as_str())
}

fn is_private_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    match host_for_parse.parse::<IpAddr>() {
        Ok(IpAddr::V4(ipv4)) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        Ok(IpAddr::V6(ipv6)) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
        Err(_) => false,
    }
}
