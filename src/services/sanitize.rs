//! Free-text and URL sanitisation shared by the project mutation paths.

use regex::Regex;
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::LazyLock,
};
use thiserror::Error;
use url::{Host, Url};

const MAX_URL_LEN: usize = 2048;

static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?(?:</script\s*>|$)").expect("static regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(?:/?[a-zA-Z][^>]*|!--.*?--|![^>]*)>").expect("static regex")
});

/// Strip every HTML tag, drop `<script>` bodies entirely, escape stray angle
/// brackets and trim surrounding whitespace.
pub fn strip_markup(input: &str) -> String {
    let without_scripts = SCRIPT_BLOCK.replace_all(input, "");
    let without_tags = TAG.replace_all(&without_scripts, "");
    without_tags
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .trim()
        .to_string()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlRejection {
    #[error("url is not well formed")]
    Malformed,
    #[error("url is too long")]
    TooLong,
    #[error("scheme `{0}` is not allowed")]
    Scheme(String),
    #[error("url must not carry credentials")]
    Credentials,
    #[error("host `{0}` is not allowed")]
    Host(String),
}

/// Validate an externally supplied link and return its normalised form.
///
/// Only `http`/`https` with a public, dotted hostname or a public IP address
/// are accepted.
pub fn validate_external_url(raw: &str) -> Result<String, UrlRejection> {
    let raw = raw.trim();
    if raw.len() > MAX_URL_LEN {
        return Err(UrlRejection::TooLong);
    }
    let url = Url::parse(raw).map_err(|_| UrlRejection::Malformed)?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(UrlRejection::Scheme(other.to_string())),
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlRejection::Credentials);
    }

    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.');
            let labels: Vec<&str> = domain.split('.').collect();
            if labels.len() < 2
                || labels.iter().any(|label| label.is_empty())
                || domain.eq_ignore_ascii_case("localhost")
                || domain.to_ascii_lowercase().ends_with(".localhost")
                || domain.to_ascii_lowercase().ends_with(".local")
            {
                return Err(UrlRejection::Host(domain.to_string()));
            }
        }
        Some(Host::Ipv4(ip)) => ensure_public_ip(IpAddr::V4(ip))?,
        Some(Host::Ipv6(ip)) => ensure_public_ip(IpAddr::V6(ip))?,
        None => return Err(UrlRejection::Malformed),
    }

    Ok(url.to_string())
}

fn ensure_public_ip(ip: IpAddr) -> Result<(), UrlRejection> {
    let blocked = match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    };
    if blocked {
        Err(UrlRejection::Host(ip.to_string()))
    } else {
        Ok(())
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    // fc00::/7 unique-local, fe80::/10 link-local
    let first = ip.segments()[0];
    ip.is_loopback() || ip.is_unspecified() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_script_bodies_and_tags() {
        assert_eq!(strip_markup("<script>alert(1)</script>Title"), "Title");
        assert_eq!(strip_markup("<SCRIPT type=\"x\">x</SCRIPT>Progress!"), "Progress!");
        assert_eq!(strip_markup("  <b>bold</b> <i>move</i>  "), "bold move");
        assert_eq!(strip_markup("<img src=x onerror=alert(1)>"), "");
        assert_eq!(strip_markup("a <!-- hidden --> b"), "a  b");
    }

    #[test]
    fn unterminated_script_swallows_the_rest() {
        assert_eq!(strip_markup("Hi<script>steal()"), "Hi");
    }

    #[test]
    fn escapes_stray_brackets() {
        assert_eq!(strip_markup("1 < 2 > 0"), "1 &lt; 2 &gt; 0");
    }

    #[test]
    fn markup_only_input_becomes_empty() {
        assert_eq!(strip_markup("<script>x</script>   <p></p>"), "");
    }

    #[test]
    fn accepts_public_http_urls() {
        assert_eq!(
            validate_external_url("https://example.com/app").as_deref(),
            Ok("https://example.com/app")
        );
        assert_eq!(
            validate_external_url(" http://sub.example.org ").as_deref(),
            Ok("http://sub.example.org/")
        );
        assert!(validate_external_url("https://8.8.8.8/").is_ok());
    }

    #[test]
    fn rejects_unsafe_urls() {
        assert_eq!(
            validate_external_url("javascript:alert(1)"),
            Err(UrlRejection::Scheme("javascript".into()))
        );
        assert!(matches!(
            validate_external_url("data:text/html,hi"),
            Err(UrlRejection::Scheme(_))
        ));
        assert_eq!(validate_external_url("example.com"), Err(UrlRejection::Malformed));
        assert!(matches!(
            validate_external_url("http://intranet/"),
            Err(UrlRejection::Host(_))
        ));
        assert!(matches!(
            validate_external_url("http://localhost:8080"),
            Err(UrlRejection::Host(_))
        ));
        assert!(matches!(
            validate_external_url("http://127.0.0.1/"),
            Err(UrlRejection::Host(_))
        ));
        assert!(matches!(
            validate_external_url("http://[::1]/"),
            Err(UrlRejection::Host(_))
        ));
        assert_eq!(
            validate_external_url("https://user:pw@example.com"),
            Err(UrlRejection::Credentials)
        );
        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_LEN));
        assert_eq!(validate_external_url(&long), Err(UrlRejection::TooLong));
    }
}
