//! Decides from response metadata alone whether a response is worth capturing.

use std::collections::HashMap;

use url::{Host, Url};

/// Media type prefix of capturable responses.
const HTML_MEDIA_TYPE: &str = "text/html";

/// Returns true if a response should be buffered and indexed.
///
/// Rules, in order:
/// 1. status is 200
/// 2. the request host is neither `localhost` nor a loopback address
/// 3. `Content-Type` is present and its media type starts with `text/html`
///
/// Header names match case-insensitively; the media type match is
/// case-sensitive. A request URL that cannot be parsed is rejected.
pub fn should_capture(status: u16, headers: &HashMap<String, String>, request_url: &str) -> bool {
    if status != 200 {
        return false;
    }

    match is_local_url(request_url) {
        Some(false) => {}
        _ => return false,
    }

    header(headers, "content-type")
        .map(|value| media_type(value).starts_with(HTML_MEDIA_TYPE))
        .unwrap_or(false)
}

/// Whether the host of `url` is local. `None` if the URL has no host.
pub fn is_local_url(url: &str) -> Option<bool> {
    let parsed = Url::parse(url).ok()?;
    let local = match parsed.host()? {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.');
            domain.eq_ignore_ascii_case("localhost")
        }
        Host::Ipv4(addr) => addr.is_loopback(),
        Host::Ipv6(addr) => addr.is_loopback(),
    };
    Some(local)
}

/// Looks up a header by case-insensitive name.
pub fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// The media type of a `Content-Type` value, without parameters.
pub fn media_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const PAGE: &str = "https://www.example.com/article";

    #[test]
    fn captures_html_ok_responses() {
        let h = headers(&[("Content-Type", "text/html; charset=utf-8")]);
        assert!(should_capture(200, &h, PAGE));
    }

    #[test]
    fn rejects_non_ok_status() {
        let h = headers(&[("Content-Type", "text/html")]);
        assert!(!should_capture(404, &h, PAGE));
        assert!(!should_capture(304, &h, PAGE));
        assert!(!should_capture(206, &h, PAGE));
    }

    #[test]
    fn rejects_other_media_types() {
        let h = headers(&[("Content-Type", "application/json")]);
        assert!(!should_capture(200, &h, PAGE));

        let h = headers(&[("Content-Type", "text/plain; format=text/html")]);
        assert!(!should_capture(200, &h, PAGE));

        let h = headers(&[("Content-Type", "TEXT/HTML")]);
        assert!(!should_capture(200, &h, PAGE));
    }

    #[test]
    fn rejects_missing_content_type() {
        assert!(!should_capture(200, &HashMap::new(), PAGE));
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let h = headers(&[("content-type", "text/html")]);
        assert!(should_capture(200, &h, PAGE));

        let h = headers(&[("CONTENT-TYPE", "text/html")]);
        assert!(should_capture(200, &h, PAGE));
    }

    #[test]
    fn rejects_local_hosts() {
        let h = headers(&[("Content-Type", "text/html")]);
        assert!(!should_capture(200, &h, "http://localhost:8080/"));
        assert!(!should_capture(200, &h, "http://LOCALHOST/"));
        assert!(!should_capture(200, &h, "http://127.0.0.1/page"));
        assert!(!should_capture(200, &h, "http://127.1.2.3/page"));
        assert!(!should_capture(200, &h, "http://[::1]:3000/"));
    }

    #[test]
    fn rejects_unparseable_urls() {
        let h = headers(&[("Content-Type", "text/html")]);
        assert!(!should_capture(200, &h, "not a url"));
        assert!(!should_capture(200, &h, "/relative/path"));
    }

    #[test]
    fn media_type_drops_parameters() {
        assert_eq!(media_type("text/html; charset=utf-8"), "text/html");
        assert_eq!(media_type(" text/html"), "text/html");
        assert_eq!(media_type(""), "");
    }
}
