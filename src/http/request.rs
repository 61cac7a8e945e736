use crate::packet::Conversation;
use bytes::Bytes;
use core::fmt;
use core::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Http10 => f.write_str("HTTP/1.0"),
            Version::Http11 => f.write_str("HTTP/1.1"),
        }
    }
}

/// Header fields in the order they appeared. Lookups ignore ASCII case;
/// repeated fields are all kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, Bytes)>,
}

impl Headers {
    pub(crate) fn push(&mut self, name: &str, value: &[u8]) {
        self.fields
            .push((name.to_owned(), Bytes::copy_from_slice(value)));
    }

    /// First value of `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.get_all(name).next()
    }

    /// First value of `name`, if it is valid UTF-8
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| core::str::from_utf8(v).ok())
    }

    /// Every value of `name`, in order
    pub fn get_all<'a, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a [u8]> + use<'a, 'b> {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All fields with their original name spelling
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_ref()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A complete HTTP request reconstructed from captured traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub(crate) conversation: Conversation,
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) version: Version,
    pub(crate) headers: Headers,
    pub(crate) body: Bytes,
    pub(crate) trailers: Headers,
}

impl HttpRequest {
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request target as sent, usually an origin-form path
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Body with any chunked transfer coding removed
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Trailer fields of a chunked body
    #[must_use]
    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }

    #[must_use]
    pub fn client(&self) -> SocketAddr {
        self.conversation.client
    }

    #[must_use]
    pub fn server(&self) -> SocketAddr {
        self.conversation.server
    }

    /// Absolute URL built from the Host header, when the target is origin-form
    #[must_use]
    pub fn url(&self) -> Option<String> {
        if self.target.starts_with("http://") || self.target.starts_with("https://") {
            return Some(self.target.clone());
        }
        let host = self.headers.get_str("host")?.trim();
        let path = self.target.trim_start_matches('/');
        Some(format!("http://{host}/{path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn request(target: &str, host: Option<&str>) -> HttpRequest {
        let mut headers = Headers::default();
        if let Some(host) = host {
            headers.push("Host", host.as_bytes());
        }
        HttpRequest {
            conversation: Conversation {
                client: "192.168.1.100:54321".parse().unwrap(),
                server: "10.0.0.1:80".parse().unwrap(),
            },
            method: "GET".to_owned(),
            target: target.to_owned(),
            version: Version::Http11,
            headers,
            body: Bytes::new(),
            trailers: Headers::default(),
        }
    }

    #[test]
    fn test_headers_case_insensitive_and_ordered() {
        let mut headers = Headers::default();
        headers.push("Accept", b"text/html");
        headers.push("X-Forwarded-For", b"10.0.0.1");
        headers.push("x-forwarded-for", b"10.0.0.2");

        assert_eq!(headers.get("ACCEPT"), Some(&b"text/html"[..]));
        assert_eq!(
            headers.get_all("X-FORWARDED-FOR").collect::<Vec<_>>(),
            vec![&b"10.0.0.1"[..], &b"10.0.0.2"[..]]
        );
        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["Accept", "X-Forwarded-For", "x-forwarded-for"]);
        assert!(!headers.contains("cookie"));
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_header_value_outlives_lookup_name() {
        let mut headers = Headers::default();
        headers.push("Content-Type", b"text/plain");
        let value = {
            let name = String::from("content-type");
            headers.get_str(&name)
        };
        assert_eq!(value, Some("text/plain"));
    }

    #[rstest]
    #[case("/", Some("www.example.com"), Some("http://www.example.com/"))]
    #[case("/path?q=1", Some(" example.com "), Some("http://example.com/path?q=1"))]
    #[case("http://proxy.test/x", None, Some("http://proxy.test/x"))]
    #[case("/no-host", None, None)]
    fn test_url(#[case] target: &str, #[case] host: Option<&str>, #[case] expected: Option<&str>) {
        assert_eq!(request(target, host).url().as_deref(), expected);
    }
}
