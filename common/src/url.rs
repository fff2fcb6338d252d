use core::fmt;

use thiserror::Error;

pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("url has no scheme separator")]
    MissingScheme,
    #[error("unsupported url scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("url host is empty")]
    EmptyHost,
    #[error("invalid url host `{0}`")]
    InvalidHost(String),
    #[error("invalid url port `{0}`")]
    InvalidPort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => HTTP_PORT,
            Self::Https => HTTPS_PORT,
        }
    }

    fn from_raw(raw: &str) -> Result<Self, ParseError> {
        if raw.eq_ignore_ascii_case("http") {
            Ok(Self::Http)
        } else if raw.eq_ignore_ascii_case("https") {
            Ok(Self::Https)
        } else {
            Err(ParseError::UnsupportedScheme(raw.to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRecord {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

/// Request-ready form of a [`UrlRecord`], carrying a TLS flag instead of a scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientUrl {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

pub fn parse(raw: &str) -> Result<UrlRecord, ParseError> {
    let raw = raw.trim();
    let (scheme, rest) = raw.split_once("://").ok_or(ParseError::MissingScheme)?;
    if scheme.is_empty() {
        return Err(ParseError::MissingScheme);
    }
    let scheme = Scheme::from_raw(scheme)?;

    // The authority ends at the first path or query delimiter.
    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);

    let (host, port) = split_host_port(authority, scheme.default_port())?;

    let (path, query) = match tail.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (tail, None),
    };
    let path = if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    };

    Ok(UrlRecord {
        scheme,
        host: host.to_string(),
        port,
        path,
        query,
    })
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(&str, u16), ParseError> {
    let (host, port) = if authority.starts_with('[') {
        let close = authority
            .find(']')
            .ok_or_else(|| ParseError::InvalidHost(authority.to_string()))?;
        let (host, after) = authority.split_at(close + 1);
        if host == "[]" {
            return Err(ParseError::EmptyHost);
        }
        match after {
            "" => (host, None),
            _ => match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(ParseError::InvalidHost(authority.to_string())),
            },
        }
    } else {
        match authority.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(ParseError::EmptyHost);
    }
    if !host.starts_with('[') && port.is_some_and(|port| port.contains(':')) {
        return Err(ParseError::InvalidHost(authority.to_string()));
    }
    let port = match port {
        Some(port) => parse_port(port)?,
        None => default_port,
    };
    Ok((host, port))
}

fn parse_port(raw: &str) -> Result<u16, ParseError> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidPort(raw.to_string()));
    }
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(ParseError::InvalidPort(raw.to_string())),
        Ok(port) => Ok(port),
    }
}

impl UrlRecord {
    pub fn to_client_form(&self) -> ClientUrl {
        ClientUrl {
            secure: self.scheme == Scheme::Https,
            host: self.host.clone(),
            port: self.port,
            path: self.path.clone(),
            query: self.query.clone(),
        }
    }
}

impl ClientUrl {
    pub fn scheme(&self) -> Scheme {
        if self.secure {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }

    pub fn is_default_port(&self) -> bool {
        self.port == self.scheme().default_port()
    }

    pub fn request_target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

fn write_url(
    f: &mut fmt::Formatter<'_>,
    scheme: Scheme,
    host: &str,
    port: u16,
    path: &str,
    query: Option<&str>,
) -> fmt::Result {
    write!(f, "{}://{}", scheme.as_str(), host)?;
    if port != scheme.default_port() {
        write!(f, ":{port}")?;
    }
    f.write_str(path)?;
    if let Some(query) = query {
        write!(f, "?{query}")?;
    }
    Ok(())
}

impl fmt::Display for UrlRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_url(
            f,
            self.scheme,
            &self.host,
            self.port,
            &self.path,
            self.query.as_deref(),
        )
    }
}

impl fmt::Display for ClientUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_url(
            f,
            self.scheme(),
            &self.host,
            self.port,
            &self.path,
            self.query.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_full_url() {
        let url = parse("https://ci.example.com:8443/api/v1/status?team=main&pipeline=x").unwrap();

        assert_eq!(url.scheme, Scheme::Https);
        assert_eq!(url.host, "ci.example.com");
        assert_eq!(url.port, 8443);
        assert_eq!(url.path, "/api/v1/status");
        assert_eq!(url.query.as_deref(), Some("team=main&pipeline=x"));
    }

    #[test]
    fn defaults_port_and_path() {
        let http = parse("http://192.168.0.2").unwrap();
        assert_eq!(http.port, 80);
        assert_eq!(http.path, "/");
        assert_eq!(http.query, None);

        let https = parse("HTTPS://example.com?x=1").unwrap();
        assert_eq!(https.scheme, Scheme::Https);
        assert_eq!(https.port, 443);
        assert_eq!(https.path, "/");
        assert_eq!(https.query.as_deref(), Some("x=1"));
    }

    #[test]
    fn rejects_malformed_schemes() {
        for raw in [
            "example.com/status",
            "://example.com",
            "ftp://example.com",
            "http:/example.com",
            "mqtt://broker:1883",
            "",
        ] {
            let err = parse(raw).unwrap_err();
            assert!(
                matches!(
                    err,
                    ParseError::MissingScheme | ParseError::UnsupportedScheme(_)
                ),
                "{raw}: {err:?}"
            );
        }
    }

    #[test]
    fn rejects_empty_host_and_bad_port() {
        assert_eq!(parse("http:///path"), Err(ParseError::EmptyHost));
        assert_eq!(parse("https://:8080/"), Err(ParseError::EmptyHost));
        assert_eq!(
            parse("http://host:http/"),
            Err(ParseError::InvalidPort("http".to_string()))
        );
        assert_eq!(
            parse("http://host:70000/"),
            Err(ParseError::InvalidPort("70000".to_string()))
        );
        assert_eq!(
            parse("http://host:/"),
            Err(ParseError::InvalidPort(String::new()))
        );
    }

    #[test]
    fn handles_colons_in_the_authority() {
        assert_eq!(
            parse("http://host:8080:9090/"),
            Err(ParseError::InvalidHost("host:8080:9090".to_string()))
        );
        assert_eq!(
            parse("http://[::1/"),
            Err(ParseError::InvalidHost("[::1".to_string()))
        );
        assert_eq!(parse("http://[]:80/"), Err(ParseError::EmptyHost));

        let local = parse("http://[::1]/status").unwrap();
        assert_eq!(local.host, "[::1]");
        assert_eq!(local.port, 80);

        let ported = parse("https://[fe80::2]:8443").unwrap();
        assert_eq!(ported.host, "[fe80::2]");
        assert_eq!(ported.port, 8443);
        assert_eq!(ported.to_string(), "https://[fe80::2]:8443/");
    }

    #[test]
    fn query_is_kept_verbatim() {
        let url = parse("http://192.168.0.2/concourse?url=http://192.168.0.3:8080/x?y").unwrap();
        assert_eq!(url.host, "192.168.0.2");
        assert_eq!(url.path, "/concourse");
        assert_eq!(url.query.as_deref(), Some("url=http://192.168.0.3:8080/x?y"));
    }

    #[test]
    fn client_form_maps_scheme_to_secure_flag() {
        let cases = [
            ("http://a.example/x?q", false, 80),
            ("https://a.example/x?q", true, 443),
            ("http://a.example:8080/x?q", false, 8080),
            ("https://a.example:9443/x?q", true, 9443),
        ];

        for (raw, secure, port) in cases {
            let parsed = parse(raw).unwrap();
            let client = parsed.to_client_form();
            assert_eq!(client.secure, secure, "{raw}");
            assert_eq!(client.port, port, "{raw}");
            assert_eq!(client.host, parsed.host);
            assert_eq!(client.path, parsed.path);
            assert_eq!(client.query, parsed.query);
        }
    }

    #[test]
    fn display_rebuilds_url() {
        let url = parse("http://example.com:80/a?b=c").unwrap();
        assert_eq!(url.to_string(), "http://example.com/a?b=c");

        let client = parse("https://example.com:8443").unwrap().to_client_form();
        assert_eq!(client.to_string(), "https://example.com:8443/");
        assert!(!client.is_default_port());
        assert_eq!(client.request_target(), "/");
    }
}
