use crate::ConfigError;
use std::fmt;

/// Proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

impl ProxyScheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "socks5" => Some(Self::Socks5),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

/// A parsed proxy endpoint address
///
/// Accepted forms:
/// - `host:port`
/// - `user:pass@host:port`
/// - `scheme://[user:pass@]host:port` with scheme `http`, `https` or `socks5`
///
/// A missing scheme means `http`. The password never appears in `Display` or
/// `Debug` output.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProxyAddress {
    scheme: ProxyScheme,
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
}

impl ProxyAddress {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidProxy {
            address: redact(raw),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("address is empty"));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => (
                ProxyScheme::parse(scheme).ok_or_else(|| {
                    invalid(&format!(
                        "unsupported scheme '{}' (expected http, https or socks5)",
                        scheme
                    ))
                })?,
                rest,
            ),
            None => (ProxyScheme::Http, trimmed),
        };
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        if rest.contains('/') {
            return Err(invalid("address must not contain a path"));
        }

        let (credentials, host_port) = match rest.rsplit_once('@') {
            Some((auth, host_port)) => {
                let (user, pass) = auth
                    .split_once(':')
                    .ok_or_else(|| invalid("credentials must be user:pass"))?;
                if user.is_empty() {
                    return Err(invalid("username is empty"));
                }
                (Some((user.to_string(), pass.to_string())), host_port)
            }
            None => (None, rest),
        };

        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| invalid("port must be a number between 1 and 65535"))?;

        Ok(Self {
            scheme,
            host: host.to_lowercase(),
            port,
            credentials,
        })
    }

    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|(user, _)| user.as_str())
    }

    pub fn password(&self) -> Option<&str> {
        self.credentials.as_ref().map(|(_, pass)| pass.as_str())
    }

    /// Full URL including credentials, for handing to an HTTP client
    pub fn to_url(&self) -> String {
        match &self.credentials {
            Some((user, pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.scheme.as_str(),
                user,
                pass,
                self.host,
                self.port
            ),
            None => format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port),
        }
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.username() {
            Some(user) => write!(
                f,
                "{}://{}:***@{}:{}",
                self.scheme.as_str(),
                user,
                self.host,
                self.port
            ),
            None => write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port),
        }
    }
}

impl fmt::Debug for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProxyAddress({})", self)
    }
}

/// Hides the password of an unparsed address for error messages
fn redact(raw: &str) -> String {
    let raw = raw.trim();
    let (prefix, rest) = match raw.split_once("://") {
        Some((scheme, rest)) => (format!("{}://", scheme), rest),
        None => (String::new(), raw),
    };
    match rest.rsplit_once('@') {
        Some((auth, host)) => {
            let user = auth.split(':').next().unwrap_or_default();
            format!("{}{}:***@{}", prefix, user, host)
        }
        None => raw.to_string(),
    }
}
