//! Target address model shared by the dialer, pool, and listener.

use std::{
    fmt,
    hash::{Hash, Hasher},
    net::IpAddr,
    str::FromStr,
};

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Characters that are never valid in a hostname and indicate either a typo
/// or an attempted shell injection through a user-supplied target string.
const FORBIDDEN_HOST_CHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '>', '<', '(', ')', '{', '}', '"', '\'', '\\', ' ', '\t',
];

const MAX_HOST_LENGTH: usize = 253;

/// The address family of a target or bound socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
    /// Not yet determined; resolution decides.
    Unspec,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::V4 => write!(fmt, "ipv4"),
            Self::V6 => write!(fmt, "ipv6"),
            Self::Unspec => write!(fmt, "unspec"),
        }
    }
}

/// A `host:port` target. The host may be a hostname, an IPv4 literal, or a
/// bracketed IPv6 literal (`[::1]:9000`); parsing an IP literal fixes the
/// family, otherwise it stays [`AddressFamily::Unspec`] until resolution.
#[derive(Clone, Debug, Eq)]
pub struct Address {
    /// The hostname or IP literal, without brackets.
    pub host: String,

    /// The TCP port.
    pub port: u16,

    /// The address family, when known.
    pub family: AddressFamily,
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Hash for Address {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl FromStr for Address {
    type Err = Error;
    fn from_str(address: &str) -> Result<Self> {
        Address::parse(address)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str())
            .map_err(|e| <D::Error as serde::de::Error>::custom(format!("{}", e)))
    }
}

impl Address {
    /// Parses a `host:port` string into an `Address`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();

        // Bracketed IPv6 literal, e.g. "[::1]:9000".
        if let Some(rest) = address.strip_prefix('[') {
            let (host, port) = match rest.split_once(']') {
                Some((host, port)) => (host, port),
                None => {
                    return Err(Error::validation(format!(
                        "invalid address \"{}\": unterminated '['",
                        address
                    )))
                }
            };
            let ip: IpAddr = host.parse().map_err(|_| {
                Error::validation(format!(
                    "invalid address \"{}\": \"{}\" is not an IPv6 literal",
                    address, host
                ))
            })?;
            if !ip.is_ipv6() {
                return Err(Error::validation(format!(
                    "invalid address \"{}\": bracketed host must be IPv6",
                    address
                )));
            }
            let port = match port.strip_prefix(':') {
                Some(port) => parse_port(address, port)?,
                None => {
                    return Err(Error::validation(format!(
                        "invalid address \"{}\": missing port",
                        address
                    )))
                }
            };
            return Ok(Self {
                host: host.to_string(),
                port,
                family: AddressFamily::V6,
            });
        }

        let (host, port) = match address.rsplit_once(':') {
            Some(parts) => parts,
            None => {
                return Err(Error::validation(format!(
                    "invalid address \"{}\": expected host:port",
                    address
                )))
            }
        };

        if host.contains(':') {
            return Err(Error::validation(format!(
                "invalid address \"{}\": IPv6 literals must be bracketed",
                address
            )));
        }

        validate_host(host)?;
        let port = parse_port(address, port)?;

        let family = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => AddressFamily::V4,
            Ok(IpAddr::V6(_)) => AddressFamily::V6,
            Err(_) => AddressFamily::Unspec,
        };

        Ok(Self {
            host: host.to_lowercase(),
            port,
            family,
        })
    }

    /// The IP literal this address carries, if its host is one.
    pub(crate) fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(fmt, "[{}]:{}", self.host, self.port)
        } else {
            write!(fmt, "{}:{}", self.host, self.port)
        }
    }
}

/// Validates a hostname per the rules the retrying dialer enforces before
/// any I/O: nonempty, bounded length, no control characters, no shell
/// metacharacters.
pub(crate) fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(Error::validation("hostname cannot be empty"));
    }
    if host.len() > MAX_HOST_LENGTH {
        return Err(Error::validation(format!(
            "hostname exceeds {} characters",
            MAX_HOST_LENGTH
        )));
    }
    if host.chars().any(|c| c.is_control()) {
        return Err(Error::validation(
            "hostname contains control characters".to_string(),
        ));
    }
    if let Some(c) = host.chars().find(|c| FORBIDDEN_HOST_CHARACTERS.contains(c)) {
        return Err(Error::validation(format!(
            "hostname contains forbidden character {:?}",
            c
        )));
    }
    Ok(())
}

fn parse_port(address: &str, port: &str) -> Result<u16> {
    let port = u16::from_str(port).map_err(|_| {
        Error::validation(format!(
            "invalid address \"{}\": port must be a 16-bit unsigned integer, got \"{}\"",
            address, port
        ))
    })?;
    if port == 0 {
        return Err(Error::validation(format!(
            "invalid address \"{}\": port must be non-zero",
            address
        )));
    }
    Ok(port)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{Address, AddressFamily};

    #[test]
    fn parses_hostname_and_port() {
        let addr = Address::parse("Example.test:8080").unwrap();
        assert_eq!(addr.host, "example.test");
        assert_eq!(addr.port, 8080);
        assert_eq!(addr.family, AddressFamily::Unspec);
        assert_eq!(addr.to_string(), "example.test:8080");
    }

    #[test]
    fn parses_ip_literals() {
        let v4 = Address::parse("203.0.113.5:80").unwrap();
        assert_eq!(v4.family, AddressFamily::V4);

        let v6 = Address::parse("[2001:db8::1]:443").unwrap();
        assert_eq!(v6.family, AddressFamily::V6);
        assert_eq!(v6.host, "2001:db8::1");
        assert_eq!(v6.to_string(), "[2001:db8::1]:443");
    }

    #[test]
    fn rejects_malformed_addresses() {
        for case in [
            "",
            "host",
            ":80",
            "host:0",
            "host:notaport",
            "host:70000",
            "[::1:9000",
            "::1:9000",
            "host;rm -rf:80",
            "host\n:80",
        ] {
            assert!(Address::parse(case).is_err(), "expected error for {:?}", case);
        }
    }

    #[test]
    fn deserializes_from_string_form() {
        let addr: Address = serde_json::from_str("\"localhost:4444\"").unwrap();
        assert_eq!(addr.host, "localhost");
        assert_eq!(addr.port, 4444);
    }
}
