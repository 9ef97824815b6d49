//! Address string helpers.
//!
//! Addresses take the form `interface[:port]`, optionally prefixed with a
//! protocol tag such as `tcp://`.

use std::fmt;

const PROTOCOL_SEPARATOR: &str = "://";

/// Transport family used to pick a protocol prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceType {
    /// Stream sockets.
    Tcp,
    /// Datagram sockets.
    Udp,
    /// Generic IP; rendered as TCP.
    Ip,
    /// Inter-process endpoints.
    Ipc,
    /// In-process endpoints.
    Inproc,
}

impl InterfaceType {
    /// Protocol prefix including the separator.
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Tcp | Self::Ip => "tcp://",
            Self::Udp => "udp://",
            Self::Ipc => "ipc://",
            Self::Inproc => "inproc://",
        }
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Ip => write!(f, "ip"),
            Self::Ipc => write!(f, "ipc"),
            Self::Inproc => write!(f, "inproc"),
        }
    }
}

/// Joins an interface and a port; port 0 leaves the interface untouched.
pub fn make_port_address(interface: &str, port: u16) -> String {
    if port == 0 {
        interface.to_string()
    } else {
        format!("{interface}:{port}")
    }
}

/// Splits on the last colon and parses the port.
///
/// The port is `-1` (and the address is returned whole) when there is no
/// colon, nothing after it, a `/` right after it, or no leading number.
pub fn extract_interface_and_port(address: &str) -> (String, i32) {
    let Some(colon) = address.rfind(':') else {
        return (address.to_string(), -1);
    };
    let rest = &address[colon + 1..];
    if rest.is_empty() || rest.starts_with('/') {
        return (address.to_string(), -1);
    }
    match parse_leading_int(rest) {
        Some(port) => (address[..colon].to_string(), port),
        None => (address.to_string(), -1),
    }
}

/// Splits on the last colon, keeping the port text as written.
pub fn extract_interface_and_port_string(address: &str) -> (String, String) {
    match address.rfind(':') {
        Some(colon) => (
            address[..colon].to_string(),
            address[colon + 1..].to_string(),
        ),
        None => (address.to_string(), String::new()),
    }
}

fn parse_leading_int(text: &str) -> Option<i32> {
    let trimmed = text.trim_start();
    let sign_len = usize::from(trimmed.starts_with(['+', '-']));
    let digits = trimmed[sign_len..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    trimmed[..sign_len + digits].parse().ok()
}

/// Returns the address without its `proto://` prefix.
pub fn strip_protocol(address: &str) -> String {
    match address.find(PROTOCOL_SEPARATOR) {
        Some(loc) => address[loc + PROTOCOL_SEPARATOR.len()..].to_string(),
        None => address.to_string(),
    }
}

/// Removes a `proto://` prefix in place.
pub fn remove_protocol(address: &mut String) {
    if let Some(loc) = address.find(PROTOCOL_SEPARATOR) {
        address.drain(..loc + PROTOCOL_SEPARATOR.len());
    }
}

/// Prefixes the protocol for `interface` unless one is already present.
pub fn add_protocol(address: &str, interface: InterfaceType) -> String {
    if address.contains(PROTOCOL_SEPARATOR) {
        address.to_string()
    } else {
        format!("{}{}", interface.prefix(), address)
    }
}

/// In-place variant of [`add_protocol`].
pub fn insert_protocol(address: &mut String, interface: InterfaceType) {
    if !address.contains(PROTOCOL_SEPARATOR) {
        address.insert_str(0, interface.prefix());
    }
}

/// Heuristic IPv6 detection: more than two colons, a `[`, or a leading `::`.
pub fn is_ipv6(address: &str) -> bool {
    address.matches(':').count() > 2 || address.contains('[') || address.starts_with("::")
}

const WELL_KNOWN_SERVICES: &[(&str, u16)] = &[
    ("ftp", 21),
    ("ssh", 22),
    ("telnet", 23),
    ("smtp", 25),
    ("domain", 53),
    ("http", 80),
    ("www", 80),
    ("pop3", 110),
    ("ntp", 123),
    ("imap", 143),
    ("ldap", 389),
    ("https", 443),
    ("submission", 587),
    ("ldaps", 636),
    ("imaps", 993),
    ("pop3s", 995),
    ("mysql", 3306),
    ("postgresql", 5432),
    ("amqp", 5672),
    ("redis", 6379),
    ("http-alt", 8080),
];

/// Port for a service string: a decimal port or a well-known service name.
pub fn service_port(service: &str) -> Option<u16> {
    let service = service.trim();
    if let Ok(port) = service.parse() {
        return Some(port);
    }
    WELL_KNOWN_SERVICES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(service))
        .map(|&(_, port)| port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ALL_TYPES: [InterfaceType; 5] = [
        InterfaceType::Tcp,
        InterfaceType::Udp,
        InterfaceType::Ip,
        InterfaceType::Ipc,
        InterfaceType::Inproc,
    ];

    #[test]
    fn test_is_ipv6() {
        assert!(is_ipv6("::1"));
        assert!(is_ipv6("FEDC:BA98:7654:3210:FEDC:BA98:7654:3210"));
        assert!(is_ipv6("http://[1080::8:800:200C:417A]/foo"));
        assert!(!is_ipv6("192.9.5.5"));
        assert!(!is_ipv6("tcp://192.9.5.5:80"));
    }

    #[test]
    fn test_protocol_round_trip() {
        let addresses = ["127.0.0.1:23405", "localhost", "*:80", "", "[::1]:5000"];
        for addr in addresses {
            for interface in ALL_TYPES {
                let mut with = add_protocol(addr, interface);
                assert_eq!(strip_protocol(&with), addr);
                remove_protocol(&mut with);
                assert_eq!(with, addr);
            }
        }
    }

    #[test]
    fn test_add_protocol_prefixes() {
        assert_eq!(add_protocol("host", InterfaceType::Ip), "tcp://host");
        assert_eq!(add_protocol("host", InterfaceType::Udp), "udp://host");
        assert_eq!(add_protocol("host", InterfaceType::Inproc), "inproc://host");
        assert_eq!(add_protocol("ipc://pipe", InterfaceType::Tcp), "ipc://pipe");

        let mut addr = String::from("pipe");
        insert_protocol(&mut addr, InterfaceType::Ipc);
        assert_eq!(addr, "ipc://pipe");
        insert_protocol(&mut addr, InterfaceType::Tcp);
        assert_eq!(addr, "ipc://pipe");
    }

    #[test]
    fn test_extract_interface_and_port() {
        assert_eq!(
            extract_interface_and_port("127.0.0.1:23405"),
            ("127.0.0.1".to_string(), 23405)
        );
        assert_eq!(
            extract_interface_and_port("localhost"),
            ("localhost".to_string(), -1)
        );
        assert_eq!(
            extract_interface_and_port("tcp://127.0.0.1"),
            ("tcp://127.0.0.1".to_string(), -1)
        );
        assert_eq!(
            extract_interface_and_port("host:abc"),
            ("host:abc".to_string(), -1)
        );
        assert_eq!(
            extract_interface_and_port("tcp://host:80/path"),
            ("tcp://host".to_string(), 80)
        );
        assert_eq!(extract_interface_and_port("host:"), ("host:".to_string(), -1));
    }

    #[test]
    fn test_extract_interface_and_port_string() {
        assert_eq!(
            extract_interface_and_port_string("tcp://127.0.0.1:http"),
            ("tcp://127.0.0.1".to_string(), "http".to_string())
        );
        assert_eq!(
            extract_interface_and_port_string("localhost"),
            ("localhost".to_string(), String::new())
        );
    }

    #[test]
    fn test_make_port_address() {
        assert_eq!(make_port_address("127.0.0.1", 5000), "127.0.0.1:5000");
        assert_eq!(make_port_address("127.0.0.1", 0), "127.0.0.1");
    }

    #[test]
    fn test_service_port() {
        assert_eq!(service_port("8443"), Some(8443));
        assert_eq!(service_port(" 0 "), Some(0));
        assert_eq!(service_port("http"), Some(80));
        assert_eq!(service_port("HTTPS"), Some(443));
        assert_eq!(service_port("http-alt"), Some(8080));
        assert_eq!(service_port("70000"), None);
        assert_eq!(service_port("no-such-service"), None);
        assert_eq!(service_port(""), None);
    }
}
