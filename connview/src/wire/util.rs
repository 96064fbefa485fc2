//! Session addresses
//!
//! A session address has the form `tcp://host[:port]`; `tcp4://` and
//! `tcp6://` force an address family should the default resolution pick
//! the wrong one. Dashboards are usually handed their address through the
//! `socketURL` query parameter of the page they were opened with, see
//! `socket_url_from_query`.

use std::env;
use std::net::{SocketAddr, ToSocketAddrs};

/// Default TCP port of the capture backend.
pub const DEFAULT_PORT: u16 = 1337;

/// Name of the query parameter carrying the session address.
pub const SOCKET_URL_PARAM: &str = "socketURL";

/// Environment variable overriding the default session address.
pub const SOCKET_URL_ENV: &str = "CONNVIEW_SOCKET_URL";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AddressError {
    #[error("unsupported address scheme in {0:?} (expected tcp://, tcp4:// or tcp6://)")]
    UnsupportedScheme(String),
    #[error("could not resolve {0:?}")]
    Unresolved(String),
}

pub fn default_socket_url() -> String {
    match env::var(SOCKET_URL_ENV) {
        Ok(url) if !url.trim().is_empty() => url,
        _ => format!("tcp://localhost:{DEFAULT_PORT}"),
    }
}

/// Extracts the `socketURL` parameter from a page URL such as
/// `http://localhost:5173/?socketURL=tcp%3A%2F%2Flocalhost%3A1337`.
pub fn socket_url_from_query(page_url: &str) -> Option<String> {
    let page = url::Url::parse(page_url.trim()).ok()?;
    let found = page
        .query_pairs()
        .find(|(key, value)| *key == SOCKET_URL_PARAM && !value.is_empty())
        .map(|(_, value)| value.into_owned());
    found
}

/// Accepts either a session address or a page URL carrying one.
pub fn session_address(input: &str) -> String {
    socket_url_from_query(input).unwrap_or_else(|| input.trim().to_string())
}

enum AddrFamilyRestrict {
    V4,
    V6,
    Either,
}

/// Resolve `host[:port]`, appending the default port when it is missing.
fn find_addr(addr: &str, family: AddrFamilyRestrict) -> Result<SocketAddr, AddressError> {
    let addr = addr.trim_end_matches('/');
    let candidates = addr
        .to_socket_addrs()
        .or_else(|_| format!("{addr}:{DEFAULT_PORT}").to_socket_addrs())
        .or_else(|_| format!("[{addr}]:{DEFAULT_PORT}").to_socket_addrs())
        .map_err(|_| AddressError::Unresolved(addr.to_string()))?;
    for sa in candidates {
        match (&family, sa) {
            (AddrFamilyRestrict::V4, SocketAddr::V6(_)) => continue,
            (AddrFamilyRestrict::V6, SocketAddr::V4(_)) => continue,
            _ => return Ok(sa),
        }
    }
    Err(AddressError::Unresolved(addr.to_string()))
}

/// Resolves a session address to a socket address. This is done on every
/// connection attempt, so a host that moves is followed across reconnects.
pub fn resolve(url: &str) -> Result<SocketAddr, AddressError> {
    let split_url: Vec<&str> = url.trim().splitn(2, "://").collect();
    match split_url[..] {
        ["tcp", addr] => find_addr(addr, AddrFamilyRestrict::Either),
        ["tcp4", addr] => find_addr(addr, AddrFamilyRestrict::V4),
        ["tcp6", addr] => find_addr(addr, AddrFamilyRestrict::V6),
        [addr] => find_addr(addr, AddrFamilyRestrict::Either),
        _ => Err(AddressError::UnsupportedScheme(url.to_string())),
    }
}

/// Checks the scheme of an address without resolving it.
pub fn validate(url: &str) -> Result<(), AddressError> {
    let scheme = url.trim().split_once("://").map(|(s, _)| s);
    match scheme {
        None | Some("tcp") | Some("tcp4") | Some("tcp6") => Ok(()),
        Some(_) => Err(AddressError::UnsupportedScheme(url.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_is_taken_from_query() {
        assert_eq!(
            socket_url_from_query("http://localhost:5173/?socketURL=tcp%3A%2F%2F127.0.0.1%3A9000"),
            Some("tcp://127.0.0.1:9000".to_string())
        );
        assert_eq!(
            socket_url_from_query("http://x/?a=1&socketURL=tcp://h:1#frag"),
            Some("tcp://h:1".to_string())
        );
        assert_eq!(socket_url_from_query("http://x/?a=1"), None);
        assert_eq!(socket_url_from_query("tcp://localhost"), None);
    }

    #[test]
    fn encoded_separators_stay_inside_the_value() {
        assert_eq!(
            socket_url_from_query("http://x/?socketURL=tcp%3A%2F%2Fh%3A1%2F%3Fa%3D1%26b%3D2&c=3"),
            Some("tcp://h:1/?a=1&b=2".to_string())
        );
        assert_eq!(socket_url_from_query("http://x/?socketURL=&socketURL=tcp://h:2"), Some("tcp://h:2".to_string()));
    }

    #[test]
    fn session_address_falls_back_to_input() {
        assert_eq!(session_address(" tcp://localhost:1 "), "tcp://localhost:1");
    }

    #[test]
    fn resolve_appends_default_port() {
        let addr = resolve("tcp://127.0.0.1").unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);
        let addr = resolve("tcp4://127.0.0.1:42").unwrap();
        assert_eq!(addr.port(), 42);
        assert!(matches!(
            resolve("ws://localhost:1337"),
            Err(AddressError::UnsupportedScheme(_))
        ));
        assert!(validate("ws://localhost").is_err());
        assert!(validate("tcp://localhost").is_ok());
    }
}
