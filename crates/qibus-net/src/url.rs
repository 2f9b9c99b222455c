//! Minimal URL handling for transport addresses.
//!
//! Addresses are `scheme://rest`; for socket schemes `rest` is
//! `host:port`, for filesystem schemes it is an absolute path.

use crate::errors::NetError;

/// Split `scheme://rest`.
pub(crate) fn split(addr: &str) -> Result<(&str, &str), NetError> {
    addr.split_once("://").ok_or_else(|| NetError::InvalidUrl(addr.to_string()))
}

/// The host part of a `host:port` pair.
///
/// IPv6 literals keep their brackets stripped: `[::1]:80` yields `::1`.
pub(crate) fn host(host_port: &str) -> &str {
    if let Some(rest) = host_port.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }
    host_port.rsplit_once(':').map_or(host_port, |(host, _)| host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_scheme() {
        assert_eq!(split("tcp://10.0.0.1:9559").unwrap(), ("tcp", "10.0.0.1:9559"));
        assert_eq!(split("unix:///tmp/qi.sock").unwrap(), ("unix", "/tmp/qi.sock"));
        assert!(split("not-a-url").is_err());
    }

    #[test]
    fn extracts_host() {
        assert_eq!(host("10.0.0.1:9559"), "10.0.0.1");
        assert_eq!(host("localhost:80"), "localhost");
        assert_eq!(host("[::1]:80"), "::1");
        assert_eq!(host("nohost"), "nohost");
    }
}
