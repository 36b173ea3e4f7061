use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("malformed client address")]
pub struct MalformedAddress;

/// Zero the least-significant bits of an IP address so the stored
/// value can no longer identify a single client.
///
/// IPv4 loses the bottom 8 bits, IPv6 the bottom 80. The result is
/// the canonical textual form; IPv6 comes back fully expanded with
/// zero-padded groups so stored addresses compare byte-for-byte.
pub fn anonymize_ip(ip: &str) -> Result<String, MalformedAddress> {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => {
            let masked = Ipv4Addr::from(u32::from(addr) & !0xff);
            Ok(masked.to_string())
        }
        Ok(IpAddr::V6(addr)) => {
            let masked = Ipv6Addr::from((u128::from(addr) >> 80) << 80);
            Ok(explode_ipv6(masked))
        }
        Err(_) => Err(MalformedAddress),
    }
}

fn explode_ipv6(addr: Ipv6Addr) -> String {
    let groups: Vec<String> = addr
        .segments()
        .iter()
        .map(|group| format!("{group:04x}"))
        .collect();

    groups.join(":")
}

#[cfg(test)]
mod tests {
    use super::{anonymize_ip, MalformedAddress};

    #[test]
    fn test_ipv4() {
        assert_eq!(anonymize_ip("241.129.42.29").unwrap(), "241.129.42.0");
    }

    #[test]
    fn test_ipv6() {
        assert_eq!(
            anonymize_ip("FE80:0000:fFFF:0000:0202:B3FF:FE1E:8329").unwrap(),
            "fe80:0000:ffff:0000:0000:0000:0000:0000"
        );
    }

    #[test]
    fn test_ipv6_compressed_input() {
        assert_eq!(
            anonymize_ip("::1").unwrap(),
            "0000:0000:0000:0000:0000:0000:0000:0000"
        );
    }

    #[test]
    fn test_already_anonymous() {
        assert_eq!(anonymize_ip("10.0.0.0").unwrap(), "10.0.0.0");
    }

    #[test]
    fn test_malformed() {
        assert_eq!(anonymize_ip("not-an-ip"), Err(MalformedAddress));
        assert_eq!(anonymize_ip(""), Err(MalformedAddress));
        assert_eq!(anonymize_ip("300.1.2.3"), Err(MalformedAddress));
    }
}
