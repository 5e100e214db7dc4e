use super::Error;
use std::net::{IpAddr, SocketAddr};

/// Resolve the configured `source` to a bindable local address. Accepts a
/// literal IPv4/IPv6 address or an interface name; interfaces resolve
/// through the system table with IPv4 preferred.
pub fn resolve_source(source: &str) -> Result<IpAddr, Error> {
    if let Ok(ip) = source.parse::<IpAddr>() {
        return Ok(ip);
    }
    interface_ip(source)
}

fn interface_ip(interface: &str) -> Result<IpAddr, Error> {
    let addrs = if_addrs::get_if_addrs()?;

    for addr in &addrs {
        if addr.name == interface {
            if let if_addrs::IfAddr::V4(v4) = &addr.addr {
                return Ok(IpAddr::V4(v4.ip));
            }
        }
    }
    for addr in &addrs {
        if addr.name == interface {
            if let if_addrs::IfAddr::V6(v6) = &addr.addr {
                return Ok(IpAddr::V6(v6.ip));
            }
        }
    }

    Err(Error::InvalidSource(format!(
        "interface {interface} not found or has no address assigned"
    )))
}

/// The socket-level form of a source address: any free port.
pub fn local_socket_addr(ip: IpAddr) -> SocketAddr {
    SocketAddr::new(ip, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_addresses_parse() {
        assert_eq!(
            resolve_source("192.168.10.2").unwrap(),
            "192.168.10.2".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            resolve_source("::1").unwrap(),
            "::1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn unknown_interface_is_rejected() {
        let err = resolve_source("definitely-not-a-nic0").unwrap_err();
        assert!(matches!(err, Error::InvalidSource(_)));
    }

    #[test]
    fn local_socket_addr_uses_ephemeral_port() {
        let addr = local_socket_addr("127.0.0.1".parse().unwrap());
        assert_eq!(addr.port(), 0);
    }
}
