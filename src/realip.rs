// src/realip.rs
//! Source address resolution.
//!
//! Two concerns: development remaps (rewrite a peer prefix to a fixed
//! address, so local testing can impersonate a public IP) and trusted
//! proxies (forwarded headers are honored only when the connection itself
//! comes from a configured proxy range). Rule sets are replaced wholesale
//! so readers always see one coherent snapshot.

use actix_web::HttpRequest;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use parking_lot::RwLock;
use std::net::IpAddr;
use std::str::FromStr;

use crate::utils::RequestError;

/// One `prefix=addr` development remap rule.
#[derive(Debug, Clone)]
pub struct MapRule {
    pub prefix: IpNetwork,
    pub to: IpAddr,
}

#[derive(Default)]
pub struct RealIpRules {
    trusted_proxies: RwLock<Vec<IpNetwork>>,
    dev_map: RwLock<Vec<MapRule>>,
}

impl RealIpRules {
    pub fn new(trusted_proxies: Vec<IpNetwork>, dev_map: Vec<MapRule>) -> Self {
        Self {
            trusted_proxies: RwLock::new(trusted_proxies),
            dev_map: RwLock::new(dev_map),
        }
    }

    pub fn replace_trusted_proxies(&self, networks: Vec<IpNetwork>) {
        *self.trusted_proxies.write() = networks;
    }

    pub fn replace_dev_map(&self, rules: Vec<MapRule>) {
        *self.dev_map.write() = rules;
    }

    fn map_peer(&self, peer: IpAddr) -> IpAddr {
        let rules = self.dev_map.read();
        for rule in rules.iter() {
            if rule.prefix.contains(peer) {
                return rule.to;
            }
        }
        peer
    }

    fn is_trusted(&self, peer: IpAddr) -> bool {
        let networks = self.trusted_proxies.read();
        networks.iter().any(|n| n.contains(peer))
    }

    /// Resolves the caller's address: peer address, through the dev remap,
    /// then forwarded headers when (and only when) the peer is a trusted
    /// proxy. A trusted proxy that forwards nothing is an error; it means
    /// the proxy chain is misconfigured, not that the proxy is the caller.
    pub fn client_ip(&self, req: &HttpRequest) -> Result<IpAddr, RequestError> {
        let peer = req
            .peer_addr()
            .map(|a| a.ip())
            .ok_or(RequestError::MissingPeerIp)?;
        let peer = self.map_peer(peer);
        if !self.is_trusted(peer) {
            return Ok(peer);
        }

        if let Some(forwarded) = req.headers().get("X-Forwarded-For") {
            let value = forwarded
                .to_str()
                .map_err(|_| RequestError::InvalidForwardedIp)?;
            let first = value
                .split(',')
                .next()
                .map(str::trim)
                .ok_or(RequestError::InvalidForwardedIp)?;
            return first
                .parse::<IpAddr>()
                .map_err(|_| RequestError::InvalidForwardedIp);
        }
        if let Some(real) = req.headers().get("X-Real-IP") {
            let value = real.to_str().map_err(|_| RequestError::InvalidForwardedIp)?;
            return value
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| RequestError::InvalidForwardedIp);
        }
        Err(RequestError::MissingForwardedIp)
    }
}

/// Parses a comma-separated CIDR list; bare addresses become host routes.
pub fn parse_networks(s: &str) -> Result<Vec<IpNetwork>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_network)
        .collect()
}

fn parse_network(part: &str) -> Result<IpNetwork, String> {
    if part.contains('/') {
        IpNetwork::from_str(part).map_err(|e| format!("invalid network {:?}: {}", part, e))
    } else {
        let addr: IpAddr = part
            .parse()
            .map_err(|e| format!("invalid address {:?}: {}", part, e))?;
        Ok(host_network(addr))
    }
}

fn host_network(addr: IpAddr) -> IpNetwork {
    match addr {
        IpAddr::V4(v4) => IpNetwork::V4(
            Ipv4Network::new(v4, 32).expect("/32 is always a valid IPv4 prefix"),
        ),
        IpAddr::V6(v6) => IpNetwork::V6(
            Ipv6Network::new(v6, 128).expect("/128 is always a valid IPv6 prefix"),
        ),
    }
}

/// Parses `prefix=addr` pairs separated by commas, e.g.
/// `127.0.0.0/8=203.0.113.7,10.1.2.3=203.0.113.8`.
pub fn parse_map_rules(s: &str) -> Result<Vec<MapRule>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (prefix, to) = part
                .split_once('=')
                .ok_or_else(|| format!("ip mapping {:?} is missing an equals sign", part))?;
            let prefix = parse_network(prefix.trim())?;
            let to: IpAddr = to
                .trim()
                .parse()
                .map_err(|e| format!("invalid mapped address in {:?}: {}", part, e))?;
            Ok(MapRule { prefix, to })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use std::net::SocketAddr;

    fn rules(trusted: &str, map: &str) -> RealIpRules {
        RealIpRules::new(parse_networks(trusted).unwrap(), parse_map_rules(map).unwrap())
    }

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn parses_networks_and_bare_addresses() {
        let nets = parse_networks("198.51.100.0/24, 203.0.113.7").unwrap();
        assert_eq!(nets.len(), 2);
        assert!(nets[0].contains("198.51.100.9".parse().unwrap()));
        assert!(nets[1].contains("203.0.113.7".parse().unwrap()));
        assert!(parse_networks("not-an-ip").is_err());
    }

    #[test]
    fn parses_map_rules_and_rejects_bad_ones() {
        let rules = parse_map_rules("127.0.0.0/8=203.0.113.7").unwrap();
        assert_eq!(rules.len(), 1);
        assert!(parse_map_rules("127.0.0.1").is_err());
        assert!(parse_map_rules("127.0.0.1=zzz").is_err());
    }

    #[test]
    fn untrusted_peer_is_used_directly() {
        let r = rules("", "");
        let req = TestRequest::default()
            .peer_addr(peer("198.51.100.9:40000"))
            .insert_header(("X-Forwarded-For", "203.0.113.50"))
            .to_http_request();
        // Header is ignored; nothing is trusted.
        assert_eq!(r.client_ip(&req).unwrap().to_string(), "198.51.100.9");
    }

    #[test]
    fn trusted_proxy_headers_are_honored() {
        let r = rules("198.51.100.0/24", "");
        let req = TestRequest::default()
            .peer_addr(peer("198.51.100.9:40000"))
            .insert_header(("X-Forwarded-For", "203.0.113.50, 198.51.100.9"))
            .to_http_request();
        assert_eq!(r.client_ip(&req).unwrap().to_string(), "203.0.113.50");

        let req = TestRequest::default()
            .peer_addr(peer("198.51.100.9:40000"))
            .insert_header(("X-Real-IP", "203.0.113.51"))
            .to_http_request();
        assert_eq!(r.client_ip(&req).unwrap().to_string(), "203.0.113.51");

        let req = TestRequest::default()
            .peer_addr(peer("198.51.100.9:40000"))
            .to_http_request();
        assert_eq!(
            r.client_ip(&req),
            Err(RequestError::MissingForwardedIp)
        );
    }

    #[test]
    fn dev_remap_applies_before_trust() {
        let r = rules("", "127.0.0.0/8=203.0.113.77");
        let req = TestRequest::default()
            .peer_addr(peer("127.0.0.1:40000"))
            .to_http_request();
        assert_eq!(r.client_ip(&req).unwrap().to_string(), "203.0.113.77");
    }

    #[test]
    fn rule_sets_swap_wholesale() {
        let r = rules("", "");
        let req = TestRequest::default()
            .peer_addr(peer("127.0.0.1:40000"))
            .to_http_request();
        assert_eq!(r.client_ip(&req).unwrap().to_string(), "127.0.0.1");
        r.replace_dev_map(parse_map_rules("127.0.0.0/8=203.0.113.77").unwrap());
        assert_eq!(r.client_ip(&req).unwrap().to_string(), "203.0.113.77");
    }
}
