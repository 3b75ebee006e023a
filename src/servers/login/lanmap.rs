//! Resolves a client peer address to its char-server-facing LAN address.

use crate::config::LanSubnet;
use std::net::Ipv4Addr;

pub struct LanMap {
    subnets: Vec<LanSubnet>,
}

impl LanMap {
    pub fn new(subnets: Vec<LanSubnet>) -> Self {
        LanMap { subnets }
    }

    /// Returns the char-server-facing IP for `peer`, if it falls within
    /// one of the configured subnets; the first matching row wins.
    pub fn rewrite_char_ip(&self, peer: Ipv4Addr) -> Option<Ipv4Addr> {
        let peer_bits = u32::from(peer);
        self.subnets.iter().find_map(|s| {
            let mask = u32::from(s.mask);
            if peer_bits & mask == u32::from(s.char_ip) & mask {
                Some(s.char_ip)
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(mask: &str, char_ip: &str, map_ip: &str) -> LanSubnet {
        LanSubnet {
            mask: mask.parse().unwrap(),
            char_ip: char_ip.parse().unwrap(),
            map_ip: map_ip.parse().unwrap(),
        }
    }

    #[test]
    fn matches_same_subnet_peer() {
        let lan = LanMap::new(vec![subnet("255.255.0.0", "192.168.1.10", "10.0.1.10")]);
        let peer: Ipv4Addr = "192.168.1.200".parse().unwrap();
        assert_eq!(lan.rewrite_char_ip(peer), Some("192.168.1.10".parse().unwrap()));
    }

    #[test]
    fn no_match_returns_none() {
        let lan = LanMap::new(vec![subnet("255.255.0.0", "192.168.1.10", "10.0.1.10")]);
        let peer: Ipv4Addr = "8.8.8.8".parse().unwrap();
        assert_eq!(lan.rewrite_char_ip(peer), None);
    }

    #[test]
    fn first_matching_row_wins() {
        let lan = LanMap::new(vec![
            subnet("255.255.0.0", "192.168.1.10", "10.0.1.10"),
            subnet("255.255.255.0", "192.168.1.99", "10.0.1.99"),
        ]);
        let peer: Ipv4Addr = "192.168.1.200".parse().unwrap();
        assert_eq!(lan.rewrite_char_ip(peer), Some("192.168.1.10".parse().unwrap()));
    }
}
