//! IP-ban pattern matching and DNSBL lookups.
//!
//! The ban store itself (the `ipbanlist` table) lives in
//! [`crate::servers::login::account`]; this module is the pure,
//! DB-free logic for turning an address into its four wildcard
//! candidates and for running a DNSBL probe.

use std::net::Ipv4Addr;

/// The four wildcard patterns a ban record could match against `ip`,
/// most specific first: `a.b.c.d`, `a.b.c.*`, `a.b.*.*`, `a.*.*.*`.
pub fn candidate_patterns(ip: Ipv4Addr) -> [String; 4] {
    let [a, b, c, d] = ip.octets();
    [
        format!("{a}.{b}.{c}.{d}"),
        format!("{a}.{b}.{c}.*"),
        format!("{a}.{b}.*.*"),
        format!("{a}.*.*.*"),
    ]
}

/// The `/24` wildcard pattern used for dynamic ban insertion.
pub fn prefix24_pattern(ip: Ipv4Addr) -> String {
    let [a, b, c, _] = ip.octets();
    format!("{a}.{b}.{c}.*")
}

/// Returns true if `pattern` (one of `a.b.c.d`, `a.b.c.*`, `a.b.*.*`,
/// `a.*.*.*`) matches `ip`. A malformed pattern never matches.
pub fn pattern_matches(pattern: &str, ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    let parts: Vec<&str> = pattern.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    for (part, octet) in parts.iter().zip(octets.iter()) {
        if *part == "*" {
            continue;
        }
        match part.parse::<u8>() {
            Ok(v) if v == *octet => continue,
            _ => return false,
        }
    }
    true
}

/// Builds the reversed-octet DNSBL query hostname for `ip` against
/// `suffix`, e.g. `1.2.3.4` + `dnsbl.example.com` → `4.3.2.1.dnsbl.example.com`.
pub fn dnsbl_hostname(ip: Ipv4Addr, suffix: &str) -> String {
    let [a, b, c, d] = ip.octets();
    format!("{d}.{c}.{b}.{a}.{suffix}")
}

/// Probes each configured DNSBL suffix for `ip`; a hit is a successful
/// name resolution for any concatenation. Resolution failure for a
/// given suffix is treated as "not listed" for that suffix (only an
/// affirmative A-record answer counts as a hit); the caller decides
/// the fail-closed/fail-open policy for the overall gate.
pub async fn dnsbl_hit(ip: Ipv4Addr, suffixes: &[String]) -> bool {
    for suffix in suffixes {
        let host = dnsbl_hostname(ip, suffix);
        if tokio::net::lookup_host((host.as_str(), 0)).await.is_ok() {
            return true;
        }
    }
    false
}
