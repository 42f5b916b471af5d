//! Hostmask cloaking.
//!
//! Deterministic, keyed rewriting of real hosts and IPs into displayed
//! hosts. HMAC-SHA256 under a server-wide secret; each use case gets its
//! own domain-separation label so an IP cloak can never collide with a
//! hostname cloak for related input.
//!
//! Formats, with suffix `X`:
//!
//! - IPv4 `a.b.c.d` → `a.b.H1.H2.X` — the /16 prefix stays visible for
//!   abuse handling, the low octets are replaced by two keyed segments.
//! - IPv6 → `H1:H2:X`.
//! - Hostname → `H.<registrable-domain>` where the registrable suffix is
//!   the last two labels (three for known multi-label TLDs).
//! - Account cloak → `<account>.X`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::IpAddr;

type HmacSha256 = Hmac<Sha256>;

/// Second-level domains that function as TLDs, so `host.example.co.uk`
/// keeps `example.co.uk` rather than `co.uk`.
const MULTI_LABEL_TLDS: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "com.au", "net.au", "org.au", "co.nz", "co.jp",
    "com.br", "com.mx",
];

/// Keyed host/IP cloaker. Cheap to clone-free share behind the graph.
pub struct Cloaker {
    secret: String,
    suffix: String,
}

impl Cloaker {
    pub fn new(secret: &str, suffix: &str) -> Self {
        Self {
            secret: secret.to_string(),
            suffix: suffix.to_string(),
        }
    }

    fn digest_hex(&self, label: &str, input: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any size");
        mac.update(label.as_bytes());
        mac.update(input.as_bytes());
        let bytes = mac.finalize().into_bytes();
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Cloak whatever identifies the connection best: a parseable IP gets
    /// the IP construction, anything else the hostname construction.
    pub fn cloak_host(&self, host: &str) -> String {
        match host.parse::<IpAddr>() {
            Ok(ip) => self.cloak_ip(&ip),
            Err(_) => self.cloak_hostname(host),
        }
    }

    pub fn cloak_ip(&self, ip: &IpAddr) -> String {
        let text = ip.to_string();
        let h1 = &self.digest_hex("ip4-last2", &text)[..6];
        let h2 = &self.digest_hex("ip4-full", &text)[..6];
        match ip {
            IpAddr::V4(v4) => {
                let [a, b, _, _] = v4.octets();
                format!("{}.{}.{}.{}.{}", a, b, h1, h2, self.suffix)
            }
            IpAddr::V6(_) => format!("{}:{}:{}", h1, h2, self.suffix),
        }
    }

    pub fn cloak_hostname(&self, host: &str) -> String {
        let prefix = &self.digest_hex("host", host)[..8];
        match registrable_suffix(host) {
            Some(suffix) => format!("{}.{}", prefix, suffix),
            None => format!("{}.{}", prefix, self.suffix),
        }
    }

    /// Account-based cloak for identified users.
    pub fn cloak_account(&self, account: &str) -> String {
        format!("{}.{}", account, self.suffix)
    }
}

/// The registrable-domain suffix of a hostname: the last two labels, or
/// three when the trailing two form a known multi-label TLD. `None` when
/// the host has no dot (nothing worth preserving).
fn registrable_suffix(host: &str) -> Option<&str> {
    let labels: Vec<usize> = host
        .char_indices()
        .filter(|(_, c)| *c == '.')
        .map(|(i, _)| i)
        .collect();
    if labels.is_empty() {
        return None;
    }
    let keep = if MULTI_LABEL_TLDS
        .iter()
        .any(|tld| host.ends_with(tld) && host.len() > tld.len())
    {
        3
    } else {
        2
    };
    if labels.len() < keep {
        // The whole host is already just the registrable domain.
        return Some(host);
    }
    let cut = labels[labels.len() - keep];
    Some(&host[cut + 1..])
}

/// Whether a configured cloak secret is too weak to ship.
pub fn is_weak_secret(secret: &str) -> bool {
    secret.len() < 16 || secret.contains("changeme") || secret.contains("default")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloaker() -> Cloaker {
        Cloaker::new("unit-test-secret-0123456789", "lattice")
    }

    #[test]
    fn ipv4_keeps_prefix_and_is_deterministic() {
        let c = cloaker();
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let cloak = c.cloak_ip(&ip);
        assert!(cloak.starts_with("203.0."));
        assert!(cloak.ends_with(".lattice"));
        assert_eq!(cloak, c.cloak_ip(&ip));
        assert_eq!(cloak.split('.').count(), 5);
    }

    #[test]
    fn different_ips_diverge() {
        let c = cloaker();
        let a: IpAddr = "203.0.113.7".parse().unwrap();
        let b: IpAddr = "203.0.113.8".parse().unwrap();
        assert_ne!(c.cloak_ip(&a), c.cloak_ip(&b));
    }

    #[test]
    fn different_secrets_diverge() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let a = Cloaker::new("secret-one-0123456789", "x").cloak_ip(&ip);
        let b = Cloaker::new("secret-two-0123456789", "x").cloak_ip(&ip);
        assert_ne!(a, b);
    }

    #[test]
    fn ipv6_format() {
        let c = cloaker();
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let cloak = c.cloak_ip(&ip);
        assert!(cloak.ends_with(":lattice"));
        assert_eq!(cloak.split(':').count(), 3);
    }

    #[test]
    fn hostname_preserves_registrable_domain() {
        let c = cloaker();
        let cloak = c.cloak_hostname("dsl-7.customer.isp.example");
        assert!(cloak.ends_with(".isp.example"));
        let prefix = cloak.split('.').next().unwrap();
        assert_eq!(prefix.len(), 8);
        assert!(prefix.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn hostname_multi_label_tld() {
        let c = cloaker();
        let cloak = c.cloak_hostname("box.example.co.uk");
        assert!(cloak.ends_with(".example.co.uk"));
    }

    #[test]
    fn bare_hostname_gets_suffix() {
        let c = cloaker();
        let cloak = c.cloak_hostname("localhost");
        assert!(cloak.ends_with(".lattice"));
    }

    #[test]
    fn account_cloak() {
        assert_eq!(cloaker().cloak_account("alice"), "alice.lattice");
    }

    #[test]
    fn weak_secrets_flagged() {
        assert!(is_weak_secret(""));
        assert!(is_weak_secret("short"));
        assert!(is_weak_secret("changeme-changeme"));
        assert!(!is_weak_secret("a-perfectly-strong-secret-value"));
    }
}
