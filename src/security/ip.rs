use crate::errors::AdmitError;
use serde::Deserialize;
use std::net::IpAddr;
use std::str::FromStr;

/// One allow-list entry: a single address or a CIDR network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRule {
    Addr(IpAddr),
    Network { base: IpAddr, prefix: u8 },
}

impl IpRule {
    pub fn matches(&self, ip: IpAddr) -> bool {
        match *self {
            IpRule::Addr(addr) => addr == ip,
            IpRule::Network { base, prefix } => match (base, ip) {
                (IpAddr::V4(base), IpAddr::V4(ip)) => {
                    let mask = mask_v4(prefix);
                    u32::from(base) & mask == u32::from(ip) & mask
                }
                (IpAddr::V6(base), IpAddr::V6(ip)) => {
                    let mask = mask_v6(prefix);
                    u128::from(base) & mask == u128::from(ip) & mask
                }
                _ => false,
            },
        }
    }
}

fn mask_v4(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

fn mask_v6(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - u32::from(p)),
    }
}

impl FromStr for IpRule {
    type Err = AdmitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |why: &str| AdmitError::ConfigurationInvalid(format!("whitelist entry '{}': {}", s, why));

        match s.split_once('/') {
            None => {
                let addr: IpAddr = s.parse().map_err(|_| invalid("not an IP address"))?;
                Ok(IpRule::Addr(addr.to_canonical()))
            }
            Some((base, prefix)) => {
                let base: IpAddr = base.parse().map_err(|_| invalid("not an IP network"))?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid("bad prefix length"))?;
                let max = if base.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(invalid("prefix length out of range"));
                }
                match (base, base.to_canonical()) {
                    // ::ffff:a.b.c.d/n is the IPv4 network a.b.c.d/(n - 96)
                    (IpAddr::V6(_), v4 @ IpAddr::V4(_)) => {
                        if prefix < 96 {
                            return Err(invalid("IPv4-mapped network needs a prefix of at least 96"));
                        }
                        Ok(IpRule::Network {
                            base: v4,
                            prefix: prefix - 96,
                        })
                    }
                    _ => Ok(IpRule::Network { base, prefix }),
                }
            }
        }
    }
}

/// Parsed whitelist. Source addresses that fail to parse never match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct IpAllowList {
    rules: Vec<IpRule>,
}

impl IpAllowList {
    pub fn new(rules: Vec<IpRule>) -> Self {
        Self { rules }
    }

    pub fn parse<I, S>(entries: I) -> Result<Self, AdmitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = entries
            .into_iter()
            .map(|entry| entry.as_ref().parse())
            .collect::<Result<Vec<IpRule>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn contains(&self, source_ip: &str) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        match source_ip.trim().parse::<IpAddr>() {
            Ok(ip) => {
                let ip = ip.to_canonical();
                self.rules.iter().any(|rule| rule.matches(ip))
            }
            Err(_) => false,
        }
    }
}

impl TryFrom<Vec<String>> for IpAllowList {
    type Error = AdmitError;

    fn try_from(entries: Vec<String>) -> Result<Self, Self::Error> {
        Self::parse(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let list = IpAllowList::parse(["10.1.2.3", "2001:db8::1"]).unwrap();
        assert!(list.contains("10.1.2.3"));
        assert!(list.contains("2001:db8::1"));
        assert!(list.contains("2001:0db8:0000::0001"));
        assert!(!list.contains("10.1.2.4"));
    }

    #[test]
    fn test_cidr_match() {
        let list = IpAllowList::parse(["192.168.0.0/16", "2001:db8::/32"]).unwrap();
        assert!(list.contains("192.168.44.7"));
        assert!(!list.contains("192.169.0.1"));
        assert!(list.contains("2001:db8:ffff::9"));
        assert!(!list.contains("2001:db9::1"));
    }

    #[test]
    fn test_mapped_v4_source_matches_v4_rule() {
        let list = IpAllowList::parse(["10.0.0.0/8"]).unwrap();
        assert!(list.contains("::ffff:10.9.8.7"));
    }

    #[test]
    fn test_mapped_v4_network_matches_v4_source() {
        let list = IpAllowList::parse(["::ffff:10.0.0.0/104"]).unwrap();
        assert!(list.contains("10.1.2.3"));
        assert!(list.contains("::ffff:10.200.0.1"));
        assert!(!list.contains("11.1.2.3"));

        let rule: IpRule = "::ffff:192.168.1.0/120".parse().unwrap();
        assert_eq!(
            rule,
            IpRule::Network {
                base: IpAddr::from([192, 168, 1, 0]),
                prefix: 24
            }
        );
        assert!(IpAllowList::parse(["::ffff:10.0.0.0/64"]).is_err());
    }

    #[test]
    fn test_zero_prefix_matches_family_only() {
        let list = IpAllowList::parse(["0.0.0.0/0"]).unwrap();
        assert!(list.contains("203.0.113.5"));
        assert!(!list.contains("2001:db8::1"));
    }

    #[test]
    fn test_unparseable_source_never_matches() {
        let list = IpAllowList::parse(["0.0.0.0/0"]).unwrap();
        assert!(!list.contains("localhost"));
        assert!(!list.contains(""));
    }

    #[test]
    fn test_invalid_entries_rejected() {
        assert!(IpAllowList::parse(["not-an-ip"]).is_err());
        assert!(IpAllowList::parse(["10.0.0.0/33"]).is_err());
        assert!(IpAllowList::parse(["10.0.0.0/abc"]).is_err());
        assert!(IpAllowList::parse(["::/129"]).is_err());
    }

    #[test]
    fn test_deserialize_rejects_bad_entry() {
        let parsed: Result<IpAllowList, _> = serde_json::from_str(r#"["10.0.0.1", "bogus"]"#);
        assert!(parsed.is_err());
    }
}
