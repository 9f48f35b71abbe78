//! Source-IP access rules for tunnels
//!
//! Supports individual addresses and CIDR notation, IPv4 and IPv6. A rule
//! with an empty allowlist admits every address not matched by the denylist;
//! deny always wins over allow.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Access rule errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AccessRuleError {
    #[error("invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),
}

/// An IP network (single addresses parse as /32 or /128)
#[derive(Debug, Clone, PartialEq)]
struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    fn parse(s: &str) -> Result<Self, AccessRuleError> {
        if let Some((ip_str, prefix_str)) = s.split_once('/') {
            let addr = IpAddr::from_str(ip_str)
                .map_err(|_| AccessRuleError::InvalidIpAddress(s.to_string()))?;
            let prefix_len = prefix_str
                .parse::<u8>()
                .map_err(|_| AccessRuleError::InvalidCidr(s.to_string()))?;

            let max_prefix = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix_len > max_prefix {
                return Err(AccessRuleError::InvalidCidr(s.to_string()));
            }

            Ok(Self { addr, prefix_len })
        } else {
            let addr = IpAddr::from_str(s)
                .map_err(|_| AccessRuleError::InvalidIpAddress(s.to_string()))?;
            let prefix_len = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Ok(Self { addr, prefix_len })
        }
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net_ip), IpAddr::V4(test_ip)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let net_bits = u32::from(net_ip);
                let test_bits = u32::from(*test_ip);
                let mask = !0u32 << (32 - self.prefix_len);
                (net_bits & mask) == (test_bits & mask)
            }
            (IpAddr::V6(net_ip), IpAddr::V6(test_ip)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let net_bits = u128::from(net_ip);
                let test_bits = u128::from(*test_ip);
                let mask = !0u128 << (128 - self.prefix_len);
                (net_bits & mask) == (test_bits & mask)
            }
            _ => false,
        }
    }
}

/// Allow/deny rule attached to a tunnel
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AccessRule {
    /// Allowed addresses or CIDR ranges; empty means allow all
    #[serde(default)]
    pub allow: Vec<String>,
    /// Denied addresses or CIDR ranges; checked before the allowlist
    #[serde(default)]
    pub deny: Vec<String>,
}

impl AccessRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Reject malformed entries up front so dispatch never has to
    pub fn validate(&self) -> Result<(), AccessRuleError> {
        for entry in self.allow.iter().chain(self.deny.iter()) {
            IpNetwork::parse(entry)?;
        }
        Ok(())
    }

    pub fn permits(&self, ip: &IpAddr) -> bool {
        let matches = |entries: &[String]| {
            entries
                .iter()
                .filter_map(|e| IpNetwork::parse(e).ok())
                .any(|net| net.contains(ip))
        };

        if matches(&self.deny) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        matches(&self.allow)
    }

    pub fn permits_socket(&self, addr: &SocketAddr) -> bool {
        self.permits(&addr.ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rule_allows_all() {
        let rule = AccessRule::new();
        assert!(rule.permits(&"192.168.1.1".parse().unwrap()));
        assert!(rule.permits(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_allowlist_cidr() {
        let rule = AccessRule {
            allow: vec!["10.0.0.0/8".to_string()],
            deny: vec![],
        };
        assert!(rule.permits(&"10.1.2.3".parse().unwrap()));
        assert!(!rule.permits(&"192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let rule = AccessRule {
            allow: vec!["10.0.0.0/8".to_string()],
            deny: vec!["10.5.0.0/16".to_string()],
        };
        assert!(rule.permits(&"10.1.2.3".parse().unwrap()));
        assert!(!rule.permits(&"10.5.2.3".parse().unwrap()));
    }

    #[test]
    fn test_single_ip_entry() {
        let rule = AccessRule {
            allow: vec!["203.0.113.9".to_string()],
            deny: vec![],
        };
        assert!(rule.permits(&"203.0.113.9".parse().unwrap()));
        assert!(!rule.permits(&"203.0.113.10".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_cidr() {
        let rule = AccessRule {
            allow: vec!["2001:db8::/32".to_string()],
            deny: vec![],
        };
        assert!(rule.permits(&"2001:db8::42".parse().unwrap()));
        assert!(!rule.permits(&"2001:db9::42".parse().unwrap()));
        // IPv4 never matches an IPv6 network
        assert!(!rule.permits(&"10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_validate_rejects_garbage() {
        let rule = AccessRule {
            allow: vec!["not-an-ip".to_string()],
            deny: vec![],
        };
        assert!(rule.validate().is_err());

        let rule = AccessRule {
            allow: vec!["10.0.0.0/64".to_string()],
            deny: vec![],
        };
        assert!(matches!(
            rule.validate().unwrap_err(),
            AccessRuleError::InvalidCidr(_)
        ));
    }
}
