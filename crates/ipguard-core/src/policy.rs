//! Longest-prefix-match CIDR policy: how many offenses may an address
//! accrue before it gets blocked.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::de::{self, Visitor};
use serde::{Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// Per-address allowance: either a finite ceiling or the whitelist sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allowance {
    Limit(u32),
    Whitelist,
}

/// Hand-written: under `#[serde(untagged)]` a bare unit variant only ever
/// matches a YAML `null`, never the string `"whitelist"` this format
/// actually uses, so the derive can't express this shape.
impl Serialize for Allowance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Allowance::Limit(max) => serializer.serialize_u32(*max),
            Allowance::Whitelist => serializer.serialize_str("whitelist"),
        }
    }
}

impl<'de> serde::Deserialize<'de> for Allowance {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AllowanceVisitor;

        impl<'de> Visitor<'de> for AllowanceVisitor {
            type Value = Allowance;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer, or the string \"whitelist\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                u32::try_from(v)
                    .map(Allowance::Limit)
                    .map_err(|_| E::custom(format!("offense limit {v} does not fit in u32")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                if v < 0 {
                    return Err(E::custom(format!("offense limit {v} must not be negative")));
                }
                self.visit_u64(v as u64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                if v.eq_ignore_ascii_case("whitelist") {
                    Ok(Allowance::Whitelist)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }
        }

        deserializer.deserialize_any(AllowanceVisitor)
    }
}

impl Allowance {
    pub fn is_whitelist(self) -> bool {
        matches!(self, Allowance::Whitelist)
    }

    /// Whether `count` offenses justifies a block under this allowance.
    pub fn exceeded_by(self, count: u64) -> bool {
        match self {
            Allowance::Whitelist => false,
            Allowance::Limit(max) => count > u64::from(max),
        }
    }
}

struct Rule {
    net: IpNet,
    allowance: Allowance,
    order: usize,
}

/// A compiled set of CIDR rules, split by address family, plus an optional
/// process-wide default applied when nothing matches.
pub struct Policy {
    v4: Vec<Rule>,
    v6: Vec<Rule>,
    default: Option<Allowance>,
}

impl Policy {
    pub fn new(default_max_offenses: Option<u32>) -> Self {
        Self {
            v4: Vec::new(),
            v6: Vec::new(),
            default: default_max_offenses.map(Allowance::Limit),
        }
    }

    /// Parse `cidr` and register `allowance` for it. Rules are kept sorted
    /// by descending prefix length (longest match wins); among equal
    /// lengths, first-inserted wins.
    pub fn insert_rule(&mut self, cidr: &str, allowance: Allowance) -> Result<(), ConfigError> {
        let net: IpNet = cidr.parse().map_err(|source| ConfigError::BadCidr {
            cidr: cidr.to_string(),
            source,
        })?;
        let bucket = if net.addr().is_ipv4() {
            &mut self.v4
        } else {
            &mut self.v6
        };
        let order = bucket.len();
        bucket.push(Rule {
            net,
            allowance,
            order,
        });
        bucket.sort_by(|a, b| {
            b.net
                .prefix_len()
                .cmp(&a.net.prefix_len())
                .then(a.order.cmp(&b.order))
        });
        Ok(())
    }

    /// Resolve the allowance that applies to `addr`, falling back to the
    /// configured default (if any) when no CIDR rule matches.
    pub fn allowed(&self, addr: &str) -> Option<Allowance> {
        let ip: IpAddr = addr.parse().ok()?;
        let bucket = match ip {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        };
        bucket
            .iter()
            .find(|rule| rule.net.contains(&ip))
            .map(|rule| rule.allowance)
            .or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut p = Policy::new(Some(10));
        p.insert_rule("1.2.0.0/16", Allowance::Limit(5)).unwrap();
        p.insert_rule("1.2.3.0/24", Allowance::Whitelist).unwrap();
        assert_eq!(p.allowed("1.2.3.4"), Some(Allowance::Whitelist));
        assert_eq!(p.allowed("1.2.9.4"), Some(Allowance::Limit(5)));
        assert_eq!(p.allowed("9.9.9.9"), Some(Allowance::Limit(10)));
    }

    #[test]
    fn first_configured_wins_on_tie() {
        let mut p = Policy::new(None);
        p.insert_rule("1.2.3.0/24", Allowance::Limit(1)).unwrap();
        p.insert_rule("1.2.3.0/24", Allowance::Limit(2)).unwrap();
        assert_eq!(p.allowed("1.2.3.4"), Some(Allowance::Limit(1)));
    }

    #[test]
    fn no_match_no_default_is_none() {
        let p = Policy::new(None);
        assert_eq!(p.allowed("8.8.8.8"), None);
    }

    #[test]
    fn families_are_kept_separate() {
        let mut p = Policy::new(None);
        p.insert_rule("::/0", Allowance::Whitelist).unwrap();
        assert_eq!(p.allowed("1.2.3.4"), None);
        assert_eq!(p.allowed("::1"), Some(Allowance::Whitelist));
    }

    #[test]
    fn exceeded_by_respects_whitelist() {
        assert!(!Allowance::Whitelist.exceeded_by(1_000_000));
        assert!(Allowance::Limit(2).exceeded_by(3));
        assert!(!Allowance::Limit(2).exceeded_by(2));
    }

    #[test]
    fn deserializes_whitelist_string_and_integer_limit() {
        let w: Allowance = serde_yaml::from_str("whitelist").unwrap();
        assert_eq!(w, Allowance::Whitelist);
        let w: Allowance = serde_yaml::from_str("WHITELIST").unwrap();
        assert_eq!(w, Allowance::Whitelist);
        let l: Allowance = serde_yaml::from_str("7").unwrap();
        assert_eq!(l, Allowance::Limit(7));
        assert!(serde_yaml::from_str::<Allowance>("not-a-thing").is_err());
    }
}
