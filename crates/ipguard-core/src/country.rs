//! IP -> country-code resolution.
//!
//! The real oracle (a full GeoIP table) is deliberately out of scope for
//! this crate; [`CountryResolver`] is the seam a caller plugs a real one
//! into. [`BuiltinResolver`] ships a handful of well-known allocation
//! blocks so the pipeline has something real to stamp on offenses without
//! pulling in a GeoIP database.

use std::net::IpAddr;

use ipnet::IpNet;

/// Resolves a source address to an uppercase two-letter country code.
pub trait CountryResolver: Send + Sync {
    /// Returns `None` when the address cannot be classified.
    fn lookup(&self, addr: &str) -> Option<String>;
}

/// A resolver that never classifies anything; useful for tests and for
/// deployments that don't care about the by-country report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResolver;

impl CountryResolver for NullResolver {
    fn lookup(&self, _addr: &str) -> Option<String> {
        None
    }
}

/// A small built-in table of representative allocation blocks.
///
/// This is intentionally not exhaustive; it exists so the by-country
/// report and the country-divergence path have real behavior to exercise.
pub struct BuiltinResolver {
    table: Vec<(IpNet, &'static str)>,
}

impl BuiltinResolver {
    pub fn new() -> Self {
        let entries: &[(&str, &str)] = &[
            ("10.0.0.0/8", "--"),
            ("192.168.0.0/16", "--"),
            ("172.16.0.0/12", "--"),
            ("1.0.0.0/8", "AU"),
            ("27.0.0.0/8", "KR"),
            ("36.0.0.0/8", "CN"),
            ("41.0.0.0/8", "ZA"),
            ("58.0.0.0/8", "JP"),
            ("77.0.0.0/8", "GB"),
            ("85.0.0.0/8", "DE"),
            ("95.0.0.0/8", "RU"),
            ("103.0.0.0/8", "SG"),
            ("128.0.0.0/8", "US"),
            ("196.0.0.0/8", "NG"),
            ("200.0.0.0/8", "BR"),
        ];
        let table = entries
            .iter()
            .map(|(cidr, code)| (cidr.parse().expect("builtin cidr is valid"), *code))
            .collect();
        Self { table }
    }
}

impl Default for BuiltinResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CountryResolver for BuiltinResolver {
    fn lookup(&self, addr: &str) -> Option<String> {
        let ip: IpAddr = addr.parse().ok()?;
        self.table
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, code)| code.to_string())
    }
}
