mod iptables;

pub use iptables::IptablesAdapter;

use crate::error::FirewallError;

/// What the reconciler needs from a firewall: a way to check the live
/// blocklist, and batched ways to add/remove DROP rules.
pub trait FirewallAdapter {
    fn is_currently_blocked(&mut self, addr: &str) -> Result<bool, FirewallError>;
    fn block(&mut self, addrs: &[String], batch_size: usize) -> Result<(), FirewallError>;
    fn unblock(&mut self, addrs: &[String], batch_size: usize) -> Result<(), FirewallError>;
}

/// A firewall adapter that never touches the system: every address reports
/// as not-currently-blocked, and `block`/`unblock` are no-ops. Used by
/// `-t`/test-mode runs, which must never invoke the firewall tool at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFirewallAdapter;

impl FirewallAdapter for NullFirewallAdapter {
    fn is_currently_blocked(&mut self, _addr: &str) -> Result<bool, FirewallError> {
        Ok(false)
    }

    fn block(&mut self, _addrs: &[String], _batch_size: usize) -> Result<(), FirewallError> {
        Ok(())
    }

    fn unblock(&mut self, _addrs: &[String], _batch_size: usize) -> Result<(), FirewallError> {
        Ok(())
    }
}

/// Split `addrs` into IPv4 entries (in original relative order) followed
/// by IPv6 entries (in original relative order). A batch must never mix
/// families, so every consumer of this partition chunks each half
/// independently.
pub(crate) fn partition_by_family(addrs: &[String]) -> (Vec<&str>, Vec<&str>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for a in addrs {
        if a.contains(':') {
            v6.push(a.as_str());
        } else {
            v4.push(a.as_str());
        }
    }
    (v4, v6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_without_mixing_families() {
        let addrs: Vec<String> = vec!["1.1.1.1", "::1", "2.2.2.2", "fe80::1"]
            .into_iter()
            .map(String::from)
            .collect();
        let (v4, v6) = partition_by_family(&addrs);
        assert_eq!(v4, vec!["1.1.1.1", "2.2.2.2"]);
        assert_eq!(v6, vec!["::1", "fe80::1"]);
    }
}
