use std::collections::HashSet;
use std::process::Command;

use tracing::warn;

use crate::error::FirewallError;

use super::{partition_by_family, FirewallAdapter};

const IPTABLES: &str = "iptables";
const IP6TABLES: &str = "ip6tables";

/// Drives the real `iptables`/`ip6tables` binaries. The live blocklist is
/// built lazily, on the first call that needs it, from `-nL INPUT`.
pub struct IptablesAdapter {
    iptables_bin: String,
    ip6tables_bin: String,
    live: Option<(HashSet<String>, HashSet<String>)>,
}

impl Default for IptablesAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl IptablesAdapter {
    pub fn new() -> Self {
        Self {
            iptables_bin: IPTABLES.to_string(),
            ip6tables_bin: IP6TABLES.to_string(),
            live: None,
        }
    }

    /// Override the binary names, e.g. to point at a fake tool in tests.
    pub fn with_binaries(iptables_bin: impl Into<String>, ip6tables_bin: impl Into<String>) -> Self {
        Self {
            iptables_bin: iptables_bin.into(),
            ip6tables_bin: ip6tables_bin.into(),
            live: None,
        }
    }

    fn ensure_live(&mut self) -> Result<(), FirewallError> {
        if self.live.is_some() {
            return Ok(());
        }
        let v4 = Self::read_chain(&self.iptables_bin, "0.0.0.0/0")?;
        let v6 = Self::read_chain(&self.ip6tables_bin, "::/0")?;
        self.live = Some((v4, v6));
        Ok(())
    }

    fn read_chain(tool: &str, dest_wildcard: &str) -> Result<HashSet<String>, FirewallError> {
        let output = Command::new(tool)
            .args(["-nL", "INPUT"])
            .output()
            .map_err(|source| FirewallError::Spawn { tool: leak(tool), source })?;

        if !output.status.success() {
            return Err(FirewallError::Read {
                tool: leak(tool),
                reason: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut set = HashSet::new();
        for line in text.lines().skip(2) {
            match parse_drop_line(line, dest_wildcard) {
                Some(addr) => {
                    set.insert(addr);
                }
                None if line.trim().is_empty() => {}
                None => warn!(tool, line, "could not parse iptables chain line, skipping"),
            }
        }
        Ok(set)
    }

    fn control(
        &mut self,
        cmd_flag: &str,
        addrs: &[String],
        batch_size: usize,
    ) -> Result<(), FirewallError> {
        assert!(batch_size > 0);
        let (v4, v6) = partition_by_family(addrs);

        for chunk in v4.chunks(batch_size) {
            run_batch(&self.iptables_bin, cmd_flag, chunk)?;
        }
        for chunk in v6.chunks(batch_size) {
            run_batch(&self.ip6tables_bin, cmd_flag, chunk)?;
        }
        Ok(())
    }
}

impl FirewallAdapter for IptablesAdapter {
    fn is_currently_blocked(&mut self, addr: &str) -> Result<bool, FirewallError> {
        self.ensure_live()?;
        let (v4, v6) = self.live.as_ref().expect("populated by ensure_live");
        Ok(if addr.contains(':') {
            v6.contains(addr)
        } else {
            v4.contains(addr)
        })
    }

    fn block(&mut self, addrs: &[String], batch_size: usize) -> Result<(), FirewallError> {
        self.control("A", addrs, batch_size)
    }

    fn unblock(&mut self, addrs: &[String], batch_size: usize) -> Result<(), FirewallError> {
        self.control("D", addrs, batch_size)
    }
}

fn run_batch(tool: &str, cmd_flag: &str, addrs: &[&str]) -> Result<(), FirewallError> {
    if addrs.is_empty() {
        return Ok(());
    }
    let csv = addrs.join(",");
    let output = Command::new(tool)
        .arg(format!("-{cmd_flag}"))
        .arg("INPUT")
        .arg("-s")
        .arg(csv)
        .arg("-j")
        .arg("DROP")
        .output()
        .map_err(|source| FirewallError::Spawn { tool: leak(tool), source })?;

    if !output.status.success() {
        return Err(FirewallError::NonZeroExit {
            tool: leak(tool),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    if !output.stderr.is_empty() {
        warn!(
            tool,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "firewall tool reported a problem on an otherwise successful run"
        );
    }
    Ok(())
}

/// `Command` wants a `&str` with a known lifetime for the error variant;
/// the binary name is one of exactly two static strings, so intern it.
fn leak(tool: &str) -> &'static str {
    match tool {
        IPTABLES => IPTABLES,
        IP6TABLES => IP6TABLES,
        _ => "firewall-tool",
    }
}

/// Parse one `-nL INPUT` line for a single-source DROP-all rule.
///
/// IPv4 lines carry an options column (`--`): `DROP all -- <src> 0.0.0.0/0`.
/// IPv6 lines omit it: `DROP all <src> ::/0`.
fn parse_drop_line(line: &str, dest_wildcard: &str) -> Option<String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "DROP" || parts[1] != "all" {
        return None;
    }
    if parts[2] == "--" {
        if parts.len() >= 5 && parts[4] == dest_wildcard {
            return Some(parts[3].to_string());
        }
    } else if parts[3] == dest_wildcard {
        return Some(parts[2].to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn fake_binary(dir: &std::path::Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn block_surfaces_non_zero_exit_as_firewall_error() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_binary(&dir.path(), "fake-iptables", "echo boom >&2; exit 1");
        let mut adapter = IptablesAdapter::with_binaries(bin, "/bin/true");

        let err = adapter
            .block(&["1.2.3.4".to_string()], 10)
            .unwrap_err();
        match err {
            FirewallError::NonZeroExit { status, stderr, .. } => {
                assert_eq!(status, 1);
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[test]
    fn parses_ipv4_drop_line() {
        let got = parse_drop_line("DROP       all  --  1.2.3.4              0.0.0.0/0", "0.0.0.0/0");
        assert_eq!(got.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn parses_ipv6_drop_line() {
        let got = parse_drop_line("DROP       all      2607:5300:60:653b::  ::/0", "::/0");
        assert_eq!(got.as_deref(), Some("2607:5300:60:653b::"));
    }

    #[test]
    fn ignores_non_drop_lines() {
        assert_eq!(parse_drop_line("ACCEPT     all  --  0.0.0.0/0  0.0.0.0/0", "0.0.0.0/0"), None);
        assert_eq!(parse_drop_line("", "0.0.0.0/0"), None);
    }

    #[test]
    fn ignores_mismatched_destination() {
        assert_eq!(
            parse_drop_line("DROP all -- 1.2.3.4 10.0.0.0/8", "0.0.0.0/0"),
            None
        );
    }
}
