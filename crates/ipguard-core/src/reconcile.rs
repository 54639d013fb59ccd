//! The driver: builds the aggregate, diffs it against the live firewall
//! state under the threshold policy, and applies (or just reports) the
//! resulting block/unblock batches.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::aggregate::Aggregate;
use crate::config::Config;
use crate::country::CountryResolver;
use crate::error::RunError;
use crate::firewall::FirewallAdapter;
use crate::lock::Lock;
use crate::logtype::LogType;
use crate::policy::Policy;

/// Operational default: amortize one firewall invocation over this many
/// addresses.
pub const DEFAULT_BATCH_SIZE: usize = 10;

pub struct RunOptions {
    pub cache_root: PathBuf,
    pub lock_path: PathBuf,
    /// Never invoke the firewall adapter's `block`/`unblock`; still
    /// queries `is_currently_blocked` so the report reflects reality.
    pub dry_run: bool,
    pub batch_size: usize,
    pub list_by_address: bool,
    pub list_by_country: bool,
    /// Skip the effective-root check; set for `-t`/test-mode runs, which
    /// never touch the firewall.
    pub skip_privilege_check: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("/var/cache/ipguard"),
            lock_path: PathBuf::from("/var/run/ipguard.lock"),
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
            list_by_address: false,
            list_by_country: false,
            skip_privilege_check: false,
        }
    }
}

/// One address's disposition, suitable for the `-a` report.
pub struct AddressLine {
    pub addr: String,
    pub count: u64,
    pub country: Option<String>,
    pub blocked: bool,
    pub would_block: bool,
    pub unjust_block: bool,
    pub whitelisted: bool,
}

impl fmt::Display for AddressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        if self.blocked {
            flags.push("BLOCKED");
        }
        if self.would_block {
            flags.push("+WouldBLOCK+");
        }
        if self.unjust_block {
            flags.push("-UnjustBLOCK-");
        }
        if self.whitelisted {
            flags.push("Whitelisted");
        }
        write!(
            f,
            "{:<15}: {:>5} offenses {} ({})",
            self.addr,
            self.count,
            self.country.as_deref().unwrap_or("--"),
            flags.join(",")
        )
    }
}

pub struct RunReport {
    pub total_offenses: usize,
    pub to_block: Vec<String>,
    pub to_unblock: Vec<String>,
    pub address_lines: Vec<AddressLine>,
    pub country_lines: Vec<(String, u64)>,
}

pub fn run(
    config: &Config,
    firewall: &mut dyn FirewallAdapter,
    country: &dyn CountryResolver,
    opts: &RunOptions,
) -> Result<RunReport, RunError> {
    #[cfg(unix)]
    if !opts.skip_privilege_check && !nix::unistd::Uid::effective().is_root() {
        return Err(RunError::NotRoot);
    }

    std::fs::create_dir_all(&opts.cache_root).map_err(|source| RunError::CacheRoot {
        path: opts.cache_root.clone(),
        source,
    })?;

    let lock = Lock::acquire(&opts.lock_path)?;

    let mut log_types = Vec::with_capacity(config.log_types.len());
    for lt_cfg in &config.log_types {
        let lt = LogType::construct(
            &lt_cfg.name,
            &lt_cfg.dir,
            &lt_cfg.prefix,
            &lt_cfg.regex,
            &opts.cache_root,
            country,
        )?;
        log_types.push(lt);
    }

    sweep_cache_root(&opts.cache_root, &log_types);

    // All parsing/caching disk I/O is done; release the lock before the
    // (potentially slow) firewall phase so a subsequent scan isn't blocked.
    lock.release();

    let mut policy = Policy::new(Some(config.max_offenses));
    for rule in &config.rules {
        policy.insert_rule(&rule.cidr, rule.allowance)?;
    }

    let mut aggregate = Aggregate::new();
    let mut total_offenses = 0usize;
    for lt in &log_types {
        total_offenses += lt.offense_count();
        lt.map_addresses(&mut aggregate);
    }
    info!(total_offenses, log_types = log_types.len(), "aggregation complete");

    let country_lines = if opts.list_by_country {
        aggregate.by_country_desc()
    } else {
        Vec::new()
    };
    let sorted = aggregate.into_sorted_desc();

    let mut to_block = Vec::new();
    let mut to_unblock = Vec::new();
    let mut address_lines = Vec::new();

    for (addr, entry) in &sorted {
        let currently_blocked = firewall.is_currently_blocked(addr)?;
        let allowance = policy.allowed(addr);

        let mut would_block = false;
        let mut unjust_block = false;
        let mut whitelisted = false;

        if let Some(allowance) = allowance {
            whitelisted = allowance.is_whitelist();

            if currently_blocked && !allowance.exceeded_by(entry.count) {
                unjust_block = true;
                to_unblock.push(addr.clone());
            } else if !currently_blocked && allowance.exceeded_by(entry.count) {
                would_block = true;
                to_block.push(addr.clone());
            }
        }

        if opts.list_by_address {
            address_lines.push(AddressLine {
                addr: addr.clone(),
                count: entry.count,
                country: entry.country.clone(),
                blocked: currently_blocked,
                would_block,
                unjust_block,
                whitelisted,
            });
        }
    }

    if !opts.dry_run {
        if !to_block.is_empty() {
            firewall.block(&to_block, opts.batch_size)?;
            info!(count = to_block.len(), "blocked new hosts");
        }
        if !to_unblock.is_empty() {
            firewall.unblock(&to_unblock, opts.batch_size)?;
            info!(count = to_unblock.len(), "unblocked hosts");
        }
    } else {
        if !to_block.is_empty() {
            info!(count = to_block.len(), "would block new hosts (dry run)");
        }
        if !to_unblock.is_empty() {
            info!(count = to_unblock.len(), "would unblock hosts (dry run)");
        }
    }

    Ok(RunReport {
        total_offenses,
        to_block,
        to_unblock,
        address_lines,
        country_lines,
    })
}

/// Remove any cache subdirectory that doesn't belong to a currently
/// configured log type.
fn sweep_cache_root(cache_root: &Path, log_types: &[LogType]) {
    let valid: HashSet<&str> = log_types.iter().map(LogType::cache_dirname).collect();
    let Ok(entries) = std::fs::read_dir(cache_root) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || valid.contains(name.as_ref()) {
            continue;
        }
        if entry.path().is_dir() && std::fs::remove_dir_all(entry.path()).is_ok() {
            info!(dir = %entry.path().display(), "swept stale log-type cache directory");
        }
    }
}
