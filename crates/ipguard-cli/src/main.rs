use clap::Parser;

mod cli;
mod exit_codes;

use cli::Cli;
use ipguard_core::reconcile::{self, RunOptions};
use ipguard_core::{Config, RunError};
use ipguard_core::country::BuiltinResolver;
use ipguard_core::firewall::{FirewallAdapter, IptablesAdapter, NullFirewallAdapter};

fn main() {
    let cli = Cli::parse();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", if cli.verbose { "debug" } else { "info" });
    }
    env_logger::init();

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            match e.downcast_ref::<RunError>() {
                Some(run_err) => exit_codes::exit_code_for(run_err),
                None => exit_codes::EXIT_CONFIG_ERROR,
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    let test_mode = cli.test.is_some();
    let config_path = cli.test.as_ref().unwrap_or(&cli.config);
    let config = Config::load(config_path).map_err(RunError::from)?;

    let cache_root = config
        .cache_dir
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("/var/cache/ipguard"));
    let lock_path = config
        .lock_path
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("/var/run/ipguard.lock"));

    let (cache_root, lock_path) = if test_mode {
        (suffix_path(&cache_root, "-test"), suffix_path(&lock_path, "-test"))
    } else {
        (cache_root, lock_path)
    };

    let opts = RunOptions {
        cache_root,
        lock_path,
        dry_run: test_mode,
        batch_size: reconcile::DEFAULT_BATCH_SIZE,
        list_by_address: cli.by_address,
        list_by_country: cli.by_country,
        skip_privilege_check: test_mode,
    };

    let country = BuiltinResolver::new();
    let mut iptables_adapter;
    let mut null_adapter;
    let firewall: &mut dyn FirewallAdapter = if test_mode {
        null_adapter = NullFirewallAdapter;
        &mut null_adapter
    } else {
        iptables_adapter = IptablesAdapter::new();
        &mut iptables_adapter
    };

    let report = reconcile::run(&config, firewall, &country, &opts)?;

    println!(
        "{} offense(s) scanned; {} blocked, {} unblocked",
        report.total_offenses,
        report.to_block.len(),
        report.to_unblock.len()
    );

    if cli.by_address {
        for line in &report.address_lines {
            println!("{line}");
        }
    }
    if cli.by_country {
        for (code, count) in &report.country_lines {
            println!("{code:<4} {count}");
        }
    }

    Ok(exit_codes::EXIT_SUCCESS)
}

fn suffix_path(path: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    std::path::PathBuf::from(s)
}
