use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "ipguard",
    version,
    about = "Offline log-scanning firewall gatekeeper"
)]
pub struct Cli {
    /// List results by address
    #[arg(short = 'a', long = "by-address")]
    pub by_address: bool,

    /// List results by country
    #[arg(short = 'c', long = "by-country")]
    pub by_country: bool,

    /// Test mode: read the supplied config, suffix cache/lock paths with
    /// `-test`, never invoke the firewall tool.
    #[arg(short = 't', long = "test", value_name = "CONF_FILE")]
    pub test: Option<PathBuf>,

    /// Raise the effective log level to include per-file progress.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Path to the config file (ignored in test mode).
    #[arg(long, default_value = "/etc/ipguard/ipguard.yaml")]
    pub config: PathBuf,
}
