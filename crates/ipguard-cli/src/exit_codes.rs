//! Exit codes for the `ipguard` binary. Coarse and stable: scripts that
//! wrap this tool should only ever need to check these four values.

/// Ran clean: no configuration errors, no firewall errors.
pub const EXIT_SUCCESS: i32 = 0;

/// Configuration or user error: bad YAML, bad regex, bad CIDR, missing file.
pub const EXIT_CONFIG_ERROR: i32 = 2;

/// Firewall or privilege error: not root, `iptables`/`ip6tables` missing
/// or failed, lock already held.
pub const EXIT_RUNTIME_ERROR: i32 = 3;

use ipguard_core::RunError;

/// Map a [`RunError`] to the exit code a caller should see.
pub fn exit_code_for(err: &RunError) -> i32 {
    match err {
        RunError::Config(_) => EXIT_CONFIG_ERROR,
        RunError::NotRoot
        | RunError::LockHeld { .. }
        | RunError::Lock { .. }
        | RunError::Firewall(_)
        | RunError::CacheRoot { .. } => EXIT_RUNTIME_ERROR,
    }
}
