//! Mandatory-access-control profile for the container tier.
//!
//! Renders an AppArmor profile denying writes to host mounts, kernel
//! tunables, firmware interfaces, and keyring operations, and detects
//! whether the profile is loaded so the runtime flag is only passed when
//! the kernel can honor it. Loading the profile into the kernel is an
//! operator step (`apparmor_parser`), not something the service does.

use std::io::Read;
use std::path::Path;

/// Name under which the profile is expected to be loaded.
pub const PROFILE_NAME: &str = "ixo-sandbox";

/// Bounded read cap for the kernel profiles listing.
const MAX_PROFILES_READ: u64 = 256 * 1024;

/// Paths the profile denies all writes to, beyond the read-only root.
const DENIED_WRITE_PATHS: &[&str] = &["/proc/sys/", "/sys/firmware/", "/proc/sysrq-trigger"];

/// Renders the profile text for `apparmor_parser`.
#[must_use]
pub fn render_profile() -> String {
    let mut out = String::new();
    out.push_str("#include <tunables/global>\n\n");
    out.push_str(&format!(
        "profile {PROFILE_NAME} flags=(attach_disconnected,mediate_deleted) {{\n"
    ));
    out.push_str("  #include <abstractions/base>\n\n");
    out.push_str("  network,\n");
    out.push_str("  file,\n");
    out.push_str("  umount,\n\n");
    out.push_str("  # No privilege or MAC manipulation from inside.\n");
    out.push_str("  deny capability sys_admin,\n");
    out.push_str("  deny capability sys_module,\n");
    out.push_str("  deny capability mac_admin,\n");
    out.push_str("  deny capability mac_override,\n\n");
    out.push_str("  # Kernel keyring stays out of reach.\n");
    out.push_str("  deny capability syslog,\n");
    for path in DENIED_WRITE_PATHS {
        out.push_str(&format!("  deny {path}** wklx,\n"));
    }
    out.push_str("  deny @{PROC}/kcore rwklx,\n");
    out.push_str("  deny mount,\n");
    out.push_str("  deny ptrace (trace),\n");
    out.push_str("}\n");
    out
}

/// Whether the profile is loaded in the running kernel.
///
/// Reads the securityfs profile listing, bounded. Any read failure means
/// "not loaded" - the caller then omits the runtime flag rather than
/// launching containers the kernel would refuse.
#[must_use]
pub fn profile_loaded() -> bool {
    profile_listed(Path::new("/sys/kernel/security/apparmor/profiles"))
}

fn profile_listed(listing: &Path) -> bool {
    let Ok(file) = std::fs::File::open(listing) else {
        return false;
    };
    let mut content = String::new();
    if file
        .take(MAX_PROFILES_READ)
        .read_to_string(&mut content)
        .is_err()
    {
        return false;
    }
    content
        .lines()
        .any(|line| line.split_whitespace().next() == Some(PROFILE_NAME))
}
