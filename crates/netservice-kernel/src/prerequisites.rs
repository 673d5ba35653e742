use std::path::Path;

use netservice::Error;

use crate::netns::Netns;

/// Verify the host can run the kernel elements before building a chain.
///
/// Checks the `ip` and `ping` binaries, root privileges, and access to the
/// process's own namespace file. Collects all failures and returns them in a
/// single `Unavailable` error.
pub fn check_prerequisites(ip_binary: &Path, ping_binary: &Path) -> Result<(), Error> {
    let mut errors = Vec::new();

    check_command(ip_binary, "iproute2 binary", &mut errors);
    check_command(ping_binary, "ping binary", &mut errors);
    check_root(&mut errors);
    check_netns(&mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Unavailable(errors.join("; ")))
    }
}

fn check_command(binary: &Path, label: &str, errors: &mut Vec<String>) {
    if which::which(binary).is_err() {
        errors.push(format!("{label} not found: {}", binary.display()));
    }
}

fn check_root(errors: &mut Vec<String>) {
    if !nix::unistd::geteuid().is_root() {
        errors.push(
            "root access required to switch namespaces and move links; \
             please run with sudo"
                .to_string(),
        );
    }
}

fn check_netns(errors: &mut Vec<String>) {
    if let Err(e) = Netns::open("/proc/self/ns/net") {
        errors.push(format!("cannot open own network namespace: {e}"));
    }
}
