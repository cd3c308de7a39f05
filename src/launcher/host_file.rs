//! The host-list file consumed by `mpirun`.

use std::{
    fs,
    io::{self, ErrorKind},
    path::Path,
};

/// Returns the hostname of the local machine.
#[cfg(unix)]
pub fn local_hostname() -> io::Result<String> {
    nix::unistd::gethostname()?
        .into_string()
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "hostname is not valid UTF-8"))
}

/// Returns the hostname of the local machine.
#[cfg(not(unix))]
pub fn local_hostname() -> io::Result<String> {
    std::env::var("COMPUTERNAME")
        .map_err(|_| io::Error::new(ErrorKind::NotFound, "COMPUTERNAME is not set"))
}

/// Writes the host file, replacing any previous content.
///
/// The file holds exactly one line: `hostname` followed by a newline.
pub fn write_host_file(path: &Path, hostname: &str) -> io::Result<()> {
    if hostname.is_empty() || hostname.contains(|c: char| c.is_whitespace()) {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("invalid hostname {:?}", hostname),
        ));
    }
    fs::write(path, format!("{}\n", hostname))
}
