//! Platform-specific process and file handling

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

use std::io;
use std::path::Path;
use tokio::process::Child;

/// Ask a child process to shut down
///
/// On Unix this sends SIGTERM so OpenVPN can tear the tunnel down cleanly.
/// Elsewhere the process is killed outright. A child that already exited is
/// left alone.
pub fn terminate(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    return unix::terminate(child);

    #[cfg(windows)]
    return windows::terminate(child);
}

/// Create `path` with `contents`, failing if it already exists
///
/// The file is created with `mode` from the start, so the content is never
/// readable with looser permissions.
pub fn create_restricted(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    return unix::create_restricted(path, contents, mode);

    #[cfg(windows)]
    return windows::create_restricted(path, contents, mode);
}

/// Apply the permission bits exactly, regardless of umask
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    return unix::set_mode(path, mode);

    #[cfg(windows)]
    return windows::set_mode(path, mode);
}

/// Rename `from` over `to`, even when `to` was made read-only
pub fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    #[cfg(windows)]
    windows::clear_readonly(to);

    std::fs::rename(from, to)
}

/// Delete a file that may have been made read-only
pub fn remove_file(path: &Path) -> io::Result<()> {
    #[cfg(windows)]
    windows::clear_readonly(path);

    std::fs::remove_file(path)
}
