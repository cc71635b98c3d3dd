//! Windows implementation
//!
//! Windows has no mode bits, so a mode without owner-write maps to the
//! read-only attribute.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use tokio::process::Child;

pub fn terminate(child: &mut Child) -> io::Result<()> {
    match child.start_kill() {
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
}

pub fn create_restricted(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    set_mode(path, mode)
}

pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    std::fs::set_permissions(path, permissions)
}

pub fn clear_readonly(path: &Path) {
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut permissions = metadata.permissions();
        if permissions.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(false);
            let _ = std::fs::set_permissions(path, permissions);
        }
    }
}
