//! Unix implementation

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs::{OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use tokio::process::Child;

pub fn terminate(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };

    signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
}

pub fn create_restricted(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .custom_flags(nix::libc::O_NOFOLLOW)
        .open(path)?;

    file.write_all(contents)?;
    file.sync_all()
}

pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    std::fs::set_permissions(path, Permissions::from_mode(mode))
}
