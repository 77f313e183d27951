//! PID-file based single-instance lock.
//!
//! The file is created with O_EXCL; a leftover file whose process is no
//! longer alive is reaped and recreated.

use anyhow::{Context, Result, bail};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::io::Write;
use std::path::Path;

pub fn write_pid(path: &Path) -> Result<()> {
    match create_exclusive(path) {
        Ok(mut file) => {
            writeln!(file, "{}", std::process::id()).context("write pid")?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if !clean_stale_pid(path) {
                bail!("daemon already running (pid file {} exists)", path.display());
            }
            let mut file =
                create_exclusive(path).context("create pid file after stale cleanup")?;
            writeln!(file, "{}", std::process::id()).context("write pid")?;
            Ok(())
        }
        Err(e) => Err(e).context("create pid file"),
    }
}

fn create_exclusive(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}

pub fn read_pid(path: &Path) -> Result<i32> {
    let data = std::fs::read_to_string(path).context("read pid file")?;
    data.trim().parse().context("parse pid")
}

pub fn is_running(path: &Path) -> bool {
    read_pid(path).map(process_alive).unwrap_or(false)
}

pub fn remove_pid(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Signal 0 probes for existence without touching the process.
pub fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Returns true when a stale pid file was removed.
fn clean_stale_pid(path: &Path) -> bool {
    match read_pid(path) {
        Ok(pid) if process_alive(pid) => false,
        _ => {
            let _ = std::fs::remove_file(path);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.pid");

        write_pid(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), std::process::id() as i32);
        assert!(is_running(&path));

        remove_pid(&path);
        assert!(!path.exists());
    }

    #[test]
    fn second_write_while_alive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.pid");

        write_pid(&path).unwrap();
        let err = write_pid(&path).unwrap_err();
        assert!(err.to_string().contains("already running"), "{err}");
    }

    #[test]
    fn stale_pid_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.pid");

        // A pid that can't be a live process.
        std::fs::write(&path, "999999999\n").unwrap();
        assert!(!is_running(&path));

        write_pid(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), std::process::id() as i32);
    }

    #[test]
    fn garbage_pid_file_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mender.pid");
        std::fs::write(&path, "not a pid\n").unwrap();
        write_pid(&path).unwrap();
        assert!(is_running(&path));
    }
}
