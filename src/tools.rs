//! Small filesystem helpers shared by the config loader, the history index,
//! and the overview backend: atomic whole-file writes and advisory-locked
//! file handles, both built on the same primitives the rest of the crate
//! uses for durability.

use anyhow::{bail, Error};
use nix::fcntl::{flock, FlockArg};
use nix::sys::stat;
use nix::unistd;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Write `data` to `path` atomically: create a sibling temp file, `fchmod`
/// it, write it, then `rename` over the destination. On any failure the
/// temp file is removed and the destination is left untouched.
pub fn file_set_contents<P: AsRef<Path>>(
    path: P,
    data: &[u8],
    perm: Option<stat::Mode>,
) -> Result<(), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };

    let tmp_path = tmp_path.as_path();

    let mode: stat::Mode = perm.unwrap_or_else(|| {
        stat::Mode::S_IRUSR | stat::Mode::S_IWUSR | stat::Mode::S_IRGRP | stat::Mode::S_IROTH
    });

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(tmp_path);
        bail!("fchmod {:?} failed: {}", tmp_path, err);
    }

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(tmp_path);
        bail!("write failed: {}", err);
    }

    if let Err(err) = file.sync_all() {
        let _ = unistd::unlink(tmp_path);
        bail!("fsync {:?} failed: {}", tmp_path, err);
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        bail!("atomic rename failed for file {:?} - {}", path, err);
    }

    Ok(())
}

/// Open (creating if necessary) and acquire an exclusive advisory lock on
/// `filename`, retrying with a short sleep until `timeout` seconds elapse.
/// Used for the dbz `.dir` writer lock and the overview header lock (§5:
/// "single writer under exclusive advisory lock, readers shared").
pub fn lock_file<P: AsRef<Path>>(filename: P, timeout: u64) -> Result<File, Error> {
    lock_file_inner(filename, timeout, FlockArg::LockExclusiveNonblock)
}

/// Same as [`lock_file`] but takes a shared (reader) lock.
pub fn lock_file_shared<P: AsRef<Path>>(filename: P, timeout: u64) -> Result<File, Error> {
    lock_file_inner(filename, timeout, FlockArg::LockSharedNonblock)
}

fn lock_file_inner<P: AsRef<Path>>(
    filename: P,
    timeout: u64,
    arg: FlockArg,
) -> Result<File, Error> {
    let path = filename.as_ref();
    let lockfile = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file,
        Err(err) => bail!("unable to open lock {:?} - {}", path, err),
    };

    let fd = lockfile.as_raw_fd();

    let now = std::time::SystemTime::now();
    let mut warned = false;
    loop {
        match flock(fd, arg) {
            Ok(_) => break,
            Err(_) => {
                if !warned {
                    warned = true;
                    log::warn!("waiting to acquire lock on {:?}", path);
                }
            }
        }

        match now.elapsed() {
            Ok(elapsed) if elapsed.as_secs() >= timeout => {
                bail!("unable to acquire lock {:?} - timed out", path);
            }
            Err(err) => bail!("unable to acquire lock {:?} - clock error - {}", path, err),
            _ => {}
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    Ok(lockfile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        file_set_contents(&path, b"hello", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn lock_file_excludes_a_second_nonblocking_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let _held = lock_file(&path, 5).unwrap();
        let fd2 = OpenOptions::new().create(true).append(true).open(&path).unwrap();
        let result = flock(fd2.as_raw_fd(), FlockArg::LockExclusiveNonblock);
        assert!(result.is_err());
    }
}
