use std::{fs, os::fd::AsRawFd, path::Path};

use crate::error::RtmqError;

/// Advisory exclusive lock tied to the broker's run directory.
///
/// Two brokers configured with the same name (and hence the same socket
/// paths) would corrupt each other; the lock turns that misconfiguration
/// into an init failure. Released when the file handle drops.
pub(crate) struct ServerLock {
    _file: fs::File,
}

impl ServerLock {
    pub fn acquire(path: &Path) -> Result<Self, RtmqError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new().create(true).truncate(false).write(true).open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(RtmqError::Resource(format!(
                "server lock {} already held, is another broker running?",
                path.display()
            )));
        }
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let path = std::env::temp_dir().join(format!("rtmq_lock_{}", std::process::id()));
        let first = ServerLock::acquire(&path).unwrap();
        assert!(ServerLock::acquire(&path).is_err());
        drop(first);
        let _second = ServerLock::acquire(&path).unwrap();
        let _ = fs::remove_file(&path);
    }
}
