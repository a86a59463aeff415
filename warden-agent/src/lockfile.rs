//! Advisory `flock` locks shared by every warden process on the host
//!
//! The lock lives on an open file description: dropping the guard closes the
//! file and releases it. Two opens of the same path conflict even inside one
//! process.

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

fn open(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).read(true).write(true).open(path)
}

impl FileLock {
    /// Block until the exclusive lock is held
    pub fn exclusive(path: &Path) -> io::Result<Self> {
        let file = open(path)?;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusive) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// `Ok(None)` when another holder has it
    pub fn try_exclusive(path: &Path) -> io::Result<Option<Self>> {
        let file = open(path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(errno) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err(errno) => Err(errno.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }
}
