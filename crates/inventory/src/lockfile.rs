// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{fs::File, io, os::fd::AsRawFd, path::PathBuf, sync::Arc};

use nix::fcntl::{flock, FlockArg};

/// An acquired advisory lock over the inventory state file.
///
/// Released once every clone has been dropped.
#[derive(Debug, Clone)]
#[allow(unused)]
pub struct Lock(Arc<File>);

/// Acquire an exclusive advisory lock at `path`, blocking until any other
/// holder releases it.
pub fn acquire(path: impl Into<PathBuf>) -> Result<Lock, Error> {
    let path = path.into();

    let file = File::options().create(true).write(true).truncate(false).open(path)?;

    flock(file.as_raw_fd(), FlockArg::LockExclusive)?;

    Ok(Lock(Arc::new(file)))
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("obtaining exclusive file lock")]
    Flock(#[from] nix::errno::Errno),
}
