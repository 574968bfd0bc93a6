// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-container control socket
//!
//! A started container's init parks on a unix socket pinned under
//! `/run/chef/cvd/containers/<id>`. Helpers connect to learn the init
//! pid (and from it, the namespace handles under procfs); the daemon
//! connects with a shutdown message to end the container.

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use fs_err as fs;
use snafu::{ResultExt, Snafu};

pub const SOCKET_DIR: &str = "/run/chef/cvd/containers";

const SHUTDOWN: u8 = 0xFF;
const QUERY_PID: u8 = 0x01;

pub fn socket_path(id: &str) -> PathBuf {
    PathBuf::from(SOCKET_DIR).join(id)
}

/// Bind the container's control socket. Called by the init before it
/// pivots away from the host filesystem.
pub fn bind_socket(id: &str) -> Result<UnixListener, Error> {
    fs::create_dir_all(SOCKET_DIR).context(IoSnafu)?;

    let path = socket_path(id);
    if path.exists() {
        fs::remove_file(&path).context(IoSnafu)?;
    }

    UnixListener::bind(&path).context(IoSnafu)
}

/// Park the init on its control socket, answering pid queries with the
/// host-visible pid until a shutdown message arrives
pub fn park(listener: UnixListener, host_pid: u32) -> Result<(), Error> {
    loop {
        let (mut stream, _) = listener.accept().context(IoSnafu)?;

        let mut message = [0u8; 1];
        if stream.read_exact(&mut message).is_err() {
            continue;
        }

        match message[0] {
            QUERY_PID => {
                let _ = stream.write_all(&host_pid.to_be_bytes());
            }
            SHUTDOWN => return Ok(()),
            _ => {}
        }
    }
}

/// Ask a parked container for its init pid as seen from this namespace
pub fn query_pid(id: &str) -> Result<u32, Error> {
    let mut stream = UnixStream::connect(socket_path(id)).context(ConnectSnafu)?;

    stream.write_all(&[QUERY_PID]).context(IoSnafu)?;

    let mut pid = [0u8; 4];
    stream.read_exact(&mut pid).context(IoSnafu)?;

    Ok(u32::from_be_bytes(pid))
}

/// Tell a parked container to exit. Absent sockets are fine, destruction
/// is idempotent.
pub fn shutdown(id: &str) -> Result<(), Error> {
    let mut stream = match UnixStream::connect(socket_path(id)) {
        Ok(stream) => stream,
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused) => return Ok(()),
        Err(e) => return Err(Error::Connect { source: e }),
    };

    stream.write_all(&[SHUTDOWN]).context(IoSnafu)?;

    Ok(())
}

/// Remove the socket path after the container exited
pub fn remove_socket(id: &str) -> Result<(), Error> {
    let path = socket_path(id);

    if path.exists() {
        fs::remove_file(path).context(IoSnafu)?;
    }

    Ok(())
}

/// Placeholder payload for parked containers; the park loop replaces it
pub fn never_run_payload() -> Result<(), std::convert::Infallible> {
    Ok(())
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("connect control socket"))]
    Connect { source: io::Error },
    #[snafu(display("io"))]
    Io { source: io::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_paths_are_per_container() {
        assert_eq!(socket_path("editor-2"), PathBuf::from("/run/chef/cvd/containers/editor-2"));
    }

    #[test]
    fn shutdown_of_absent_container_is_ok() {
        assert!(shutdown("never-existed").is_ok());
    }
}
