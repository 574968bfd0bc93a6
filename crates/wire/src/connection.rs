// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Framed packet transport
//!
//! Packets travel as a big-endian u32 length followed by a JSON body.
//! Frames are capped so a broken peer cannot make the daemon allocate
//! without bound.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::message::Packet;
use crate::{Address, Error};

/// Largest accepted frame body
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

pub enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Bind the configured address. An existing socket file is replaced;
    /// abstract names need no cleanup.
    pub async fn bind(address: &Address) -> Result<Self, Error> {
        match address {
            Address::Local(path) if path.starts_with('@') => {
                use std::os::linux::net::SocketAddrExt;

                let addr = std::os::unix::net::SocketAddr::from_abstract_name(&path.as_bytes()[1..])?;
                let listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
                listener.set_nonblocking(true)?;

                Ok(Listener::Unix(UnixListener::from_std(listener)?))
            }
            Address::Local(path) => {
                let path = Path::new(path);

                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
            Address::Inet4(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
            Address::Inet6(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    pub async fn accept(&self) -> Result<Connection, Error> {
        match self {
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection {
                    stream: Stream::Unix(stream),
                })
            }
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection {
                    stream: Stream::Tcp(stream),
                })
            }
        }
    }
}

pub struct Connection {
    stream: Stream,
}

impl Connection {
    pub async fn connect(address: &Address) -> Result<Self, Error> {
        let stream = match address {
            Address::Local(path) if path.starts_with('@') => {
                use std::os::linux::net::SocketAddrExt;

                let addr = std::os::unix::net::SocketAddr::from_abstract_name(&path.as_bytes()[1..])?;
                let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
                stream.set_nonblocking(true)?;

                Stream::Unix(UnixStream::from_std(stream)?)
            }
            Address::Local(path) => Stream::Unix(UnixStream::connect(path).await?),
            Address::Inet4(addr) => Stream::Tcp(TcpStream::connect(addr).await?),
            Address::Inet6(addr) => Stream::Tcp(TcpStream::connect(addr).await?),
        };

        Ok(Self { stream })
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), Error> {
        let body = serde_json::to_vec(packet)?;

        if body.len() > MAX_FRAME {
            return Err(Error::OversizedFrame {
                size: body.len(),
                limit: MAX_FRAME,
            });
        }

        self.stream.write_u32(body.len() as u32).await?;
        self.stream.write_all(&body).await?;
        self.stream.flush().await?;

        Ok(())
    }

    /// Read the next packet, or [`Error::Closed`] on clean EOF
    pub async fn receive(&mut self) -> Result<Packet, Error> {
        let size = match self.stream.read_u32().await {
            Ok(size) => size as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(Error::Closed),
            Err(e) => return Err(e.into()),
        };

        if size > MAX_FRAME {
            return Err(Error::OversizedFrame {
                size,
                limit: MAX_FRAME,
            });
        }

        let mut body = vec![0u8; size];
        self.stream.read_exact(&mut body).await?;

        Ok(serde_json::from_slice(&body)?)
    }
}

impl Connection {
    /// Split into independently usable halves so a server can stream
    /// events while it keeps reading requests
    pub fn into_split(self) -> (Receiver, Sender) {
        match self.stream {
            Stream::Unix(stream) => {
                let (read, write) = stream.into_split();
                (Receiver(ReadHalf::Unix(read)), Sender(WriteHalf::Unix(write)))
            }
            Stream::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (Receiver(ReadHalf::Tcp(read)), Sender(WriteHalf::Tcp(write)))
            }
        }
    }
}

pub struct Receiver(ReadHalf);

impl Receiver {
    pub async fn receive(&mut self) -> Result<Packet, Error> {
        let size = match read_u32_half(&mut self.0).await {
            Ok(size) => size as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(Error::Closed),
            Err(e) => return Err(e.into()),
        };

        if size > MAX_FRAME {
            return Err(Error::OversizedFrame {
                size,
                limit: MAX_FRAME,
            });
        }

        let mut body = vec![0u8; size];
        match &mut self.0 {
            ReadHalf::Unix(s) => s.read_exact(&mut body).await?,
            ReadHalf::Tcp(s) => s.read_exact(&mut body).await?,
        };

        Ok(serde_json::from_slice(&body)?)
    }
}

pub struct Sender(WriteHalf);

impl Sender {
    pub async fn send(&mut self, packet: &Packet) -> Result<(), Error> {
        let body = serde_json::to_vec(packet)?;

        if body.len() > MAX_FRAME {
            return Err(Error::OversizedFrame {
                size: body.len(),
                limit: MAX_FRAME,
            });
        }

        match &mut self.0 {
            WriteHalf::Unix(s) => {
                s.write_u32(body.len() as u32).await?;
                s.write_all(&body).await?;
                s.flush().await?;
            }
            WriteHalf::Tcp(s) => {
                s.write_u32(body.len() as u32).await?;
                s.write_all(&body).await?;
                s.flush().await?;
            }
        }

        Ok(())
    }
}

enum ReadHalf {
    Unix(tokio::net::unix::OwnedReadHalf),
    Tcp(tokio::net::tcp::OwnedReadHalf),
}

enum WriteHalf {
    Unix(tokio::net::unix::OwnedWriteHalf),
    Tcp(tokio::net::tcp::OwnedWriteHalf),
}

async fn read_u32_half(half: &mut ReadHalf) -> std::io::Result<u32> {
    match half {
        ReadHalf::Unix(s) => s.read_u32().await,
        ReadHalf::Tcp(s) => s.read_u32().await,
    }
}

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    async fn write_u32(&mut self, value: u32) -> std::io::Result<()> {
        match self {
            Stream::Unix(s) => s.write_u32(value).await,
            Stream::Tcp(s) => s.write_u32(value).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Unix(s) => s.write_all(buf).await,
            Stream::Tcp(s) => s.write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush().await,
            Stream::Tcp(s) => s.flush().await,
        }
    }

    async fn read_u32(&mut self) -> std::io::Result<u32> {
        match self {
            Stream::Unix(s) => s.read_u32().await,
            Stream::Tcp(s) => s.read_u32().await,
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Stream::Unix(s) => s.read_exact(buf).await.map(|_| ()),
            Stream::Tcp(s) => s.read_exact(buf).await.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Procedure, Request};

    #[tokio::test]
    async fn unix_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::Local(dir.path().join("test.sock").to_string_lossy().into_owned());

        let listener = Listener::bind(&address).await.unwrap();

        let client = tokio::spawn({
            let address = address.clone();
            async move {
                let mut connection = Connection::connect(&address).await.unwrap();
                connection
                    .send(&Packet::Request(Request {
                        id: 1,
                        procedure: Procedure::DestroyContainer {
                            container_id: "x".into(),
                        },
                    }))
                    .await
                    .unwrap();
            }
        });

        let mut server_side = listener.accept().await.unwrap();
        let packet = server_side.receive().await.unwrap();

        assert!(matches!(
            packet,
            Packet::Request(Request {
                id: 1,
                procedure: Procedure::DestroyContainer { .. }
            })
        ));

        client.await.unwrap();
    }

    #[tokio::test]
    async fn clean_eof_reports_closed() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::Local(dir.path().join("test.sock").to_string_lossy().into_owned());

        let listener = Listener::bind(&address).await.unwrap();

        let client = tokio::spawn({
            let address = address.clone();
            async move {
                let _connection = Connection::connect(&address).await.unwrap();
            }
        });

        let mut server_side = listener.accept().await.unwrap();
        client.await.unwrap();

        assert!(matches!(server_side.receive().await, Err(Error::Closed)));
    }
}
