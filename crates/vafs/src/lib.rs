// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Reading and writing of the VaFs pack archive format
//!
//! A pack is a single file carrying an install image plus typed metadata
//! features. The file starts with a fixed header, followed by a feature
//! table, followed by a tree section holding every entry of the install
//! image (with regular file content inlined). When the filter feature is
//! present the tree section is zstd compressed.

use std::io::{self, Read, Write};

pub use self::feature::{Codec, Command, CommandKind, Feature, Filter, Overview, PackageInfo, PackageKind};
pub use self::read::Reader;
pub use self::tree::Entry;
pub use self::write::Writer;

pub mod feature;
pub mod read;
pub mod tree;
pub mod write;

/// `VaFs` in ASCII
pub const MAGIC: u32 = 0x5661_4673;

/// Format version emitted by [`Writer`] and required by [`Reader`]
pub const VERSION: u32 = 1;

/// Fixed file header at offset zero of every pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub num_features: u16,
}

impl Header {
    /// Encoded size in bytes, including the magic
    pub const SIZE: usize = 4 + 4 + 2 + 6;

    pub fn decode<R: Read>(mut reader: R) -> Result<Self, DecodeError> {
        let magic = reader.read_u32()?;
        if magic != MAGIC {
            return Err(DecodeError::Magic(magic));
        }

        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(DecodeError::Version(version));
        }

        let num_features = reader.read_u16()?;
        let _reserved = reader.read_array::<6>()?;

        Ok(Self { version, num_features })
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32(MAGIC)?;
        writer.write_u32(self.version)?;
        writer.write_u16(self.num_features)?;
        writer.write_array([0; 6])?;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unrecognized magic: {0:#10x}")]
    Magic(u32),
    #[error("unsupported format version: {0}")]
    Version(u32),
    #[error("unknown feature id: {0:x?}")]
    UnknownFeature([u8; 16]),
    #[error("feature payload truncated")]
    TruncatedFeature,
    #[error("unknown entry kind: {0}")]
    UnknownEntryKind(u8),
    #[error("entry path is not valid utf-8")]
    MalformedPath,
    #[error("io")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("io")]
    Io(#[from] io::Error),
}

pub(crate) trait ReadExt: Read {
    fn read_u8(&mut self) -> io::Result<u8> {
        Ok(u8::from_be_bytes(self.read_array()?))
    }

    fn read_u16(&mut self) -> io::Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> io::Result<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    fn read_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut bytes = [0u8; N];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn read_vec(&mut self, length: usize) -> io::Result<Vec<u8>> {
        let mut bytes = vec![0u8; length];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn read_string(&mut self, length: usize) -> io::Result<String> {
        String::from_utf8(self.read_vec(length)?).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<R: Read> ReadExt for R {}

pub(crate) trait WriteExt: Write {
    fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.write_array(value.to_be_bytes())
    }

    fn write_u16(&mut self, value: u16) -> io::Result<()> {
        self.write_array(value.to_be_bytes())
    }

    fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.write_array(value.to_be_bytes())
    }

    fn write_u64(&mut self, value: u64) -> io::Result<()> {
        self.write_array(value.to_be_bytes())
    }

    fn write_array<const N: usize>(&mut self, bytes: [u8; N]) -> io::Result<()> {
        self.write_all(&bytes)
    }
}

impl<W: Write> WriteExt for W {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header {
            version: VERSION,
            num_features: 3,
        };

        let mut bytes = vec![];
        header.encode(&mut bytes).unwrap();
        assert_eq!(bytes.len(), Header::SIZE);

        let decoded = Header::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let header = Header {
            version: VERSION,
            num_features: 0,
        };

        let mut bytes = vec![];
        header.encode(&mut bytes).unwrap();
        bytes[0] ^= 0xFF;

        assert!(matches!(Header::decode(bytes.as_slice()), Err(DecodeError::Magic(_))));
    }

    #[test]
    fn header_rejects_future_version() {
        let mut bytes = vec![];
        Header {
            version: VERSION,
            num_features: 0,
        }
        .encode(&mut bytes)
        .unwrap();
        // Bump the encoded version field
        bytes[7] += 1;

        assert!(matches!(Header::decode(bytes.as_slice()), Err(DecodeError::Version(_))));
    }
}
