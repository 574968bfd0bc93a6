// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Tree section records
//!
//! The tree section is a flat, depth-first sequence of entry records.
//! Directories precede their children so unpacking can create them on
//! first sight. Regular file content is inlined after the record header.

use std::io::{Read, Write};

use crate::{DecodeError, EncodeError, ReadExt, WriteExt};

/// Section header preceding the entry records. When a filter feature is
/// present in the pack, everything after this header is run through the
/// codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub num_entries: u32,
}

impl Section {
    pub fn decode<R: Read>(mut reader: R) -> Result<Self, DecodeError> {
        Ok(Self {
            num_entries: reader.read_u32()?,
        })
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32(self.num_entries)?;

        Ok(())
    }
}

/// A single install-image entry. Paths are relative to the image root,
/// `/` separated. Symlink targets are recorded verbatim, never resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File {
        path: String,
        mode: u32,
        size: u64,
    },
    Directory {
        path: String,
        mode: u32,
    },
    Symlink {
        path: String,
        target: String,
    },
}

impl Entry {
    pub fn path(&self) -> &str {
        match self {
            Entry::File { path, .. } | Entry::Directory { path, .. } | Entry::Symlink { path, .. } => path,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Entry::File { .. } => 1,
            Entry::Directory { .. } => 2,
            Entry::Symlink { .. } => 3,
        }
    }

    /// Decode the record header. For [`Entry::File`] the caller is expected
    /// to consume `size` content bytes from the reader before decoding the
    /// next record.
    pub fn decode<R: Read>(mut reader: R) -> Result<Self, DecodeError> {
        let kind = reader.read_u8()?;
        let mode = reader.read_u32()?;
        let path_length = reader.read_u16()? as usize;
        let target_length = reader.read_u16()? as usize;
        let size = reader.read_u64()?;

        let path = reader.read_string(path_length).map_err(|_| DecodeError::MalformedPath)?;

        match kind {
            1 => Ok(Entry::File { path, mode, size }),
            2 => Ok(Entry::Directory { path, mode }),
            3 => {
                let target = reader
                    .read_string(target_length)
                    .map_err(|_| DecodeError::MalformedPath)?;
                Ok(Entry::Symlink { path, target })
            }
            k => Err(DecodeError::UnknownEntryKind(k)),
        }
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let (mode, size, target) = match self {
            Entry::File { mode, size, .. } => (*mode, *size, None),
            Entry::Directory { mode, .. } => (*mode, 0, None),
            Entry::Symlink { target, .. } => (0o777, 0, Some(target.as_str())),
        };

        writer.write_u8(self.kind())?;
        writer.write_u32(mode)?;
        writer.write_u16(self.path().len() as u16)?;
        writer.write_u16(target.map(str::len).unwrap_or_default() as u16)?;
        writer.write_u64(size)?;
        writer.write_all(self.path().as_bytes())?;
        if let Some(target) = target {
            writer.write_all(target.as_bytes())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() {
        let entries = [
            Entry::Directory {
                path: "bin".into(),
                mode: 0o755,
            },
            Entry::File {
                path: "bin/sh".into(),
                mode: 0o755,
                size: 42,
            },
            Entry::Symlink {
                path: "bin/dash".into(),
                target: "sh".into(),
            },
        ];

        for entry in entries {
            let mut bytes = vec![];
            entry.encode(&mut bytes).unwrap();
            assert_eq!(Entry::decode(bytes.as_slice()).unwrap(), entry);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = vec![];
        Entry::Directory {
            path: "x".into(),
            mode: 0o755,
        }
        .encode(&mut bytes)
        .unwrap();
        bytes[0] = 9;

        assert!(matches!(
            Entry::decode(bytes.as_slice()),
            Err(DecodeError::UnknownEntryKind(9))
        ));
    }
}
