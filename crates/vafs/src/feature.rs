// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Typed metadata features carried in the pack feature table
//!
//! Each feature is identified by a 16 byte id followed by a sized payload,
//! so readers can skip features they do not recognize.

use std::io::{Read, Write};

use crate::{DecodeError, EncodeError, ReadExt, WriteExt};

/// Package type + metadata strings + command manifest
pub const FEATURE_PACKAGE_HEADER: [u8; 16] = [
    0x2f, 0x8a, 0x1c, 0x5e, 0x30, 0x41, 0x4d, 0x92, 0xb5, 0x0a, 0x6c, 0x27, 0xee, 0x01, 0x84, 0x5d,
];

/// Entry counts for the install image
pub const FEATURE_OVERVIEW: [u8; 16] = [
    0xc1, 0x53, 0x9e, 0x70, 0xa2, 0x11, 0x46, 0x3b, 0x8f, 0x5d, 0x41, 0xb8, 0x02, 0x97, 0xcd, 0x26,
];

/// Compression codec applied to the tree section
pub const FEATURE_FILTER: [u8; 16] = [
    0x7d, 0x0b, 0x62, 0xf4, 0x19, 0xd8, 0x4a, 0x07, 0x9c, 0xe3, 0x55, 0x60, 0x38, 0xaf, 0x12, 0xe9,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feature {
    Package(PackageInfo),
    Overview(Overview),
    Filter(Filter),
}

impl Feature {
    pub fn id(&self) -> [u8; 16] {
        match self {
            Feature::Package(_) => FEATURE_PACKAGE_HEADER,
            Feature::Overview(_) => FEATURE_OVERVIEW,
            Feature::Filter(_) => FEATURE_FILTER,
        }
    }

    pub fn decode<R: Read>(mut reader: R) -> Result<Self, DecodeError> {
        let id = reader.read_array::<16>()?;
        let size = reader.read_u32()? as usize;
        let payload = reader.read_vec(size)?;
        let mut payload = payload.as_slice();

        match id {
            FEATURE_PACKAGE_HEADER => Ok(Feature::Package(PackageInfo::decode(&mut payload)?)),
            FEATURE_OVERVIEW => Ok(Feature::Overview(Overview::decode(&mut payload)?)),
            FEATURE_FILTER => Ok(Feature::Filter(Filter::decode(&mut payload)?)),
            _ => Err(DecodeError::UnknownFeature(id)),
        }
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let mut payload = vec![];

        match self {
            Feature::Package(info) => info.encode(&mut payload)?,
            Feature::Overview(overview) => overview.encode(&mut payload)?,
            Feature::Filter(filter) => filter.encode(&mut payload)?,
        }

        writer.write_array(self.id())?;
        writer.write_u32(payload.len() as u32)?;
        writer.write_all(&payload)?;

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
#[repr(u8)]
pub enum PackageKind {
    Application = 1,
    Ingredient,
    Toolchain,
}

/// How an installed command is launched by `served`
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
#[repr(u8)]
pub enum CommandKind {
    Executable = 1,
    Daemon,
}

/// One entry of a pack's command manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub kind: CommandKind,
    /// Executable path relative to the install root
    pub path: String,
    pub arguments: String,
    pub icon: String,
    /// Command is allowed to resolve libraries from the host system
    pub system_libraries: bool,
}

impl Command {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let kind = match reader.read_u8()? {
            1 => CommandKind::Executable,
            2 => CommandKind::Daemon,
            k => return Err(DecodeError::UnknownEntryKind(k)),
        };
        let system_libraries = reader.read_u8()? != 0;
        let name = read_str(reader)?;
        let path = read_str(reader)?;
        let arguments = read_str(reader)?;
        let icon = read_str(reader)?;

        Ok(Self {
            name,
            kind,
            path,
            arguments,
            icon,
            system_libraries,
        })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(self.kind as u8)?;
        writer.write_u8(self.system_libraries as u8)?;
        write_str(writer, &self.name)?;
        write_str(writer, &self.path)?;
        write_str(writer, &self.arguments)?;
        write_str(writer, &self.icon)?;

        Ok(())
    }
}

/// The typed package header feature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub kind: PackageKind,
    pub name: String,
    pub version: String,
    pub summary: String,
    pub license: String,
    pub author: String,
    pub homepage: String,
    pub commands: Vec<Command>,
}

impl PackageInfo {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let kind = match reader.read_u8()? {
            1 => PackageKind::Application,
            2 => PackageKind::Ingredient,
            3 => PackageKind::Toolchain,
            k => return Err(DecodeError::UnknownEntryKind(k)),
        };
        let name = read_str(reader)?;
        let version = read_str(reader)?;
        let summary = read_str(reader)?;
        let license = read_str(reader)?;
        let author = read_str(reader)?;
        let homepage = read_str(reader)?;

        let num_commands = reader.read_u16()? as usize;
        let mut commands = Vec::with_capacity(num_commands);
        for _ in 0..num_commands {
            commands.push(Command::decode(reader)?);
        }

        Ok(Self {
            kind,
            name,
            version,
            summary,
            license,
            author,
            homepage,
            commands,
        })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(self.kind as u8)?;
        write_str(writer, &self.name)?;
        write_str(writer, &self.version)?;
        write_str(writer, &self.summary)?;
        write_str(writer, &self.license)?;
        write_str(writer, &self.author)?;
        write_str(writer, &self.homepage)?;

        writer.write_u16(self.commands.len() as u16)?;
        for command in &self.commands {
            command.encode(writer)?;
        }

        Ok(())
    }
}

/// Entry counts recorded at pack time so consumers can size progress
/// reporting without walking the tree section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Overview {
    pub num_files: u32,
    pub num_directories: u32,
    pub num_symlinks: u32,
}

impl Overview {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(Self {
            num_files: reader.read_u32()?,
            num_directories: reader.read_u32()?,
            num_symlinks: reader.read_u32()?,
        })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32(self.num_files)?;
        writer.write_u32(self.num_directories)?;
        writer.write_u32(self.num_symlinks)?;

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Codec {
    #[default]
    Zstd = 1,
}

/// Registers a codec for the tree section. The plain size is recorded so
/// decoders know the content size up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub codec: Codec,
    pub plain_size: u64,
    pub stored_size: u64,
}

impl Filter {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let codec = match reader.read_u8()? {
            1 => Codec::Zstd,
            k => return Err(DecodeError::UnknownEntryKind(k)),
        };

        Ok(Self {
            codec,
            plain_size: reader.read_u64()?,
            stored_size: reader.read_u64()?,
        })
    }

    fn encode<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(self.codec as u8)?;
        writer.write_u64(self.plain_size)?;
        writer.write_u64(self.stored_size)?;

        Ok(())
    }
}

fn read_str<R: Read>(reader: &mut R) -> Result<String, DecodeError> {
    let length = reader.read_u16()? as usize;
    Ok(reader.read_string(length)?)
}

fn write_str<W: Write>(writer: &mut W, s: &str) -> Result<(), EncodeError> {
    writer.write_u16(s.len() as u16)?;
    writer.write_all(s.as_bytes())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_info_roundtrip() {
        let info = PackageInfo {
            kind: PackageKind::Application,
            name: "editor".into(),
            version: "2.1.0".into(),
            summary: "A text editor".into(),
            license: "MIT".into(),
            author: "chef".into(),
            homepage: "https://example.org".into(),
            commands: vec![Command {
                name: "edit".into(),
                kind: CommandKind::Executable,
                path: "bin/edit".into(),
                arguments: "${args}".into(),
                icon: String::new(),
                system_libraries: false,
            }],
        };

        let mut bytes = vec![];
        Feature::Package(info.clone()).encode(&mut bytes).unwrap();

        let Feature::Package(decoded) = Feature::decode(bytes.as_slice()).unwrap() else {
            panic!("wrong feature decoded");
        };
        assert_eq!(decoded, info);
    }

    #[test]
    fn unknown_feature_is_rejected() {
        let mut bytes = vec![0xAB; 16];
        bytes.extend(0u32.to_be_bytes());

        assert!(matches!(
            Feature::decode(bytes.as_slice()),
            Err(DecodeError::UnknownFeature(_))
        ));
    }
}
