// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Pack creation
//!
//! The feature table is written up front with zeroed counters, then the
//! tree section is streamed out (optionally through zstd), then the
//! counters are patched in place. This keeps memory flat regardless of
//! the size of the install image.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs_err as fs;

use crate::feature::{Feature, Filter, Overview, PackageInfo};
use crate::tree::{Entry, Section};
use crate::{EncodeError, Header, VERSION, WriteExt};

const ZSTD_LEVEL: i32 = 6;

pub struct Writer<W: Write + Seek> {
    output: Body<W>,
    overview: Overview,
    plain_size: u64,
    tree_offset: u64,
    overview_offset: u64,
    filter_offset: Option<u64>,
}

impl<W: Write + Seek> Writer<W> {
    /// Begin a new pack. With `compress` set, a filter feature is recorded
    /// and the tree section is run through zstd.
    pub fn new(mut writer: W, package: PackageInfo, compress: bool) -> Result<Self, Error> {
        let num_features = if compress { 3 } else { 2 };

        Header {
            version: VERSION,
            num_features,
        }
        .encode(&mut writer)?;

        Feature::Package(package).encode(&mut writer)?;

        let overview_offset = writer.stream_position()?;
        Feature::Overview(Overview::default()).encode(&mut writer)?;

        let filter_offset = if compress {
            let offset = writer.stream_position()?;
            Feature::Filter(Filter {
                codec: Default::default(),
                plain_size: 0,
                stored_size: 0,
            })
            .encode(&mut writer)?;
            Some(offset)
        } else {
            None
        };

        // Entry count patched on finish
        Section { num_entries: 0 }.encode(&mut writer)?;

        let tree_offset = writer.stream_position()?;

        let output = if compress {
            let mut encoder = zstd::stream::write::Encoder::new(writer, ZSTD_LEVEL)?;
            encoder.multithread(num_cpus() as u32)?;
            Body::Zstd(encoder)
        } else {
            Body::Plain(writer)
        };

        Ok(Self {
            output,
            overview: Overview::default(),
            plain_size: 0,
            tree_offset,
            overview_offset,
            filter_offset,
        })
    }

    pub fn add_directory(&mut self, path: impl Into<String>, mode: u32) -> Result<(), Error> {
        self.write_entry(&Entry::Directory { path: path.into(), mode })?;
        self.overview.num_directories += 1;
        Ok(())
    }

    pub fn add_symlink(&mut self, path: impl Into<String>, target: impl Into<String>) -> Result<(), Error> {
        self.write_entry(&Entry::Symlink {
            path: path.into(),
            target: target.into(),
        })?;
        self.overview.num_symlinks += 1;
        Ok(())
    }

    pub fn add_file(
        &mut self,
        path: impl Into<String>,
        mode: u32,
        size: u64,
        content: &mut impl Read,
    ) -> Result<(), Error> {
        self.write_entry(&Entry::File {
            path: path.into(),
            mode,
            size,
        })?;

        let copied = io::copy(content, &mut self.output)?;
        if copied != size {
            return Err(Error::ContentSize {
                expected: size,
                actual: copied,
            });
        }
        self.plain_size += copied;
        self.overview.num_files += 1;

        Ok(())
    }

    /// Record a single host filesystem entry at `pack_path`. Regular files,
    /// directories and symlinks are supported; anything else is skipped.
    pub fn add_host_path(&mut self, pack_path: impl Into<String>, host: &Path) -> Result<(), Error> {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let meta = fs::symlink_metadata(host)?;
        let mode = meta.permissions().mode() & 0o7777;

        if meta.is_dir() {
            self.add_directory(pack_path, mode)
        } else if meta.is_symlink() {
            let target = fs::read_link(host)?;
            self.add_symlink(pack_path, target.to_string_lossy())
        } else if meta.is_file() {
            let mut file = fs::File::open(host)?;
            self.add_file(pack_path, mode, meta.size(), &mut file)
        } else {
            Ok(())
        }
    }

    /// Flush the tree section and patch the recorded counters. Returns the
    /// final [`Overview`].
    pub fn finish(self) -> Result<Overview, Error> {
        let mut writer = match self.output {
            Body::Plain(writer) => writer,
            Body::Zstd(encoder) => encoder.finish()?,
        };

        let end = writer.stream_position()?;
        let stored_size = end - self.tree_offset;

        writer.seek(SeekFrom::Start(self.overview_offset))?;
        Feature::Overview(self.overview).encode(&mut writer)?;

        if let Some(offset) = self.filter_offset {
            writer.seek(SeekFrom::Start(offset))?;
            Feature::Filter(Filter {
                codec: Default::default(),
                plain_size: self.plain_size,
                stored_size,
            })
            .encode(&mut writer)?;
        }

        // Section header sits right before the tree body
        let num_entries = self.overview.num_files + self.overview.num_directories + self.overview.num_symlinks;
        writer.seek(SeekFrom::Start(self.tree_offset - 4))?;
        writer.write_u32(num_entries)?;

        writer.seek(SeekFrom::Start(end))?;
        writer.flush()?;

        Ok(self.overview)
    }

    fn write_entry(&mut self, entry: &Entry) -> Result<(), Error> {
        let mut bytes = vec![];
        entry.encode(&mut bytes)?;
        self.output.write_all(&bytes)?;
        self.plain_size += bytes.len() as u64;
        Ok(())
    }
}

enum Body<W: Write + Seek> {
    Plain(W),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write + Seek> Write for Body<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Body::Plain(w) => w.write(buf),
            Body::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Body::Plain(w) => w.flush(),
            Body::Zstd(w) => w.flush(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(usize::from).unwrap_or(1)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("encode")]
    Encode(#[from] EncodeError),
    #[error("file content changed while packing: expected {expected} bytes, copied {actual}")]
    ContentSize { expected: u64, actual: u64 },
    #[error("io")]
    Io(#[from] io::Error),
}
