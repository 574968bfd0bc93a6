// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Pack reading and unpacking

use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use fs_err as fs;

use crate::feature::{Feature, Filter, Overview, PackageInfo};
use crate::tree::{Entry, Section};
use crate::{DecodeError, Header};

pub struct Reader<R: Read> {
    header: Header,
    features: Vec<Feature>,
    section: Section,
    body: Body<R>,
    remaining: u32,
    /// Unconsumed content bytes of the last yielded file entry
    pending: u64,
}

impl Reader<BufReader<fs::File>> {
    /// Open a pack from the filesystem
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::new(BufReader::new(fs::File::open(path.as_ref())?))
    }
}

impl<R: Read> Reader<R> {
    /// Parse the header and feature table. If a filter feature is present
    /// the matching decode codec is set up for the tree section.
    pub fn new(mut reader: R) -> Result<Self, Error> {
        let header = Header::decode(&mut reader)?;

        let mut features = Vec::with_capacity(header.num_features as usize);
        for _ in 0..header.num_features {
            features.push(Feature::decode(&mut reader)?);
        }

        let section = Section::decode(&mut reader)?;

        let filtered = features.iter().any(|f| matches!(f, Feature::Filter(_)));
        let body = if filtered {
            Body::Zstd(zstd::stream::read::Decoder::new(reader)?)
        } else {
            Body::Plain(reader)
        };

        Ok(Self {
            header,
            features,
            remaining: section.num_entries,
            section,
            body,
            pending: 0,
        })
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn package(&self) -> Option<&PackageInfo> {
        self.features.iter().find_map(|f| match f {
            Feature::Package(info) => Some(info),
            _ => None,
        })
    }

    pub fn overview(&self) -> Option<Overview> {
        self.features.iter().find_map(|f| match f {
            Feature::Overview(overview) => Some(*overview),
            _ => None,
        })
    }

    pub fn filter(&self) -> Option<Filter> {
        self.features.iter().find_map(|f| match f {
            Feature::Filter(filter) => Some(*filter),
            _ => None,
        })
    }

    pub fn num_entries(&self) -> u32 {
        self.section.num_entries
    }

    /// Yield the next tree entry. For file entries the content must be
    /// drained through [`Reader::copy_content`] before the next call;
    /// unconsumed content is skipped.
    pub fn next_entry(&mut self) -> Result<Option<Entry>, Error> {
        if self.pending > 0 {
            io::copy(&mut (&mut self.body).take(self.pending), &mut io::sink())?;
            self.pending = 0;
        }

        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        let entry = Entry::decode(&mut self.body)?;
        if let Entry::File { size, .. } = &entry {
            self.pending = *size;
        }

        Ok(Some(entry))
    }

    /// Drain the current file entry's content into `writer`
    pub fn copy_content(&mut self, writer: &mut impl Write) -> Result<u64, Error> {
        let copied = io::copy(&mut (&mut self.body).take(self.pending), writer)?;
        self.pending -= copied;
        Ok(copied)
    }

    /// Recreate the install image under `dest`, preserving recorded
    /// permissions. Symlink targets are written verbatim.
    pub fn unpack(&mut self, dest: impl AsRef<Path>) -> Result<(), Error> {
        use std::os::unix::fs::{PermissionsExt, symlink};

        let dest = dest.as_ref();
        fs::create_dir_all(dest)?;

        while let Some(entry) = self.next_entry()? {
            let target = sanitized(dest, entry.path())?;

            match entry {
                Entry::Directory { mode, .. } => {
                    fs::create_dir_all(&target)?;
                    fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
                }
                Entry::File { mode, .. } => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let mut file = fs::File::create(&target)?;
                    self.copy_content(&mut file)?;
                    file.set_permissions(std::fs::Permissions::from_mode(mode))?;
                }
                Entry::Symlink { target: link, .. } => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    if target.symlink_metadata().is_ok() {
                        fs::remove_file(&target)?;
                    }
                    symlink(link, &target)?;
                }
            }
        }

        Ok(())
    }
}

/// Join `path` under `dest`, rejecting absolute paths and parent escapes
fn sanitized(dest: &Path, path: &str) -> Result<PathBuf, Error> {
    let relative = Path::new(path);

    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::UnsafePath(path.to_owned()));
    }

    Ok(dest.join(relative))
}

enum Body<R: Read> {
    Plain(R),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

impl<R: Read> Read for Body<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Body::Plain(r) => r.read(buf),
            Body::Zstd(r) => r.read(buf),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("decode")]
    Decode(#[from] DecodeError),
    #[error("entry path escapes the unpack root: {0}")]
    UnsafePath(String),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::feature::{PackageInfo, PackageKind};
    use crate::write::Writer;

    fn test_package() -> PackageInfo {
        PackageInfo {
            kind: PackageKind::Ingredient,
            name: "zlib".into(),
            version: "1.3.1".into(),
            summary: "compression library".into(),
            license: "Zlib".into(),
            author: String::new(),
            homepage: String::new(),
            commands: vec![],
        }
    }

    #[test]
    fn roundtrip_uncompressed() {
        roundtrip(false);
    }

    #[test]
    fn roundtrip_compressed() {
        roundtrip(true);
    }

    fn roundtrip(compress: bool) {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = Writer::new(&mut cursor, test_package(), compress).unwrap();
            writer.add_directory("usr", 0o755).unwrap();
            writer.add_directory("usr/lib", 0o755).unwrap();
            writer
                .add_file("usr/lib/libz.so.1.3.1", 0o644, 5, &mut "zirst".as_bytes())
                .unwrap();
            writer.add_symlink("usr/lib/libz.so.1", "libz.so.1.3.1").unwrap();
            writer.finish().unwrap();
        }

        let mut reader = Reader::new(Cursor::new(cursor.into_inner())).unwrap();

        assert_eq!(reader.package().unwrap().name, "zlib");
        assert_eq!(reader.filter().is_some(), compress);
        assert_eq!(reader.num_entries(), 4);

        let overview = reader.overview().unwrap();
        assert_eq!((overview.num_files, overview.num_directories, overview.num_symlinks), (1, 2, 1));

        let dest = tempfile::tempdir().unwrap();
        reader.unpack(dest.path()).unwrap();

        assert_eq!(fs::read_to_string(dest.path().join("usr/lib/libz.so.1.3.1")).unwrap(), "zirst");
        assert_eq!(
            fs::read_link(dest.path().join("usr/lib/libz.so.1")).unwrap(),
            PathBuf::from("libz.so.1.3.1")
        );
    }

    #[test]
    fn unpack_rejects_escaping_paths() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = Writer::new(&mut cursor, test_package(), false).unwrap();
            writer.add_file("../evil", 0o644, 1, &mut "x".as_bytes()).unwrap();
            writer.finish().unwrap();
        }

        let mut reader = Reader::new(Cursor::new(cursor.into_inner())).unwrap();
        let dest = tempfile::tempdir().unwrap();

        assert!(matches!(reader.unpack(dest.path()), Err(Error::UnsafePath(_))));
    }
}
