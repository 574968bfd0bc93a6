// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    thread,
};

use fs_err as fs;

pub fn ensure_dir_exists(path: &Path) -> Result<(), io::Error> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

pub fn recreate_dir(path: &Path) -> Result<(), io::Error> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)?;
    Ok(())
}

/// Recursively copy `source_dir` into `out_dir`, preserving symlinks
pub fn copy_dir(source_dir: &Path, out_dir: &Path) -> Result<(), io::Error> {
    ensure_dir_exists(out_dir)?;

    for entry in fs::read_dir(source_dir)? {
        let entry = entry?;
        let path = entry.path();

        if let Some(file_name) = path.file_name() {
            let dest = out_dir.join(file_name);
            let meta = entry.path().symlink_metadata()?;

            if meta.is_dir() {
                copy_dir(&path, &dest)?;
            } else if meta.is_symlink() {
                let target = fs::read_link(&path)?;
                if dest.symlink_metadata().is_ok() {
                    fs::remove_file(&dest)?;
                }
                std::os::unix::fs::symlink(target, &dest)?;
            } else {
                fs::copy(&path, &dest)?;
            }
        }
    }

    Ok(())
}

/// Every file under `dir` (recursive) whose path satisfies `matcher`
pub fn enumerate_files<'a>(
    dir: &'a Path,
    matcher: impl Fn(&Path) -> bool + Copy + 'a,
) -> Result<Vec<PathBuf>, io::Error> {
    let read_dir = fs::read_dir(dir)?;

    let mut paths = vec![];

    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;

        if meta.is_dir() {
            paths.extend(enumerate_files(&path, matcher)?);
        } else if matcher(&path) {
            paths.push(path);
        }
    }

    Ok(paths)
}

pub fn num_cpus() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or_else(|_| NonZeroUsize::new(1).unwrap())
}

pub fn is_root() -> bool {
    use nix::unistd::Uid;

    Uid::effective().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_dir_preserves_structure() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        fs::create_dir_all(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/file"), b"content").unwrap();
        std::os::unix::fs::symlink("sub/file", src.path().join("link")).unwrap();

        copy_dir(src.path(), dst.path()).unwrap();

        assert_eq!(fs::read(dst.path().join("sub/file")).unwrap(), b"content");
        assert_eq!(fs::read_link(dst.path().join("link")).unwrap(), PathBuf::from("sub/file"));
    }

    #[test]
    fn enumerate_files_filters() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/x.log"), b"").unwrap();
        fs::write(dir.path().join("a/b/y.log"), b"").unwrap();
        fs::write(dir.path().join("a/b/z.txt"), b"").unwrap();

        let logs = enumerate_files(dir.path(), |p| {
            p.extension().and_then(|e| e.to_str()) == Some("log")
        })
        .unwrap();

        assert_eq!(logs.len(), 2);
    }
}
