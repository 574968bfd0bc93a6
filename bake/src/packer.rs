// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Pack production
//!
//! Turns a kitchen's install tree into a distributable pack: included
//! ingredients are copied in by filter first, then the filtered install
//! image is written out with its package header, command manifest and
//! overview counts.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use glob::Pattern;
use recipe::Recipe;
use thiserror::Error;
use tracing::{debug, info};

use crate::Paths;

pub struct PackOptions {
    pub compress: bool,
}

/// Produce every pack the recipe declares. Returns the written pack
/// files.
pub fn pack(recipe: &Recipe, paths: &Paths, options: &PackOptions) -> Result<Vec<PathBuf>, Error> {
    // Ingredients marked for inclusion are copied into the install tree
    // before anything is archived
    for ingredient in recipe.ingredients.iter().filter(|i| i.include_in_pack) {
        let filters = compile_filters(&ingredient.filters)?;

        copy_filtered(
            &paths.build_ingredients().host,
            &paths.install().host,
            &filters,
        )?;
    }

    let mut written = vec![];

    for declaration in &recipe.packs {
        written.push(write_pack(recipe, paths, declaration, options)?);
    }

    Ok(written)
}

fn write_pack(
    recipe: &Recipe,
    paths: &Paths,
    declaration: &recipe::Pack,
    options: &PackOptions,
) -> Result<PathBuf, Error> {
    let output = paths
        .output_dir()
        .join(format!("{}-{}.pack", declaration.name, recipe.project.version));

    let info = package_info(recipe, declaration);
    let filters = compile_filters(&declaration.filters)?;

    let install = paths.install().host;
    let entries = select_entries(&install, &filters)?;

    let file = fs::File::create(&output)?;
    let mut writer = vafs::Writer::new(file.into_parts().0, info, options.compress)?;

    for entry in &entries {
        let relative = entry.strip_prefix(&install).expect("entry is under the install tree");
        writer.add_host_path(relative.to_string_lossy(), entry)?;
    }

    let overview = writer.finish()?;

    info!(
        "packed {} ({} files, {} dirs, {} symlinks)",
        output.display(),
        overview.num_files,
        overview.num_directories,
        overview.num_symlinks,
    );

    Ok(output)
}

fn package_info(recipe: &Recipe, declaration: &recipe::Pack) -> vafs::PackageInfo {
    vafs::PackageInfo {
        kind: match declaration.kind {
            recipe::PackKind::Application => vafs::PackageKind::Application,
            recipe::PackKind::Ingredient => vafs::PackageKind::Ingredient,
            recipe::PackKind::Toolchain => vafs::PackageKind::Toolchain,
        },
        name: declaration.name.clone(),
        version: recipe.project.version.clone(),
        summary: recipe.project.summary.clone().unwrap_or_default(),
        license: recipe.project.license.clone().unwrap_or_default(),
        author: recipe.project.author.clone().unwrap_or_default(),
        homepage: recipe.project.homepage.as_ref().map(ToString::to_string).unwrap_or_default(),
        commands: declaration
            .commands
            .iter()
            .map(|command| vafs::Command {
                name: command.name.clone(),
                kind: match command.kind {
                    recipe::CommandKind::Executable => vafs::CommandKind::Executable,
                    recipe::CommandKind::Daemon => vafs::CommandKind::Daemon,
                },
                path: command.path.to_string_lossy().into_owned(),
                arguments: command.arguments.clone(),
                icon: command.icon.clone(),
                system_libraries: command.system_libraries,
            })
            .collect(),
    }
}

fn compile_filters(filters: &[String]) -> Result<Vec<Pattern>, Error> {
    filters
        .iter()
        .map(|filter| {
            Pattern::new(filter).map_err(|source| Error::BadFilter {
                filter: filter.clone(),
                source,
            })
        })
        .collect()
}

/// Whether a relative path passes the filter set. An empty set includes
/// everything.
fn matched(relative: &Path, filters: &[Pattern]) -> bool {
    filters.is_empty() || filters.iter().any(|pattern| pattern.matches_path(relative))
}

/// The filtered install image: matched files and symlinks plus every
/// directory needed to hold them, depth-first so directories precede
/// their contents
fn select_entries(root: &Path, filters: &[Pattern]) -> Result<Vec<PathBuf>, Error> {
    let mut files = vec![];
    let mut dirs = BTreeSet::new();

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let meta = path.symlink_metadata()?;

            if meta.is_dir() {
                stack.push(path);
            } else {
                let relative = path.strip_prefix(root).expect("walk stays under root");
                if matched(relative, filters) {
                    for ancestor in relative.ancestors().skip(1) {
                        if !ancestor.as_os_str().is_empty() {
                            dirs.insert(root.join(ancestor));
                        }
                    }
                    files.push(path);
                }
            }
        }
    }

    files.sort();

    let mut entries: Vec<PathBuf> = dirs.into_iter().collect();
    entries.extend(files);
    entries.sort();

    debug!("selected {} entries", entries.len());

    Ok(entries)
}

/// Copy every filter-matched file from `source` into `dest`, preserving
/// relative paths
fn copy_filtered(source: &Path, dest: &Path, filters: &[Pattern]) -> Result<(), Error> {
    for path in crate::util::enumerate_files(source, |_| true)? {
        let relative = path.strip_prefix(source).expect("walk stays under source");

        if !matched(relative, filters) {
            continue;
        }

        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let meta = path.symlink_metadata()?;
        if meta.is_symlink() {
            let link = fs::read_link(&path)?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(&path, &target)?;
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid filter `{filter}`")]
    BadFilter {
        filter: String,
        source: glob::PatternError,
    },
    #[error("write pack")]
    Write(#[from] vafs::write::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_tree(root: &Path) {
        for (path, content) in [("bin/x", "x"), ("lib/y.so", "so"), ("lib/y.a", "a"), ("share/z", "z")] {
            let path = root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    #[test]
    fn filters_select_exactly_the_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        install_tree(dir.path());

        let filters = compile_filters(&["*.so".to_owned(), "bin/*".to_owned()]).unwrap();
        let entries = select_entries(dir.path(), &filters).unwrap();

        let relative: Vec<_> = entries
            .iter()
            .map(|e| e.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(relative, vec!["bin", "bin/x", "lib", "lib/y.so"]);
    }

    #[test]
    fn empty_filter_includes_everything() {
        let dir = tempfile::tempdir().unwrap();
        install_tree(dir.path());

        let entries = select_entries(dir.path(), &[]).unwrap();

        assert_eq!(entries.len(), 3 + 4);
    }

    #[test]
    fn bad_filter_is_rejected() {
        assert!(matches!(
            compile_filters(&["[unclosed".to_owned()]),
            Err(Error::BadFilter { .. })
        ));
    }

    #[test]
    fn copy_filtered_preserves_relative_paths() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        install_tree(source.path());

        let filters = compile_filters(&["*.so".to_owned()]).unwrap();
        copy_filtered(source.path(), dest.path(), &filters).unwrap();

        assert!(dest.path().join("lib/y.so").exists());
        assert!(!dest.path().join("lib/y.a").exists());
        assert!(!dest.path().join("bin/x").exists());
    }
}
