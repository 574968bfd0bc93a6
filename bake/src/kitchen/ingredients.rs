// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Ingredient resolution and staging
//!
//! Ingredients resolve against the local inventory first, then the
//! remote registry. Fetched packs are verified against their proof chain
//! before they are cached. Toolchain packs unpack under the toolchain
//! area keyed by name; everything else lands in its area and is
//! registered with the package manager.

use std::path::{Path, PathBuf};

use inventory_store::{Inventory, Key};
use recipe::{Ingredient, IngredientSource, Recipe};
use thiserror::Error;
use tracing::{debug, info};

use super::pkgmngr;
use crate::{BuildEnv, Paths, runtime};

/// The user-scoped pack store
pub fn store_dir() -> Result<PathBuf, Error> {
    Ok(dirs::data_dir().ok_or(Error::NoDataDir)?.join("chef"))
}

pub fn setup(
    recipe: &Recipe,
    paths: &Paths,
    env: &mut BuildEnv,
    registry: Option<&url::Url>,
) -> Result<(), Error> {
    let store = store_dir()?;
    let mut inventory = Inventory::load(store.join("state.json"))?;

    let chroot = paths.rootfs().host;

    let areas: [(&[Ingredient], PathBuf); 3] = [
        // Host utilities go straight into the chroot
        (&recipe.ingredients.host, chroot.clone()),
        (&recipe.ingredients.build, paths.build_ingredients().host),
        (&recipe.ingredients.runtime, paths.runtime_ingredients().host),
    ];

    for (ingredients, area) in areas {
        for ingredient in ingredients {
            let pack_path = resolve(&mut inventory, &store, registry, ingredient, paths)?;
            stage(&pack_path, ingredient, &area, paths)?;
        }
    }

    // Build ingredients feed the compilers
    let manager = pkgmngr::by_tag("pkgconfig");
    manager.make_available(&chroot, &paths.build_ingredients().host)?;
    manager.add_overrides(env);

    let build_guest = paths.build_ingredients().guest;
    let build_guest = build_guest.display();
    env.append_path("CHEF_BUILD_PATH", format!("{build_guest}/usr/bin"));
    env.set("CHEF_BUILD_INCLUDE", format!("-I{build_guest}/usr/include"));
    env.set("CHEF_BUILD_LIBS", format!("-L{build_guest}/usr/lib"));
    env.set("CHEF_BUILD_CCFLAGS", format!("-I{build_guest}/usr/include"));
    env.set("CHEF_BUILD_LDFLAGS", format!("-L{build_guest}/usr/lib"));

    Ok(())
}

/// Locate the pack file for an ingredient, fetching and verifying it when
/// the inventory misses
fn resolve(
    inventory: &mut Inventory,
    store: &Path,
    registry: Option<&url::Url>,
    ingredient: &Ingredient,
    paths: &Paths,
) -> Result<PathBuf, Error> {
    match ingredient.source {
        IngredientSource::File => {
            let path = paths.output_dir().join(&ingredient.name);
            if !path.exists() {
                return Err(Error::Unresolved {
                    name: ingredient.name.clone(),
                });
            }
            Ok(path)
        }
        IngredientSource::Url => {
            let url: url::Url = ingredient.name.parse().map_err(|_| Error::Unresolved {
                name: ingredient.name.clone(),
            })?;

            let file_name = url.path().rsplit('/').next().unwrap_or("ingredient.pack").to_owned();
            let dest = store.join("packs").join(&file_name);

            if !dest.exists() {
                info!("fetching {url}");
                runtime::block_on(registry_client::download_url(&url, &dest))?;
            }

            Ok(dest)
        }
        IngredientSource::Repo => {
            let (publisher, package) = ingredient.split_repo_name()?;

            // Ingredients may pin a foreign platform/arch (cross builds),
            // otherwise the host identity applies
            let platform = ingredient.platform.as_deref().unwrap_or(paths.platform());
            let arch = ingredient.arch.as_deref().unwrap_or(paths.arch());

            let key = Key {
                publisher,
                package,
                platform,
                arch,
                channel: &ingredient.channel,
                revision: 0,
            };

            if let Some(revision) = inventory.latest_revision(key) {
                let cached = inventory
                    .get_pack(Key { revision, ..key })
                    .expect("latest revision is cached");
                debug!("{}/{} resolved from inventory (revision {revision})", publisher, package);
                return Ok(cached.path.clone());
            }

            let Some(endpoint) = registry else {
                return Err(Error::Unresolved {
                    name: ingredient.name.clone(),
                });
            };

            fetch_from_registry(inventory, store, endpoint, publisher, package, ingredient, platform, arch)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn fetch_from_registry(
    inventory: &mut Inventory,
    store: &Path,
    endpoint: &url::Url,
    publisher: &str,
    package: &str,
    ingredient: &Ingredient,
    platform: &str,
    arch: &str,
) -> Result<PathBuf, Error> {
    let client = registry_client::Client::new(endpoint.clone())?;

    let (metadata, proofs, pack_path) = runtime::block_on(async {
        let metadata = client
            .metadata(publisher, package, &ingredient.channel, platform, arch)
            .await?;

        let proofs = client.proofs(publisher, package, metadata.revision).await?;

        let dest = store
            .join("packs")
            .join(format!("{publisher}-{package}-{}.pack", metadata.revision));

        info!("fetching {publisher}/{package} revision {}", metadata.revision);
        client
            .download_pack(&metadata, &dest, |current, total| {
                debug!("{publisher}/{package}: {current}/{total} bytes");
            })
            .await?;

        Ok::<_, Error>((metadata, proofs, dest))
    })?;

    let root = proof::RootAuthority::compiled_in()?;
    proof::verify_package(&root, &proofs.publisher, &proofs.package, &pack_path)?;

    let pack = inventory.add(inventory_store::Pack {
        publisher: publisher.to_owned(),
        package: package.to_owned(),
        platform: metadata.platform,
        arch: metadata.arch,
        channel: metadata.channel,
        revision: metadata.revision,
        path: pack_path,
        added: inventory_store::timestamp(),
        unpacked: false,
    })?;

    Ok(pack.path.clone())
}

/// Unpack one resolved pack into its destination
fn stage(pack_path: &Path, ingredient: &Ingredient, area: &Path, paths: &Paths) -> Result<(), Error> {
    let mut reader = vafs::Reader::open(pack_path)?;

    let kind = reader.package().map(|p| p.kind);

    let dest = match kind {
        Some(vafs::PackageKind::Toolchain) => {
            let name = ingredient.name.rsplit('/').next().unwrap_or(&ingredient.name);
            paths.toolchains().host.join(name)
        }
        _ => area.to_path_buf(),
    };

    debug!("unpacking {} into {}", pack_path.display(), dest.display());
    reader.unpack(&dest)?;

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no user data directory available")]
    NoDataDir,
    #[error("cannot resolve ingredient `{name}`")]
    Unresolved { name: String },
    #[error("recipe")]
    Recipe(#[from] recipe::Error),
    #[error("inventory")]
    Inventory(#[from] inventory_store::Error),
    #[error("registry")]
    Registry(#[from] registry_client::Error),
    #[error("verification")]
    Verification(#[from] proof::Error),
    #[error("pack archive")]
    Archive(#[from] vafs::read::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample_paths(dir: &Path) -> Paths {
        let recipe = recipe::from_str(
            r"
id: 2b7e9d04-55aa-4b2f-8f10-77d0c5a1e633
name: sample
version: 1.0.0
parts:
  - name: sample
    steps:
      - name: build
        type: build
        system: make
",
        )
        .unwrap();
        let recipe_path = dir.join("recipe.yaml");
        fs_err::write(&recipe_path, "").unwrap();
        Paths::new(&recipe, &recipe_path, dir.join("home")).unwrap()
    }

    fn write_pack(path: &Path, kind: vafs::PackageKind) {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = vafs::Writer::new(
            &mut cursor,
            vafs::PackageInfo {
                kind,
                name: "zlib".into(),
                version: "1.3".into(),
                summary: String::new(),
                license: String::new(),
                author: String::new(),
                homepage: String::new(),
                commands: vec![],
            },
            false,
        )
        .unwrap();
        writer.add_directory("usr", 0o755).unwrap();
        writer.add_directory("usr/lib", 0o755).unwrap();
        writer.add_file("usr/lib/libz.so", 0o644, 2, &mut "zz".as_bytes()).unwrap();
        writer.finish().unwrap();

        fs_err::write(path, cursor.into_inner()).unwrap();
    }

    #[test]
    fn ingredient_packs_unpack_into_their_area() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sample_paths(dir.path());

        let pack = dir.path().join("zlib.pack");
        write_pack(&pack, vafs::PackageKind::Ingredient);

        let ingredient = recipe::Ingredient {
            name: "greenhouse/zlib".into(),
            channel: "stable".into(),
            version: None,
            platform: None,
            arch: None,
            source: IngredientSource::Repo,
            include_in_pack: false,
            filters: vec![],
        };

        let area = paths.build_ingredients().host;
        stage(&pack, &ingredient, &area, &paths).unwrap();

        assert!(area.join("usr/lib/libz.so").exists());
    }

    #[test]
    fn toolchain_packs_unpack_under_their_name() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sample_paths(dir.path());

        let pack = dir.path().join("gcc.pack");
        write_pack(&pack, vafs::PackageKind::Toolchain);

        let ingredient = recipe::Ingredient {
            name: "greenhouse/gcc-13".into(),
            channel: "stable".into(),
            version: None,
            platform: None,
            arch: None,
            source: IngredientSource::Repo,
            include_in_pack: false,
            filters: vec![],
        };

        stage(&pack, &ingredient, &paths.build_ingredients().host, &paths).unwrap();

        assert!(paths.toolchains().host.join("gcc-13/usr/lib/libz.so").exists());
    }

    #[test]
    fn pinned_platform_and_arch_key_the_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sample_paths(dir.path());
        let store = dir.path().join("store");
        let mut inventory = Inventory::load(store.join("state.json")).unwrap();

        inventory
            .add(inventory_store::Pack {
                publisher: "greenhouse".into(),
                package: "zlib".into(),
                platform: "vali".into(),
                arch: "arm64".into(),
                channel: "stable".into(),
                revision: 4,
                path: dir.path().join("zlib-4.pack"),
                added: 1_700_000_000,
                unpacked: false,
            })
            .unwrap();

        let mut ingredient = recipe::Ingredient {
            name: "greenhouse/zlib".into(),
            channel: "stable".into(),
            version: None,
            platform: Some("vali".into()),
            arch: Some("arm64".into()),
            source: IngredientSource::Repo,
            include_in_pack: false,
            filters: vec![],
        };

        let resolved = resolve(&mut inventory, &store, None, &ingredient, &paths).unwrap();
        assert_eq!(resolved, dir.path().join("zlib-4.pack"));

        // Without the pin, the host identity misses this cache entry
        ingredient.platform = None;
        ingredient.arch = None;
        assert!(matches!(
            resolve(&mut inventory, &store, None, &ingredient, &paths),
            Err(Error::Unresolved { .. })
        ));
    }

    #[test]
    fn file_ingredients_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let paths = sample_paths(dir.path());
        let store = dir.path().join("store");
        let mut inventory = Inventory::load(store.join("state.json")).unwrap();

        let ingredient = recipe::Ingredient {
            name: "missing.pack".into(),
            channel: "stable".into(),
            version: None,
            platform: None,
            arch: None,
            source: IngredientSource::File,
            include_in_pack: false,
            filters: vec![],
        };

        assert!(matches!(
            resolve(&mut inventory, &store, None, &ingredient, &paths),
            Err(Error::Unresolved { .. })
        ));
    }
}
