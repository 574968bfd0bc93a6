// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Kitchen lifecycle
//!
//! A kitchen is the fully materialized build environment for one recipe:
//! directory skeleton, environment list, exactly one live container, and
//! the checkpoint cache that lets interrupted builds resume where they
//! stopped.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use container::{Capability, Container, Instance};
use recipe::{Recipe, StepKind};
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::RecipeCache;
use crate::oven::{self, BackendData};
use crate::{BuildEnv, Paths, util};

pub mod ingredients;
pub mod pkgmngr;
pub mod rootfs;

pub struct SetupOptions {
    /// One-time user hook executed inside the container after ingredients
    pub hook: Option<String>,
    /// Allow network access during steps
    pub network: bool,
    /// Registry endpoint for resolving missing ingredients
    pub registry: Option<url::Url>,
}

pub struct Kitchen {
    recipe: Recipe,
    paths: Paths,
    env: BuildEnv,
    cache: RecipeCache,
    container: Option<Instance>,
}

impl Kitchen {
    /// Populate the directory skeleton and environment list for `recipe`
    pub fn initialize(recipe: Recipe, recipe_path: &Path, home: impl Into<PathBuf>) -> Result<Self, Error> {
        let paths = Paths::new(&recipe, recipe_path, home)?;
        let env = BuildEnv::new(&paths);
        let cache = RecipeCache::open(paths.recipe_cache())?;

        Ok(Self {
            recipe,
            paths,
            env,
            cache,
            container: None,
        })
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn env(&self) -> &BuildEnv {
        &self.env
    }

    /// Run every outstanding setup stage and step. Completed checkpoints
    /// are skipped; each stage commits its checkpoint only after the side
    /// effect finished.
    pub fn setup(&mut self, options: &SetupOptions) -> Result<(), Error> {
        if !self.cache.contains(keys::SETUP_ROOTFS) {
            rootfs::setup(&self.paths)?;
            self.checkpoint(keys::SETUP_ROOTFS)?;
        } else {
            debug!("rootfs checkpoint present, skipping");
        }

        if !self.cache.contains(keys::SETUP_INGREDIENTS) {
            ingredients::setup(&self.recipe, &self.paths, &mut self.env, options.registry.as_ref())?;
            self.checkpoint(keys::SETUP_INGREDIENTS)?;
        } else {
            debug!("ingredients checkpoint present, skipping");
        }

        if let Some(hook) = &options.hook {
            if !self.cache.contains(keys::SETUP_HOOK) {
                let hook = hook.clone();
                self.run_script(&hook, options.network)?;
                self.checkpoint(keys::SETUP_HOOK)?;
            }
        }

        for part in self.recipe.parts.clone() {
            for step in &part.steps {
                let key = keys::step(&part.name, &step.name);

                if self.cache.contains(&key) {
                    debug!("step {key} checkpointed, skipping");
                    continue;
                }

                info!("{} {}/{}", step.kind, part.name, step.name);
                self.run_step(step, options.network)?;
                self.checkpoint(&key)?;
            }
        }

        Ok(())
    }

    /// Clear one step's checkpoint and, transitively, every step that
    /// depends on it
    pub fn reset(&mut self, part_name: &str, step_name: &str) -> Result<(), Error> {
        let part = self
            .recipe
            .part(part_name)
            .ok_or_else(|| Error::UnknownStep(format!("{part_name}/{step_name}")))?;

        if !part.steps.iter().any(|s| s.name == step_name) {
            return Err(Error::UnknownStep(format!("{part_name}/{step_name}")));
        }

        // Transitive closure over reverse dependency edges
        let mut cleared = BTreeSet::from([step_name.to_owned()]);
        loop {
            let mut grew = false;

            for step in &part.steps {
                if cleared.contains(&step.name) {
                    continue;
                }
                if step.depends_on.iter().any(|dep| cleared.contains(dep)) {
                    cleared.insert(step.name.clone());
                    grew = true;
                }
            }

            if !grew {
                break;
            }
        }

        self.cache.begin()?;
        for name in &cleared {
            self.cache.unset(&keys::step(part_name, name))?;
        }
        self.cache.commit()?;

        info!("reset {} step(s) in {part_name}", cleared.len());

        Ok(())
    }

    /// Drop all step and hook checkpoints, keeping the rootfs and
    /// ingredient stages
    pub fn clear_steps(&mut self) -> Result<(), Error> {
        self.cache.begin()?;
        self.cache.unset(keys::SETUP_HOOK)?;
        for part in &self.recipe.parts {
            for step in &part.steps {
                self.cache.unset(&keys::step(&part.name, &step.name))?;
            }
        }
        self.cache.commit()?;

        Ok(())
    }

    /// Checkpoint state for each stage and step, for status display
    pub fn checkpoints(&self) -> Vec<(String, bool)> {
        let mut list = vec![
            (keys::SETUP_ROOTFS.to_owned(), self.cache.contains(keys::SETUP_ROOTFS)),
            (
                keys::SETUP_INGREDIENTS.to_owned(),
                self.cache.contains(keys::SETUP_INGREDIENTS),
            ),
        ];

        for part in &self.recipe.parts {
            for step in &part.steps {
                let key = keys::step(&part.name, &step.name);
                let present = self.cache.contains(&key);
                list.push((key, present));
            }
        }

        list
    }

    fn checkpoint(&mut self, key: &str) -> Result<(), Error> {
        self.cache.begin()?;
        self.cache.set(key, "done")?;
        self.cache.commit()?;
        Ok(())
    }

    /// The kitchen's single live container, created on first use
    fn container(&mut self, network: bool) -> Result<&Instance, Error> {
        if self.container.is_none() {
            let project = self.paths.project();
            let install = self.paths.install();
            let build = self.paths.build();
            let ingredients = self.paths.build_ingredients();
            let toolchains = self.paths.toolchains();

            let mut builder = Container::new(
                format!("bake-{}", self.recipe.project.id),
                self.paths.rootfs().host,
            )
            .hostname("chef")
            .work_dir(&build.guest)
            .bind_ro(&project.host, &project.guest)
            .bind_rw(&install.host, &install.guest)
            .bind_rw(&build.host, &build.guest)
            .bind_rw(&ingredients.host, &ingredients.guest)
            .bind_ro(&toolchains.host, &toolchains.guest)
            .ignore_host_sigint(true);

            if network {
                builder = builder.capability(Capability::Network);
            }

            self.container = Some(builder.start(None)?);
        }

        Ok(self.container.as_ref().expect("container was just started"))
    }

    fn run_script(&mut self, script: &str, network: bool) -> Result<(), Error> {
        let instance = self.container(network)?;

        let code = instance.script(script, |line| println!("{line}"))?;
        if code != 0 {
            return Err(Error::StepFailed { code });
        }

        Ok(())
    }

    fn run_step(&mut self, step: &recipe::Step, network: bool) -> Result<(), Error> {
        let data = self.backend_data(step);
        let script = oven::script_for(&step.system, &data)?;

        self.run_script(&script, network)
    }

    fn backend_data(&self, step: &recipe::Step) -> BackendData {
        let mut env = self.env.clone();
        for entry in &step.env {
            env.set(&entry.key, &entry.value);
        }

        BackendData {
            source_dir: self.paths.project().guest,
            build_dir: self.paths.build().guest,
            install_dir: self.paths.install().guest,
            toolchains_dir: self.paths.toolchains().guest,
            build_ingredients_dir: self.paths.build_ingredients().guest,
            platform: self.paths.platform().to_owned(),
            arch: self.paths.arch().to_owned(),
            recipe_name: self.recipe.project.name.clone(),
            arguments: step.arguments.clone(),
            env,
            in_tree: step.options.in_tree,
            parallel: step.options.parallel && step.kind != StepKind::Generate,
            jobs: util::num_cpus().get(),
        }
    }

    /// Stop the live container, if any
    pub fn teardown(&mut self) -> Result<(), Error> {
        if let Some(mut instance) = self.container.take() {
            instance.destroy(None)?;
        }
        Ok(())
    }

    /// Remove build state, keeping fetched ingredients
    pub fn clean(&mut self) -> Result<(), Error> {
        self.teardown()?;

        util::recreate_dir(&self.paths.build().host)?;
        util::recreate_dir(&self.paths.install().host)?;
        self.clear_steps()?;

        Ok(())
    }

    /// Delete the whole kitchen tree
    pub fn purge(mut self) -> Result<(), Error> {
        self.teardown()?;

        fs_err::remove_dir_all(self.paths.kitchen_dir())?;

        Ok(())
    }
}

mod keys {
    pub const SETUP_ROOTFS: &str = "setup_rootfs";
    pub const SETUP_INGREDIENTS: &str = "setup_ingredients";
    pub const SETUP_HOOK: &str = "setup_hook";

    pub fn step(part: &str, step: &str) -> String {
        format!("step/{part}/{step}")
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown step {0}")]
    UnknownStep(String),
    #[error("step exited with code {code}")]
    StepFailed { code: i32 },
    #[error("rootfs")]
    Rootfs(#[from] rootfs::Error),
    #[error("ingredients")]
    Ingredients(#[from] ingredients::Error),
    #[error("oven")]
    Oven(#[from] oven::Error),
    #[error("recipe cache")]
    Cache(#[from] crate::cache::Error),
    #[error("container")]
    Container(#[from] container::Error),
    #[error("container exec")]
    Exec(#[from] container::instance::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPE: &str = r"
id: 7f0a5cc2-8a5a-4f6e-9f2b-3f6a51b0b7aa
name: widget
version: 0.9.0
parts:
  - name: widget
    steps:
      - name: generate
        type: generate
        system: cmake
      - name: build
        type: build
        system: make
        depends: [generate]
      - name: verify
        type: script
        system: script
        arguments: ctest
        depends: [build]
";

    fn kitchen(dir: &Path) -> Kitchen {
        let recipe = recipe::from_str(RECIPE).unwrap();
        let recipe_path = dir.join("recipe.yaml");
        fs_err::write(&recipe_path, RECIPE).unwrap();

        Kitchen::initialize(recipe, &recipe_path, dir.join("home")).unwrap()
    }

    #[test]
    fn reset_cascades_to_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let mut kitchen = kitchen(dir.path());

        // Mark every step done
        for key in ["step/widget/generate", "step/widget/build", "step/widget/verify"] {
            kitchen.checkpoint(key).unwrap();
        }

        kitchen.reset("widget", "generate").unwrap();

        assert!(!kitchen.cache.contains("step/widget/generate"));
        assert!(!kitchen.cache.contains("step/widget/build"));
        assert!(!kitchen.cache.contains("step/widget/verify"));
    }

    #[test]
    fn reset_of_a_leaf_leaves_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let mut kitchen = kitchen(dir.path());

        for key in ["step/widget/generate", "step/widget/build", "step/widget/verify"] {
            kitchen.checkpoint(key).unwrap();
        }

        kitchen.reset("widget", "verify").unwrap();

        assert!(kitchen.cache.contains("step/widget/generate"));
        assert!(kitchen.cache.contains("step/widget/build"));
        assert!(!kitchen.cache.contains("step/widget/verify"));
    }

    #[test]
    fn reset_unknown_step_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut kitchen = kitchen(dir.path());

        assert!(matches!(
            kitchen.reset("widget", "polish"),
            Err(Error::UnknownStep(_))
        ));
    }

    #[test]
    fn checkpoints_report_stage_and_step_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut kitchen = kitchen(dir.path());
        kitchen.checkpoint(keys::SETUP_ROOTFS).unwrap();

        let checkpoints = kitchen.checkpoints();

        assert_eq!(checkpoints[0], ("setup_rootfs".to_owned(), true));
        assert!(checkpoints.iter().any(|(key, done)| key == "step/widget/build" && !done));
    }
}
