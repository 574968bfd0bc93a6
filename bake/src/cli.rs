// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::path::{Path, PathBuf};

use bake::kitchen::{self, Kitchen, SetupOptions};
use bake::packer::{self, PackOptions};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "bake", about = "Reproducible package builds from recipes", version)]
struct Args {
    /// Log filter, e.g. `info` or `bake=debug`
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a fresh recipe skeleton into the current directory
    Init {
        /// Project name
        name: String,
    },
    /// Build every part of the recipe
    Build {
        #[arg(default_value = "recipe.yaml")]
        recipe: PathBuf,
        /// Allow network access inside the build container
        #[arg(long)]
        network: bool,
        /// Shell hook executed once after ingredient setup
        #[arg(long)]
        hook: Option<String>,
        /// Reset this step (and its dependents) before building
        #[arg(long, value_name = "PART/STEP")]
        reset: Option<String>,
    },
    /// Produce the declared packs from the install tree
    Pack {
        #[arg(default_value = "recipe.yaml")]
        recipe: PathBuf,
        /// Compress the tree section with zstd
        #[arg(long)]
        compress: bool,
    },
    /// Drop build state, keeping fetched ingredients
    Clean {
        #[arg(default_value = "recipe.yaml")]
        recipe: PathBuf,
    },
    /// Run a built command inside the kitchen container
    Run {
        #[arg(default_value = "recipe.yaml")]
        recipe: PathBuf,
        /// Command name from the pack manifest, first one if omitted
        #[arg(long)]
        command: Option<String>,
        /// Arguments handed to the command
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Delete the recipe's kitchen entirely
    Purge {
        #[arg(default_value = "recipe.yaml")]
        recipe: PathBuf,
    },
}

/// Registry endpoint configuration, `~/.config/chef/registry.yaml`
#[derive(Debug, Serialize, Deserialize)]
struct RegistryConfig {
    endpoint: url::Url,
}

impl chef_config::Config for RegistryConfig {
    fn domain() -> String {
        "registry".into()
    }
}

pub fn process() -> Result<(), Error> {
    let args = Args::parse();

    let level: tracing_subscriber::filter::LevelFilter =
        args.log.parse().map_err(|_| Error::BadLogLevel(args.log.clone()))?;
    tracing_subscriber::fmt().with_max_level(level).with_writer(io::stderr).init();

    match args.command {
        Command::Init { name } => init(&name),
        Command::Build {
            recipe,
            network,
            hook,
            reset,
        } => build(&recipe, network, hook, reset),
        Command::Pack { recipe, compress } => pack(&recipe, compress),
        Command::Clean { recipe } => clean(&recipe),
        Command::Run { recipe, command, args } => run(&recipe, command.as_deref(), &args),
        Command::Purge { recipe } => purge(&recipe),
    }
}

fn init(name: &str) -> Result<(), Error> {
    let path = PathBuf::from("recipe.yaml");
    if path.exists() {
        return Err(Error::RecipeExists(path));
    }

    let template = format!(
        r#"id: {id}
name: {name}
version: 0.1.0
summary: ""
ingredients:
  build: []
parts:
  - name: {name}
    steps:
      - name: generate
        type: generate
        system: cmake
      - name: build
        type: build
        system: make
        depends: [generate]
packs:
  - name: {name}
    type: application
"#,
        id = Uuid::new_v4(),
    );

    fs_err::write(&path, template)?;
    println!("wrote {}", path.display());

    Ok(())
}

fn open_kitchen(recipe_path: &Path) -> Result<Kitchen, Error> {
    let recipe = recipe::from_slice(&fs_err::read(recipe_path)?)?;
    let home = dirs::home_dir().ok_or(Error::NoHome)?;

    Ok(Kitchen::initialize(recipe, recipe_path, home)?)
}

fn registry_endpoint() -> Option<url::Url> {
    let manager = chef_config::Manager::user("chef").ok()?;
    manager.load::<RegistryConfig>().into_iter().last().map(|c| c.endpoint)
}

fn build(recipe_path: &Path, network: bool, hook: Option<String>, reset: Option<String>) -> Result<(), Error> {
    let mut kitchen = open_kitchen(recipe_path)?;

    if let Some(reset) = reset {
        let (part, step) = reset.split_once('/').ok_or_else(|| Error::BadReset(reset.clone()))?;
        kitchen.reset(part, step)?;
    }

    let options = SetupOptions {
        hook,
        network,
        registry: registry_endpoint(),
    };

    let result = kitchen.setup(&options);
    kitchen.teardown()?;
    result?;

    println!("build complete");

    Ok(())
}

fn pack(recipe_path: &Path, compress: bool) -> Result<(), Error> {
    let kitchen = open_kitchen(recipe_path)?;

    let written = packer::pack(kitchen.recipe(), kitchen.paths(), &PackOptions { compress })?;

    for path in written {
        println!("{}", path.display());
    }

    Ok(())
}

fn clean(recipe_path: &Path) -> Result<(), Error> {
    let mut kitchen = open_kitchen(recipe_path)?;
    kitchen.clean()?;

    println!("kitchen cleaned");

    Ok(())
}

fn run(recipe_path: &Path, command: Option<&str>, args: &[String]) -> Result<(), Error> {
    let kitchen = open_kitchen(recipe_path)?;
    let recipe = kitchen.recipe();

    let declared = recipe
        .packs
        .iter()
        .flat_map(|pack| pack.commands.iter())
        .find(|c| command.is_none() || Some(c.name.as_str()) == command)
        .ok_or(Error::NoCommand)?;

    let install = kitchen.paths().install();
    let executable = install.guest.join("usr").join(&declared.path);

    container::Container::new(
        format!("run-{}", recipe.project.id),
        kitchen.paths().rootfs().host,
    )
    .bind_ro(&install.host, &install.guest)
    .work_dir(&install.guest)
    .run(|| {
        use std::process::Command as Process;

        let status = Process::new(&executable).args(args).status()?;
        if !status.success() {
            return Err(io::Error::other(format!("exited with {status}")));
        }

        Ok(()) as io::Result<_>
    })?;

    Ok(())
}

fn purge(recipe_path: &Path) -> Result<(), Error> {
    let kitchen = open_kitchen(recipe_path)?;
    kitchen.purge()?;

    println!("kitchen purged");

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("recipe.yaml already exists at {0}")]
    RecipeExists(PathBuf),
    #[error("reset takes PART/STEP, got `{0}`")]
    BadReset(String),
    #[error("unknown log level `{0}`")]
    BadLogLevel(String),
    #[error("unable to determine the home directory")]
    NoHome,
    #[error("recipe declares no matching command")]
    NoCommand,
    #[error("recipe")]
    Recipe(#[from] recipe::Error),
    #[error("kitchen")]
    Kitchen(#[from] kitchen::Error),
    #[error("packer")]
    Packer(#[from] packer::Error),
    #[error("container")]
    Container(#[from] container::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
