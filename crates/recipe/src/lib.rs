// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Recipe parsing
//!
//! A recipe describes one project: its ingredients, the parts and steps
//! that build it, and the packs it produces. Recipes are parsed once at
//! CLI entry and immutable afterwards.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub fn from_slice(bytes: &[u8]) -> Result<Recipe, Error> {
    let recipe: Recipe = serde_yaml::from_slice(bytes)?;
    recipe.validate()?;
    Ok(recipe)
}

pub fn from_str(s: &str) -> Result<Recipe, Error> {
    from_slice(s.as_bytes())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recipe {
    #[serde(flatten)]
    pub project: Project,
    #[serde(default)]
    pub ingredients: Ingredients,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub packs: Vec<Pack>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    /// Stable identity, generated by `bake init`
    pub id: Uuid,
    pub name: String,
    #[serde(deserialize_with = "force_string")]
    pub version: String,
    pub summary: Option<String>,
    pub license: Option<String>,
    pub author: Option<String>,
    pub homepage: Option<Url>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ingredients {
    /// Utilities required on the build host itself
    #[serde(default)]
    pub host: Vec<Ingredient>,
    /// Build-time dependencies, visible to the compilers
    #[serde(default)]
    pub build: Vec<Ingredient>,
    /// Runtime dependencies, staged into the install image
    #[serde(default)]
    pub runtime: Vec<Ingredient>,
}

impl Ingredients {
    pub fn iter(&self) -> impl Iterator<Item = &Ingredient> {
        self.host.iter().chain(&self.build).chain(&self.runtime)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ingredient {
    pub name: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Version range expression, any version when absent
    pub version: Option<String>,
    pub platform: Option<String>,
    pub arch: Option<String>,
    #[serde(default)]
    pub source: IngredientSource,
    /// Copy this ingredient's files into produced packs
    #[serde(default, rename = "include")]
    pub include_in_pack: bool,
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Ingredient {
    /// REPO sourced names carry the publisher: `publisher/package`
    pub fn split_repo_name(&self) -> Result<(&str, &str), Error> {
        match self.name.split_once('/') {
            Some((publisher, package)) if !publisher.is_empty() && !package.is_empty() => Ok((publisher, package)),
            _ => Err(Error::MalformedIngredientName(self.name.clone())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IngredientSource {
    /// Resolved against the remote registry (or the local inventory)
    #[default]
    Repo,
    /// Fetched from an arbitrary url
    Url,
    /// A pack file on the local filesystem
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Part {
    pub name: String,
    pub toolchain: Option<String>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Backend the step dispatches to (cmake, meson, make, configure,
    /// script)
    pub system: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub env: Vec<EnvEntry>,
    #[serde(default, rename = "depends")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub options: StepOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE")]
pub enum StepKind {
    Generate,
    Build,
    Script,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StepOptions {
    /// Build in the source tree instead of a separate build dir
    #[serde(default)]
    pub in_tree: bool,
    #[serde(default = "default_true")]
    pub parallel: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            in_tree: false,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvEntry {
    pub key: String,
    #[serde(deserialize_with = "force_string")]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pack {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PackKind,
    /// Glob filters over the install tree; empty means everything
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PackKind {
    Application,
    Ingredient,
    Toolchain,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: CommandKind,
    /// Executable path relative to the install root
    pub path: PathBuf,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub icon: String,
    /// Allow resolving libraries from the host system
    #[serde(default, rename = "system-libraries")]
    pub system_libraries: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandKind {
    #[default]
    Executable,
    Daemon,
}

impl Recipe {
    fn validate(&self) -> Result<(), Error> {
        for ingredient in self.ingredients.iter() {
            if ingredient.source == IngredientSource::Repo {
                ingredient.split_repo_name()?;
            }
        }

        for part in &self.parts {
            for step in &part.steps {
                for dependency in &step.depends_on {
                    if dependency == &step.name {
                        return Err(Error::SelfDependency {
                            part: part.name.clone(),
                            step: step.name.clone(),
                        });
                    }
                    if !part.steps.iter().any(|s| &s.name == dependency) {
                        return Err(Error::UnknownDependency {
                            part: part.name.clone(),
                            step: step.name.clone(),
                            dependency: dependency.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    pub fn part(&self, name: &str) -> Option<&Part> {
        self.parts.iter().find(|p| p.name == name)
    }
}

fn default_channel() -> String {
    "stable".to_owned()
}

fn default_true() -> bool {
    true
}

/// YAML happily parses `1.0` as a float; recipes mean the string
fn force_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Inner {
        String(String),
        Number(serde_yaml::Number),
        Bool(bool),
    }

    Ok(match Inner::deserialize(deserializer)? {
        Inner::String(s) => s,
        Inner::Number(n) => n.to_string(),
        Inner::Bool(b) => b.to_string(),
    })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("repo ingredient name must be publisher/package: `{0}`")]
    MalformedIngredientName(String),
    #[error("step {part}/{step} depends on itself")]
    SelfDependency { part: String, step: String },
    #[error("step {part}/{step} depends on unknown step `{dependency}`")]
    UnknownDependency {
        part: String,
        step: String,
        dependency: String,
    },
    #[error("parse recipe")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPE: &str = r#"
id: 8d5c1c0e-41e5-4e2a-b2a7-6d3f1f2f9f10
name: editor
version: 2.1
summary: A text editor
license: MIT
ingredients:
  build:
    - name: greenhouse/zlib
      version: ">=1.3"
      include: true
      filters: ["*.so*"]
  host:
    - name: greenhouse/cmake-tools
parts:
  - name: editor
    toolchain: gcc-13
    steps:
      - name: generate
        type: generate
        system: cmake
        arguments: -DFEATURE_X=ON
        env:
          - key: LANG
            value: C.UTF-8
      - name: build
        type: build
        system: make
        depends: [generate]
packs:
  - name: editor
    type: application
    filters: ["bin/*", "share/**"]
    commands:
      - name: edit
        path: bin/edit
        arguments: "${file}"
"#;

    #[test]
    fn parses_and_validates() {
        let recipe = from_str(RECIPE).unwrap();

        assert_eq!(recipe.project.name, "editor");
        assert_eq!(recipe.project.version, "2.1");
        assert_eq!(recipe.ingredients.build.len(), 1);
        assert!(recipe.ingredients.build[0].include_in_pack);
        assert_eq!(recipe.parts[0].steps[1].depends_on, vec!["generate"]);
        assert_eq!(recipe.packs[0].kind, PackKind::Application);
        assert_eq!(recipe.packs[0].commands[0].kind, CommandKind::Executable);

        let (publisher, package) = recipe.ingredients.build[0].split_repo_name().unwrap();
        assert_eq!((publisher, package), ("greenhouse", "zlib"));
    }

    #[test]
    fn repo_ingredient_requires_publisher() {
        let recipe = RECIPE.replace("greenhouse/zlib", "zlib");

        assert!(matches!(from_str(&recipe), Err(Error::MalformedIngredientName(_))));
    }

    #[test]
    fn unknown_step_dependency_is_rejected() {
        let recipe = RECIPE.replace("depends: [generate]", "depends: [missing]");

        assert!(matches!(from_str(&recipe), Err(Error::UnknownDependency { .. })));
    }

    #[test]
    fn default_channel_and_options() {
        let recipe = from_str(RECIPE).unwrap();

        assert_eq!(recipe.ingredients.build[0].channel, "stable");
        assert!(recipe.parts[0].steps[0].options.parallel);
        assert!(!recipe.parts[0].steps[0].options.in_tree);
    }
}
