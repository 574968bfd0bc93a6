// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Build driver internals
//!
//! `bake` materializes a kitchen for a recipe, resolves its ingredients,
//! runs each part's steps through the oven backends inside a confined
//! container, and packs the install tree into distributable packs.

pub use self::env::BuildEnv;
pub use self::kitchen::Kitchen;
pub use self::paths::{Mapping, Paths};

pub mod cache;
pub mod env;
pub mod kitchen;
pub mod oven;
pub mod packer;
pub mod paths;
pub mod runtime;
pub mod util;

/// Host platform identifier baked into environments and paths
pub fn host_platform() -> &'static str {
    "linux"
}

/// Host architecture identifier
pub fn host_arch() -> &'static str {
    std::env::consts::ARCH
}
