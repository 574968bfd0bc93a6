// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

use super::{BackendData, install_prefix};

/// Compose the cmake configure invocation. A caller-provided install
/// prefix is replaced with ours; the ingredients areas are always put on
/// the prefix path so find_package sees them.
pub(super) fn compose(data: &BackendData) -> String {
    let prefix = install_prefix(data);
    let ingredients = data.build_ingredients_dir.display();

    let mut args: Vec<String> = data
        .arguments
        .split_whitespace()
        .filter(|arg| !arg.starts_with("-DCMAKE_INSTALL_PREFIX=") && !arg.starts_with("-DCMAKE_PREFIX_PATH="))
        .map(ToOwned::to_owned)
        .collect();

    args.push(format!("-DCMAKE_INSTALL_PREFIX={prefix}"));
    args.push(format!("-DCMAKE_PREFIX_PATH={ingredients}:{ingredients}/usr"));

    format!(
        "cmake -S {} -B {} {}\n",
        data.source_dir.display(),
        data.build_dir.display(),
        args.join(" "),
    )
}

#[cfg(test)]
mod tests {
    use crate::oven::tests::sample_data;
    use super::*;

    #[test]
    fn install_prefix_is_injected() {
        let script = compose(&sample_data());

        assert!(script.contains("-DCMAKE_INSTALL_PREFIX=/chef/install/usr"));
        assert!(script.contains("-DCMAKE_PREFIX_PATH=/chef/ingredients/linux/x86_64:/chef/ingredients/linux/x86_64/usr"));
    }

    #[test]
    fn caller_prefix_is_replaced() {
        let mut data = sample_data();
        data.arguments = "-DCMAKE_INSTALL_PREFIX=/usr/local -DFEATURE_X=ON".into();

        let script = compose(&data);

        assert!(!script.contains("/usr/local"));
        assert!(script.contains("-DFEATURE_X=ON"));
        assert!(script.contains("-DCMAKE_INSTALL_PREFIX=/chef/install/usr"));
    }

    #[test]
    fn source_and_build_dirs_are_explicit() {
        let script = compose(&sample_data());

        assert!(script.contains("-S /chef/project"));
        assert!(script.contains("-B /chef/build/linux/x86_64"));
    }
}
