// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

use super::{BackendData, install_prefix};

/// Compose the meson setup invocation. The cross file is emitted next to
/// the build tree with the backend variables already expanded, then
/// passed via `--cross-file`.
pub(super) fn compose(data: &BackendData) -> String {
    let cross_file = data.build_dir.join("cross-file.txt");

    format!(
        "mkdir -p {build}\ncat > {cross} <<'EOF'\n{content}EOF\nmeson setup --prefix {prefix} --cross-file {cross} {args} {build} {source}\n",
        build = data.build_dir.display(),
        cross = cross_file.display(),
        content = cross_file_content(data),
        prefix = install_prefix(data),
        args = data.arguments,
        source = data.source_dir.display(),
    )
}

fn cross_file_content(data: &BackendData) -> String {
    let ingredients = data.build_ingredients_dir.display();

    format!(
        "[binaries]\n\
         pkg-config = 'pkg-config'\n\
         \n\
         [built-in options]\n\
         c_args = ['-I{ingredients}/usr/include']\n\
         c_link_args = ['-L{ingredients}/usr/lib']\n\
         \n\
         [host_machine]\n\
         system = '{platform}'\n\
         cpu_family = '{arch}'\n\
         cpu = '{arch}'\n\
         endian = 'little'\n",
        platform = data.platform,
        arch = data.arch,
    )
}

#[cfg(test)]
mod tests {
    use crate::oven::tests::sample_data;
    use super::*;

    #[test]
    fn cross_file_is_emitted_and_passed() {
        let script = compose(&sample_data());

        assert!(script.contains("cat > /chef/build/linux/x86_64/cross-file.txt"));
        assert!(script.contains("--cross-file /chef/build/linux/x86_64/cross-file.txt"));
    }

    #[test]
    fn cross_file_variables_are_expanded() {
        let content = cross_file_content(&sample_data());

        assert!(content.contains("cpu_family = 'x86_64'"));
        assert!(content.contains("-I/chef/ingredients/linux/x86_64/usr/include"));
        assert!(!content.contains("${"));
    }
}
