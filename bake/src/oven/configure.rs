// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

use super::{BackendData, install_prefix};

/// Compose an autotools configure run. A `config.site` pointing compiler
/// and linker searches into the ingredients is synthesized first;
/// autoconf picks it up through `CONFIG_SITE`.
pub(super) fn compose(data: &BackendData) -> String {
    let ingredients = data.build_ingredients_dir.display();

    format!(
        "mkdir -p \"$HOME/local/share\"\n\
         cat > \"$HOME/local/share/config.site\" <<'EOF'\n\
         CFLAGS=\"$CFLAGS -I{ingredients}/usr/include\"\n\
         CPPFLAGS=\"$CPPFLAGS -I{ingredients}/usr/include\"\n\
         LDFLAGS=\"$LDFLAGS -L{ingredients}/usr/lib\"\n\
         EOF\n\
         export CONFIG_SITE=\"$HOME/local/share/config.site\"\n\
         mkdir -p {build}\n\
         cd {build}\n\
         {source}/configure --prefix={prefix} {args}\n",
        build = data.build_dir.display(),
        source = data.source_dir.display(),
        prefix = install_prefix(data),
        args = data.arguments,
    )
}

#[cfg(test)]
mod tests {
    use crate::oven::tests::sample_data;
    use super::*;

    #[test]
    fn config_site_points_into_the_ingredients() {
        let script = compose(&sample_data());

        assert!(script.contains("config.site"));
        assert!(script.contains("-I/chef/ingredients/linux/x86_64/usr/include"));
        assert!(script.contains("-L/chef/ingredients/linux/x86_64/usr/lib"));
    }

    #[test]
    fn prefix_lands_in_the_install_tree() {
        let script = compose(&sample_data());

        assert!(script.contains("/chef/project/configure --prefix=/chef/install/usr"));
    }
}
