// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

use super::BackendData;

pub(super) fn compose(data: &BackendData) -> String {
    let jobs = if data.parallel { data.jobs } else { 1 };

    format!(
        "make -C {} -j{jobs} {}\n",
        data.work_dir().display(),
        data.arguments,
    )
}

#[cfg(test)]
mod tests {
    use crate::oven::tests::sample_data;
    use super::*;

    #[test]
    fn parallelism_follows_cpu_count() {
        let script = compose(&sample_data());

        assert!(script.contains("make -C /chef/build/linux/x86_64 -j4"));
    }

    #[test]
    fn parallel_false_forces_one_job() {
        let mut data = sample_data();
        data.parallel = false;

        assert!(compose(&data).contains("-j1"));
    }

    #[test]
    fn in_tree_builds_in_the_source_dir() {
        let mut data = sample_data();
        data.in_tree = true;

        assert!(compose(&data).contains("make -C /chef/project"));
    }
}
