// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

use super::BackendData;

/// The script backend runs the step's arguments verbatim
pub(super) fn compose(data: &BackendData) -> String {
    let mut body = data.arguments.clone();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use crate::oven::tests::sample_data;
    use super::*;

    #[test]
    fn arguments_run_verbatim() {
        let mut data = sample_data();
        data.arguments = "./generate.sh --fast && touch done".into();

        assert_eq!(compose(&data), "./generate.sh --fast && touch done\n");
    }
}
