// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::future::Future;

use tokio::runtime;

/// Run the provided future on a single use runtime that is dropped
/// before returning the completed task
pub fn block_on<T, F>(task: F) -> T
where
    F: Future<Output = T>,
{
    let temp_rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("temp runtime");
    temp_rt.block_on(task)
}
