// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Where reports are kept between the crash and the next launch.

mod report_store;

pub use report_store::{ReportStore, StoreError, REPORT_PATH_CAPACITY};
