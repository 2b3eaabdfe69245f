// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capture of process state: registers, stacks, threads, memory and loaded images.
//! Everything here is usable from a signal handler unless documented otherwise.

pub mod cpu;
pub mod dynamic_linker;
pub mod machine_context;
pub mod memory;
pub mod signal_info;
pub mod stack_cursor;
pub mod suspension;
pub mod threads;
