// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities, mocks, and helpers for integration tests

pub mod collector;
pub mod mocks;
