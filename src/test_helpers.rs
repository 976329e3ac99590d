// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Shared test utilities to reduce duplication across test modules.

/// Create a test connection metadata with standard test address
pub fn make_test_conn() -> crate::connection::ConnectionMetadata {
    crate::connection::ConnectionMetadata::new(
        "127.0.0.1:12345".parse().expect("valid test address"),
    )
}
