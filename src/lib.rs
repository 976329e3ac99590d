// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Intercepting HTTP/HTTPS proxy that records every exchange into a HAR log.
//!
//! A [`proxy::ProxyServer`] accepts plain HTTP and CONNECT tunnels,
//! decrypts tunnels with a locally generated CA, runs each exchange through
//! a [`filters::FilterChain`] (capture, blacklist/whitelist, rewrites,
//! header injection, user interceptors) and can emulate slow links through
//! the [`shaper`]. Several instances can be managed by port through
//! [`manager::ProxyManager`].

pub mod ca;
pub mod capture;
pub mod config;
pub mod connection;
pub mod content;
pub mod dns;
pub mod error;
pub mod exchange;
pub mod filters;
pub mod har;
pub mod manager;
pub mod proxy;
pub mod rules;
pub mod shaper;
pub mod upstream;

#[cfg(test)]
mod test_helpers;

// Keep library small; main.rs remains the binary entrypoint.
