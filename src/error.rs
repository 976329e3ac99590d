// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Error taxonomy for control-plane validation and upstream dispatch.

use thiserror::Error;

/// A control-plane call was rejected. Core state is left unchanged.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid status code {0} (expected 100..=599)")]
    InvalidStatus(u16),

    #[error("invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

impl ConfigError {
    pub fn parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Failure while talking to the upstream server or upstream proxy.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("dns resolution failed for {host}: {reason}")]
    Dns { host: String, reason: String },

    #[error("connection to {target} failed after {attempts} attempt(s): {reason}")]
    Connect {
        target: String,
        attempts: u32,
        reason: String,
    },

    #[error("tls handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("upstream protocol error: {0}")]
    Protocol(String),

    #[error("upstream proxy refused tunnel: {0}")]
    UpstreamProxy(String),
}

impl UpstreamError {
    /// Status code returned to the client when the exchange fails.
    pub fn status_code(&self) -> u16 {
        match self {
            UpstreamError::Timeout(_) => 504,
            _ => 502,
        }
    }
}
