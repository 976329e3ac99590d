// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Per-request state threaded through both filter hooks of one exchange.

use bytes::Bytes;
use hyper::http::uri::Scheme;
use hyper::{Response, StatusCode};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::capture::{CaptureLog, ExchangeCapture};
use crate::connection::ConnectionMetadata;
use crate::rules::{Block, RuleSet};
use crate::shaper::ShaperSettings;

/// Everything one exchange needs from request to response. Owned by the
/// task serving that exchange and never shared with other exchanges.
pub struct ExchangeContext {
    pub id: Uuid,
    pub connection: Arc<ConnectionMetadata>,
    /// `https` for requests decrypted from an intercepted CONNECT tunnel.
    pub scheme: Scheme,
    /// `host:port` from the CONNECT that opened the tunnel, if any.
    pub connect_authority: Option<String>,
    pub rules: Arc<RuleSet>,
    pub shaping: ShaperSettings,
    pub capture: Option<ExchangeCapture>,
    /// Connect target after host remapping; the request URL keeps the
    /// original host.
    pub connect_host: Option<String>,
    pub blocked: Option<Block>,
    pub started: Instant,
}

impl ExchangeContext {
    pub fn new(
        connection: Arc<ConnectionMetadata>,
        scheme: Scheme,
        connect_authority: Option<String>,
        rules: Arc<RuleSet>,
        shaping: ShaperSettings,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            scheme,
            connect_authority,
            rules,
            shaping,
            capture: None,
            connect_host: None,
            blocked: None,
            started: Instant::now(),
        }
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    /// The HAR log this exchange is being recorded into.
    pub fn har(&self) -> Option<Arc<CaptureLog>> {
        self.capture.as_ref().and_then(|c| c.log())
    }

    pub fn capture_mut(&mut self) -> Option<&mut ExchangeCapture> {
        self.capture.as_mut()
    }
}

/// Response produced by the proxy itself rather than an upstream server.
pub fn synthetic_response(status: u16, body: impl Into<Bytes>) -> Response<Bytes> {
    let mut resp = Response::new(body.into());
    *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    resp
}
