// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! HTTP Archive (HAR 1.2) document model.
//!
//! Field names follow the HAR JSON layout. Optional fields without a value
//! are omitted on output, and unknown fields are ignored on input.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub const HAR_VERSION: &str = "1.2";

/// Timing value meaning "not measured".
pub const NOT_MEASURED: i64 = -1;

fn not_measured() -> i64 {
    NOT_MEASURED
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Har {
    pub log: HarLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarLog {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub creator: HarCreator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<HarCreator>,
    #[serde(default)]
    pub pages: Vec<HarPage>,
    #[serde(default)]
    pub entries: Vec<HarEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn default_version() -> String {
    HAR_VERSION.to_string()
}

impl Default for HarLog {
    fn default() -> Self {
        Self {
            version: default_version(),
            creator: HarCreator::default(),
            browser: None,
            pages: Vec::new(),
            entries: Vec::new(),
            comment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarCreator {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Default for HarCreator {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            comment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPage {
    pub id: String,
    pub started_date_time: DateTime<Utc>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub page_timings: HarPageTimings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl HarPage {
    pub fn new(id: impl Into<String>, title: Option<String>) -> Self {
        let id = id.into();
        Self {
            title: title.unwrap_or_else(|| id.clone()),
            id,
            started_date_time: Utc::now(),
            page_timings: HarPageTimings::default(),
            comment: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPageTimings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_content_load: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_load: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// One observed request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pageref: Option<String>,
    pub started_date_time: DateTime<Utc>,
    /// Total elapsed milliseconds; sum of the measured timing phases.
    #[serde(default)]
    pub time: i64,
    pub request: HarRequest,
    pub response: HarResponse,
    #[serde(default)]
    pub cache: HarCache,
    #[serde(default)]
    pub timings: HarTimings,
    #[serde(
        rename = "serverIPAddress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub server_ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl HarEntry {
    pub fn new(pageref: Option<String>, request: HarRequest) -> Self {
        Self {
            pageref,
            started_date_time: Utc::now(),
            time: 0,
            request,
            response: HarResponse::default(),
            cache: HarCache::default(),
            timings: HarTimings::default(),
            server_ip_address: None,
            connection: None,
            comment: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub http_version: String,
    #[serde(default)]
    pub cookies: Vec<HarCookie>,
    #[serde(default)]
    pub headers: Vec<HarNameValuePair>,
    #[serde(default)]
    pub query_string: Vec<HarNameValuePair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<HarPostData>,
    #[serde(default = "not_measured")]
    pub headers_size: i64,
    #[serde(default = "not_measured")]
    pub body_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub http_version: String,
    #[serde(default)]
    pub cookies: Vec<HarCookie>,
    #[serde(default)]
    pub headers: Vec<HarNameValuePair>,
    #[serde(default)]
    pub content: HarContent,
    #[serde(rename = "redirectURL", default)]
    pub redirect_url: String,
    #[serde(default = "not_measured")]
    pub headers_size: i64,
    #[serde(default = "not_measured")]
    pub body_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Transport failure description for exchanges that never completed.
    #[serde(rename = "_error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for HarResponse {
    fn default() -> Self {
        Self {
            status: 0,
            status_text: String::new(),
            http_version: String::new(),
            cookies: Vec::new(),
            headers: Vec::new(),
            content: HarContent::default(),
            redirect_url: String::new(),
            headers_size: NOT_MEASURED,
            body_size: NOT_MEASURED,
            comment: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Header or query-string pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarNameValuePair {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl HarNameValuePair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            comment: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
    pub mime_type: String,
    #[serde(default)]
    pub params: Vec<HarPostParam>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostParam {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    #[serde(default)]
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<i64>,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarCache {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Phase breakdown in milliseconds; `-1` marks a phase that was not measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarTimings {
    #[serde(default = "not_measured")]
    pub blocked: i64,
    #[serde(default = "not_measured")]
    pub dns: i64,
    #[serde(default = "not_measured")]
    pub connect: i64,
    #[serde(default)]
    pub send: i64,
    #[serde(default)]
    pub wait: i64,
    #[serde(default)]
    pub receive: i64,
    #[serde(default = "not_measured")]
    pub ssl: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Default for HarTimings {
    fn default() -> Self {
        Self {
            blocked: NOT_MEASURED,
            dns: NOT_MEASURED,
            connect: NOT_MEASURED,
            send: 0,
            wait: 0,
            receive: 0,
            ssl: NOT_MEASURED,
            comment: None,
        }
    }
}

impl HarTimings {
    /// Sum of the measured phases. `ssl` is already part of `connect`.
    pub fn total(&self) -> i64 {
        [
            self.blocked,
            self.dns,
            self.connect,
            self.send,
            self.wait,
            self.receive,
        ]
        .iter()
        .filter(|v| **v >= 0)
        .sum()
    }
}

impl Har {
    pub fn new(log: HarLog) -> Self {
        Self { log }
    }

    /// View restricted to the given page ids. Entries without a matching
    /// page are dropped.
    pub fn filter_pages<S: AsRef<str>>(&self, page_refs: &[S]) -> Har {
        let wanted: HashSet<&str> = page_refs.iter().map(|s| s.as_ref()).collect();
        let pages: Vec<HarPage> = self
            .log
            .pages
            .iter()
            .filter(|p| wanted.contains(p.id.as_str()))
            .cloned()
            .collect();
        let entries = self
            .log
            .entries
            .iter()
            .filter(|e| {
                e.pageref
                    .as_deref()
                    .map(|r| wanted.contains(r) && pages.iter().any(|p| p.id == r))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        Har {
            log: HarLog {
                version: self.log.version.clone(),
                creator: self.log.creator.clone(),
                browser: self.log.browser.clone(),
                pages,
                entries,
                comment: self.log.comment.clone(),
            },
        }
    }
}

/// Write a HAR document as pretty-printed JSON.
pub async fn save_har<P: AsRef<Path>>(path: P, har: &Har) -> anyhow::Result<()> {
    let path_ref = path.as_ref();
    let json = serde_json::to_string_pretty(har)?;
    if let Some(parent) = path_ref.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path_ref, json)
        .await
        .with_context(|| format!("failed to write HAR to {}", path_ref.display()))?;
    Ok(())
}

/// Read a HAR document, ignoring fields this model does not know about.
pub async fn load_har<P: AsRef<Path>>(path: P) -> anyhow::Result<Har> {
    let path_ref = path.as_ref();
    let s = tokio::fs::read_to_string(path_ref)
        .await
        .with_context(|| format!("failed to read HAR from {}", path_ref.display()))?;
    let har = serde_json::from_str(&s).context("failed to parse HAR JSON")?;
    Ok(har)
}
