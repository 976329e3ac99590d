// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Live HAR capture.
//!
//! [`HarRecorder`] holds the active [`CaptureLog`] of a proxy instance and
//! hands out one [`ExchangeCapture`] per observed request. Each exchange
//! owns a handle to its own entry, so request and response hooks never
//! consult shared state to find out which entry they belong to.

use bytes::Bytes;
use hyper::{Request, Response};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::content::{self, BodyCapture};
use crate::error::ConfigError;
use crate::har::{Har, HarEntry, HarLog, HarPage, HarRequest, HarResponse};

fn lock_entry(entry: &Mutex<HarEntry>) -> MutexGuard<'_, HarEntry> {
    match entry.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            warn!("HAR entry lock poisoned");
            poisoned.into_inner()
        }
    }
}

fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

/// Which parts of an exchange are recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSettings {
    pub headers: bool,
    pub content: bool,
    pub binary_content: bool,
}

impl CaptureSettings {
    fn body(&self) -> BodyCapture {
        BodyCapture {
            text: self.content,
            binary: self.binary_content,
        }
    }
}

/// A HAR log that exchanges append to while it is being read.
pub struct CaptureLog {
    pages: RwLock<Vec<HarPage>>,
    entries: RwLock<Vec<Arc<Mutex<HarEntry>>>>,
    current_page: RwLock<Option<String>>,
    comment: RwLock<Option<String>>,
    page_count: AtomicUsize,
}

impl CaptureLog {
    pub fn new(initial_page_ref: Option<String>, initial_page_title: Option<String>) -> Self {
        let log = Self {
            pages: RwLock::new(Vec::new()),
            entries: RwLock::new(Vec::new()),
            current_page: RwLock::new(None),
            comment: RwLock::new(None),
            page_count: AtomicUsize::new(0),
        };
        log.new_page(initial_page_ref, initial_page_title);
        log
    }

    /// Start a page and make it current. Without an id, pages are named
    /// `Page N` in creation order.
    pub fn new_page(&self, page_ref: Option<String>, title: Option<String>) -> String {
        let n = self.page_count.fetch_add(1, Ordering::SeqCst);
        let id = page_ref.unwrap_or_else(|| format!("Page {}", n));
        let page = HarPage::new(id.clone(), title);
        match self.pages.write() {
            Ok(mut pages) => pages.push(page),
            Err(_) => warn!("CaptureLog pages lock poisoned during write"),
        }
        match self.current_page.write() {
            Ok(mut current) => *current = Some(id.clone()),
            Err(_) => warn!("CaptureLog current page lock poisoned during write"),
        }
        debug!(page = %id, "new page");
        id
    }

    pub fn current_page_ref(&self) -> Option<String> {
        self.current_page.read().ok().and_then(|c| c.clone())
    }

    pub fn set_comment(&self, comment: Option<String>) {
        if let Ok(mut c) = self.comment.write() {
            *c = comment;
        }
    }

    fn push_entry(&self, entry: HarEntry) -> Arc<Mutex<HarEntry>> {
        let handle = Arc::new(Mutex::new(entry));
        match self.entries.write() {
            Ok(mut entries) => entries.push(handle.clone()),
            Err(_) => warn!("CaptureLog entries lock poisoned during write"),
        }
        handle
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Consistent copy of the log as it is now. In-flight entries appear with
    /// whatever has been recorded so far.
    pub fn to_har(&self) -> Har {
        let pages = self.pages.read().map(|p| p.clone()).unwrap_or_default();
        let handles: Vec<Arc<Mutex<HarEntry>>> =
            self.entries.read().map(|e| e.clone()).unwrap_or_default();
        let entries = handles.iter().map(|h| lock_entry(h).clone()).collect();
        let comment = self.comment.read().ok().and_then(|c| c.clone());
        Har::new(HarLog {
            pages,
            entries,
            comment,
            ..HarLog::default()
        })
    }
}

/// Holds the active log and capture flags of one proxy instance.
pub struct HarRecorder {
    active: RwLock<Option<Arc<CaptureLog>>>,
    headers: AtomicBool,
    content: AtomicBool,
    binary_content: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Default for HarRecorder {
    fn default() -> Self {
        Self::new(CaptureSettings::default())
    }
}

impl HarRecorder {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            active: RwLock::new(None),
            headers: AtomicBool::new(settings.headers),
            content: AtomicBool::new(settings.content),
            binary_content: AtomicBool::new(settings.binary_content),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Replace the active log and return the previous one in full.
    pub fn new_har(&self, page_ref: Option<String>, page_title: Option<String>) -> Option<Har> {
        let next = Arc::new(CaptureLog::new(page_ref, page_title));
        let previous = match self.active.write() {
            Ok(mut active) => active.replace(next),
            Err(poisoned) => {
                warn!("HarRecorder lock poisoned during new_har");
                poisoned.into_inner().replace(next)
            }
        };
        previous.map(|log| log.to_har())
    }

    /// Stop recording and return the last log.
    pub fn end_har(&self) -> Option<Har> {
        let previous = match self.active.write() {
            Ok(mut active) => active.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        previous.map(|log| log.to_har())
    }

    pub fn new_page(
        &self,
        page_ref: Option<String>,
        page_title: Option<String>,
    ) -> Result<String, ConfigError> {
        let log = self
            .active_log()
            .ok_or_else(|| ConfigError::parameter("har", "no active HAR; call new_har first"))?;
        Ok(log.new_page(page_ref, page_title))
    }

    pub fn active_log(&self) -> Option<Arc<CaptureLog>> {
        match self.active.read() {
            Ok(a) => a.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn har(&self) -> Option<Har> {
        self.active_log().map(|log| log.to_har())
    }

    pub fn settings(&self) -> CaptureSettings {
        CaptureSettings {
            headers: self.headers.load(Ordering::SeqCst),
            content: self.content.load(Ordering::SeqCst),
            binary_content: self.binary_content.load(Ordering::SeqCst),
        }
    }

    pub fn set_capture_headers(&self, on: bool) {
        self.headers.store(on, Ordering::SeqCst);
    }

    pub fn set_capture_content(&self, on: bool) {
        self.content.store(on, Ordering::SeqCst);
    }

    pub fn set_capture_binary_content(&self, on: bool) {
        self.binary_content.store(on, Ordering::SeqCst);
    }

    fn touch(&self) {
        match self.last_activity.lock() {
            Ok(mut last) => *last = Instant::now(),
            Err(poisoned) => *poisoned.into_inner() = Instant::now(),
        }
    }

    pub fn last_activity(&self) -> Instant {
        match self.last_activity.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Allocate an entry for a newly observed request on the active log's
    /// current page. Without an active log the exchange is tracked for
    /// activity only.
    pub fn begin(&self, request: &Request<Bytes>, connection: Option<String>) -> ExchangeCapture {
        self.touch();
        let settings = self.settings();
        let log = self.active_log();
        let entry = log.as_ref().map(|log| {
            let mut entry = HarEntry::new(log.current_page_ref(), har_request(request, settings));
            entry.connection = connection;
            log.push_entry(entry)
        });
        trace!(url = %request.uri(), recording = entry.is_some(), "exchange opened");
        ExchangeCapture {
            log,
            entry,
            state: ExchangeState::Open,
            settings,
        }
    }

    /// Wait until no request has been observed for `quiet`, measured from
    /// the later of the call and the last request. Gives up after `timeout`.
    /// Returns whether the quiet period was reached.
    pub async fn wait_for_traffic_to_stop(&self, quiet: Duration, timeout: Duration) -> bool {
        let start = Instant::now();
        let deadline = start + timeout;
        loop {
            let last = self.last_activity().max(start);
            let quiet_until = last + quiet;
            let now = Instant::now();
            if now >= quiet_until {
                return true;
            }
            if now >= deadline {
                return false;
            }
            let wake = quiet_until.min(deadline);
            tokio::time::sleep_until(tokio::time::Instant::from_std(wake)).await;
        }
    }
}

/// Build the HAR view of a request under the given capture settings.
pub fn har_request(request: &Request<Bytes>, settings: CaptureSettings) -> HarRequest {
    let url = request.uri().to_string();
    let headers = request.headers();
    HarRequest {
        method: request.method().to_string(),
        query_string: content::query_string(&url),
        url,
        http_version: content::format_http_version(request.version()),
        cookies: if settings.headers {
            content::request_cookies(headers)
        } else {
            Vec::new()
        },
        headers: if settings.headers {
            content::har_headers(headers)
        } else {
            Vec::new()
        },
        post_data: content::post_data(headers, request.body(), settings.body()),
        headers_size: content::header_size(headers),
        body_size: request.body().len() as i64,
        comment: None,
    }
}

/// Build the HAR view of a response under the given capture settings.
pub fn har_response(response: &Response<Bytes>, settings: CaptureSettings) -> HarResponse {
    let status = response.status();
    let headers = response.headers();
    HarResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        http_version: content::format_http_version(response.version()),
        cookies: if settings.headers {
            content::response_cookies(headers)
        } else {
            Vec::new()
        },
        headers: if settings.headers {
            content::har_headers(headers)
        } else {
            Vec::new()
        },
        content: content::response_content(headers, response.body(), settings.body()),
        redirect_url: content::redirect_url(status.as_u16(), headers),
        headers_size: content::header_size(headers),
        body_size: response.body().len() as i64,
        comment: None,
        error: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Open,
    Dispatched,
    ResponseStarted,
    Complete,
    Failed,
}

impl ExchangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Complete | ExchangeState::Failed)
    }
}

/// Timings gathered while dispatching a request upstream.
#[derive(Debug, Clone, Default)]
pub struct DispatchTimings {
    pub blocked: Option<Duration>,
    pub dns: Option<Duration>,
    pub connect: Option<Duration>,
    pub ssl: Option<Duration>,
    pub send: Duration,
    pub server_ip: Option<IpAddr>,
}

/// Lifecycle of one exchange's HAR entry.
///
/// `Open -> Dispatched -> ResponseStarted -> Complete | Failed`, with
/// `Open -> Complete` for short-circuited exchanges. Out-of-order calls are
/// ignored. Dropping an unfinished capture marks the entry failed.
pub struct ExchangeCapture {
    log: Option<Arc<CaptureLog>>,
    entry: Option<Arc<Mutex<HarEntry>>>,
    state: ExchangeState,
    settings: CaptureSettings,
}

impl ExchangeCapture {
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn settings(&self) -> CaptureSettings {
        self.settings
    }

    /// The log this exchange was opened against.
    pub fn log(&self) -> Option<Arc<CaptureLog>> {
        self.log.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.entry.is_some()
    }

    /// Copy of the entry as recorded so far.
    pub fn snapshot(&self) -> Option<HarEntry> {
        self.entry.as_ref().map(|e| lock_entry(e).clone())
    }

    fn transition(&mut self, allowed: &[ExchangeState], next: ExchangeState) -> bool {
        if !allowed.contains(&self.state) {
            warn!(from = ?self.state, to = ?next, "ignoring out-of-order capture transition");
            return false;
        }
        self.state = next;
        true
    }

    fn with_entry<F: FnOnce(&mut HarEntry)>(&self, f: F) {
        if let Some(entry) = &self.entry {
            let mut e = lock_entry(entry);
            f(&mut e);
            e.time = e.timings.total();
        }
    }

    /// Request sent upstream. Records the request as dispatched, which may
    /// differ from the one first observed after rewrites and injection.
    pub fn dispatched(&mut self, request: &Request<Bytes>, timings: &DispatchTimings) {
        if !self.transition(&[ExchangeState::Open], ExchangeState::Dispatched) {
            return;
        }
        let settings = self.settings;
        self.with_entry(|e| {
            e.request = har_request(request, settings);
            e.timings.blocked = timings.blocked.map(millis).unwrap_or(-1);
            e.timings.dns = timings.dns.map(millis).unwrap_or(-1);
            e.timings.connect = timings.connect.map(millis).unwrap_or(-1);
            e.timings.ssl = timings.ssl.map(millis).unwrap_or(-1);
            e.timings.send = millis(timings.send);
            e.server_ip_address = timings.server_ip.map(|ip| ip.to_string());
        });
    }

    pub fn response_started(&mut self, wait: Duration) {
        if !self.transition(&[ExchangeState::Dispatched], ExchangeState::ResponseStarted) {
            return;
        }
        self.with_entry(|e| e.timings.wait = millis(wait));
    }

    pub fn response_received(&mut self, receive: Duration) {
        if self.state != ExchangeState::ResponseStarted {
            return;
        }
        self.with_entry(|e| e.timings.receive = millis(receive));
    }

    /// Final response, upstream or synthetic.
    pub fn complete(&mut self, response: &Response<Bytes>) {
        if !self.transition(
            &[ExchangeState::Open, ExchangeState::ResponseStarted],
            ExchangeState::Complete,
        ) {
            return;
        }
        let settings = self.settings;
        self.with_entry(|e| e.response = har_response(response, settings));
    }

    /// Transport failure. Partial timings are kept; the response carries the
    /// error and no body.
    pub fn fail(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        self.state = ExchangeState::Failed;
        self.with_entry(|e| {
            e.response.error = Some(reason.to_string());
            e.comment = Some(reason.to_string());
        });
    }

    pub fn set_comment(&self, comment: &str) {
        if self.state.is_terminal() {
            return;
        }
        self.with_entry(|e| e.comment = Some(comment.to_string()));
    }
}

impl Drop for ExchangeCapture {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.fail("exchange abandoned before completion");
        }
    }
}
