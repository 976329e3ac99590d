// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Ordered request/response filter chain.
//!
//! Every stage sees the request on its way to the server and the response
//! on its way back. A request hook may short-circuit with a synthetic
//! response; that response still travels the whole response side so it is
//! recorded like any other.
//!
//! Built-in order: URL normalization, HAR capture, rule enforcement
//! (blacklist, whitelist, rewrite, host remap), header injection, automatic
//! authorization, then user interceptors. Response hooks run in reverse.

use bytes::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION, HOST};
use hyper::{Request, Response, Uri};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::capture::{CaptureLog, HarRecorder};
use crate::exchange::{synthetic_response, ExchangeContext};

pub enum FilterAction {
    Continue,
    ShortCircuit(Response<Bytes>),
}

/// One stage of the chain.
pub trait HttpFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn client_to_proxy_request(
        &self,
        _ctx: &mut ExchangeContext,
        _request: &mut Request<Bytes>,
    ) -> FilterAction {
        FilterAction::Continue
    }

    fn server_to_proxy_response(&self, _ctx: &mut ExchangeContext, _response: &mut Response<Bytes>) {
    }
}

/// User callback invoked on every request, with the HAR log the exchange is
/// being recorded into.
pub trait RequestInterceptor: Send + Sync {
    fn intercept_request(
        &self,
        request: &mut Request<Bytes>,
        har: Option<&CaptureLog>,
    ) -> FilterAction;
}

impl<F> RequestInterceptor for F
where
    F: Fn(&mut Request<Bytes>, Option<&CaptureLog>) -> FilterAction + Send + Sync,
{
    fn intercept_request(
        &self,
        request: &mut Request<Bytes>,
        har: Option<&CaptureLog>,
    ) -> FilterAction {
        self(request, har)
    }
}

/// User callback invoked on every response before it is recorded.
pub trait ResponseInterceptor: Send + Sync {
    fn intercept_response(&self, response: &mut Response<Bytes>, har: Option<&CaptureLog>);
}

impl<F> ResponseInterceptor for F
where
    F: Fn(&mut Response<Bytes>, Option<&CaptureLog>) + Send + Sync,
{
    fn intercept_response(&self, response: &mut Response<Bytes>, har: Option<&CaptureLog>) {
        self(response, har)
    }
}

/// Wrap a closure as a request interceptor.
pub fn request_interceptor<F>(f: F) -> Arc<dyn RequestInterceptor>
where
    F: Fn(&mut Request<Bytes>, Option<&CaptureLog>) -> FilterAction + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a response interceptor.
pub fn response_interceptor<F>(f: F) -> Arc<dyn ResponseInterceptor>
where
    F: Fn(&mut Response<Bytes>, Option<&CaptureLog>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Registered interceptors, invoked in registration order.
#[derive(Default)]
pub struct InterceptorRegistry {
    requests: RwLock<Vec<Arc<dyn RequestInterceptor>>>,
    responses: RwLock<Vec<Arc<dyn ResponseInterceptor>>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request_interceptor(&self, interceptor: Arc<dyn RequestInterceptor>) {
        match self.requests.write() {
            Ok(mut v) => v.push(interceptor),
            Err(_) => warn!("interceptor registry lock poisoned"),
        }
    }

    pub fn add_response_interceptor(&self, interceptor: Arc<dyn ResponseInterceptor>) {
        match self.responses.write() {
            Ok(mut v) => v.push(interceptor),
            Err(_) => warn!("interceptor registry lock poisoned"),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut v) = self.requests.write() {
            v.clear();
        }
        if let Ok(mut v) = self.responses.write() {
            v.clear();
        }
    }

    fn request_interceptors(&self) -> Vec<Arc<dyn RequestInterceptor>> {
        self.requests.read().map(|v| v.clone()).unwrap_or_default()
    }

    fn response_interceptors(&self) -> Vec<Arc<dyn ResponseInterceptor>> {
        self.responses.read().map(|v| v.clone()).unwrap_or_default()
    }
}

pub struct FilterChain {
    stages: Vec<Arc<dyn HttpFilter>>,
}

impl FilterChain {
    pub fn new(stages: Vec<Arc<dyn HttpFilter>>) -> Self {
        Self { stages }
    }

    /// The built-in stages around the given recorder and interceptors.
    pub fn standard(recorder: Arc<HarRecorder>, interceptors: Arc<InterceptorRegistry>) -> Self {
        Self::new(vec![
            Arc::new(NormalizeUrl),
            Arc::new(HarCapture { recorder }),
            Arc::new(RuleEnforcement),
            Arc::new(HeaderInjection),
            Arc::new(AutoAuthorization),
            Arc::new(Interceptors {
                registry: interceptors,
            }),
        ])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run request hooks in order. Returns the short-circuit response, if a
    /// stage produced one.
    pub fn run_request(
        &self,
        ctx: &mut ExchangeContext,
        request: &mut Request<Bytes>,
    ) -> Option<Response<Bytes>> {
        for stage in &self.stages {
            if let FilterAction::ShortCircuit(resp) = stage.client_to_proxy_request(ctx, request) {
                debug!(stage = stage.name(), status = resp.status().as_u16(), "short-circuit");
                return Some(resp);
            }
        }
        None
    }

    /// Run response hooks in reverse order.
    pub fn run_response(&self, ctx: &mut ExchangeContext, response: &mut Response<Bytes>) {
        for stage in self.stages.iter().rev() {
            stage.server_to_proxy_response(ctx, response);
        }
    }
}

/// Rebuilds an absolute URL for origin-form requests from the `Host`
/// header, falling back to the CONNECT authority inside tunnels.
pub struct NormalizeUrl;

impl HttpFilter for NormalizeUrl {
    fn name(&self) -> &'static str {
        "normalize_url"
    }

    fn client_to_proxy_request(
        &self,
        ctx: &mut ExchangeContext,
        request: &mut Request<Bytes>,
    ) -> FilterAction {
        if request.uri().scheme().is_some() {
            return FilterAction::Continue;
        }
        let host = request
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| request.uri().authority().map(|a| a.to_string()))
            .or_else(|| ctx.connect_authority.clone())
            .unwrap_or_else(|| "localhost".to_string());
        let host = strip_default_port(&host, ctx.is_https());
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let s = format!("{}://{}{}", ctx.scheme, host, path);
        match s.parse::<Uri>() {
            Ok(uri) => *request.uri_mut() = uri,
            Err(e) => {
                warn!(%e, url = %s, "cannot build absolute request URL");
                return FilterAction::ShortCircuit(synthetic_response(400, "invalid request URL"));
            }
        }
        FilterAction::Continue
    }
}

fn strip_default_port(authority: &str, https: bool) -> &str {
    let default = if https { ":443" } else { ":80" };
    authority.strip_suffix(default).unwrap_or(authority)
}

/// Opens the HAR entry on request and completes it with the final response.
pub struct HarCapture {
    recorder: Arc<HarRecorder>,
}

impl HttpFilter for HarCapture {
    fn name(&self) -> &'static str {
        "har_capture"
    }

    fn client_to_proxy_request(
        &self,
        ctx: &mut ExchangeContext,
        request: &mut Request<Bytes>,
    ) -> FilterAction {
        let conn = ctx.connection.har_label();
        ctx.capture = Some(self.recorder.begin(request, Some(conn)));
        FilterAction::Continue
    }

    fn server_to_proxy_response(&self, ctx: &mut ExchangeContext, response: &mut Response<Bytes>) {
        if let Some(capture) = ctx.capture.as_mut() {
            if !capture.state().is_terminal() {
                capture.complete(response);
            }
        }
    }
}

/// Blacklist, whitelist, rewrite and host remap against the exchange's
/// rule snapshot.
pub struct RuleEnforcement;

impl HttpFilter for RuleEnforcement {
    fn name(&self) -> &'static str {
        "rule_enforcement"
    }

    fn client_to_proxy_request(
        &self,
        ctx: &mut ExchangeContext,
        request: &mut Request<Bytes>,
    ) -> FilterAction {
        let url = request.uri().to_string();
        if let Some(block) = ctx.rules.check_blocked(&url) {
            debug!(%url, ?block, "request blocked");
            ctx.blocked = Some(block);
            return FilterAction::ShortCircuit(synthetic_response(block.status(), Bytes::new()));
        }

        if let Some(rewritten) = ctx.rules.rewrite(&url) {
            match rewritten.parse::<Uri>() {
                Ok(uri) => {
                    debug!(from = %url, to = %rewritten, "url rewritten");
                    let old_authority = request.uri().authority().cloned();
                    if let Some(auth) = uri.authority() {
                        if Some(auth) != old_authority.as_ref() {
                            if let Ok(v) = HeaderValue::from_str(auth.as_str()) {
                                request.headers_mut().insert(HOST, v);
                            }
                        }
                    }
                    *request.uri_mut() = uri;
                }
                Err(e) => warn!(%e, url = %rewritten, "rewrite produced an invalid URL, ignoring"),
            }
        }

        if let Some(host) = request.uri().host() {
            if let Some(target) = ctx.rules.remap_host(host) {
                debug!(%host, %target, "host remapped");
                ctx.connect_host = Some(target.to_string());
            }
        }
        FilterAction::Continue
    }
}

/// Adds the configured headers, subject to the header URL filter.
pub struct HeaderInjection;

impl HttpFilter for HeaderInjection {
    fn name(&self) -> &'static str {
        "header_injection"
    }

    fn client_to_proxy_request(
        &self,
        ctx: &mut ExchangeContext,
        request: &mut Request<Bytes>,
    ) -> FilterAction {
        let url = request.uri().to_string();
        for (name, value) in ctx.rules.headers_for(&url) {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        FilterAction::Continue
    }
}

/// Adds `Authorization: Basic ...` for hosts with stored credentials.
pub struct AutoAuthorization;

impl HttpFilter for AutoAuthorization {
    fn name(&self) -> &'static str {
        "auto_authorization"
    }

    fn client_to_proxy_request(
        &self,
        ctx: &mut ExchangeContext,
        request: &mut Request<Bytes>,
    ) -> FilterAction {
        let host = request.uri().host().map(|h| h.to_ascii_lowercase());
        if let Some(value) = host.and_then(|h| ctx.rules.basic_auth_for(&h).cloned()) {
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        FilterAction::Continue
    }
}

/// Runs the user-registered interceptors.
pub struct Interceptors {
    registry: Arc<InterceptorRegistry>,
}

impl HttpFilter for Interceptors {
    fn name(&self) -> &'static str {
        "interceptors"
    }

    fn client_to_proxy_request(
        &self,
        ctx: &mut ExchangeContext,
        request: &mut Request<Bytes>,
    ) -> FilterAction {
        let har = ctx.har();
        for interceptor in self.registry.request_interceptors() {
            if let FilterAction::ShortCircuit(resp) =
                interceptor.intercept_request(request, har.as_deref())
            {
                return FilterAction::ShortCircuit(resp);
            }
        }
        FilterAction::Continue
    }

    fn server_to_proxy_response(&self, ctx: &mut ExchangeContext, response: &mut Response<Bytes>) {
        let har = ctx.har();
        for interceptor in self.registry.response_interceptors() {
            interceptor.intercept_response(response, har.as_deref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSettings, ExchangeState};
    use crate::rules::{Block, RuleEngine};
    use crate::shaper::ShaperSettings;
    use hyper::http::uri::Scheme;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx_with(rules: &RuleEngine, scheme: Scheme) -> ExchangeContext {
        ExchangeContext::new(
            Arc::new(crate::test_helpers::make_test_conn()),
            scheme,
            Some("secure.test:443".into()),
            rules.snapshot(),
            ShaperSettings::default(),
        )
    }

    fn request(uri: &str, host: Option<&str>) -> Request<Bytes> {
        let mut b = Request::builder().method("GET").uri(uri);
        if let Some(h) = host {
            b = b.header("host", h);
        }
        b.body(Bytes::new()).expect("request")
    }

    fn chain(recorder: &Arc<HarRecorder>, registry: &Arc<InterceptorRegistry>) -> FilterChain {
        FilterChain::standard(recorder.clone(), registry.clone())
    }

    #[test]
    fn stage_order_is_fixed() {
        let c = chain(&Arc::new(HarRecorder::default()), &Arc::new(InterceptorRegistry::new()));
        assert_eq!(
            c.stage_names(),
            vec![
                "normalize_url",
                "har_capture",
                "rule_enforcement",
                "header_injection",
                "auto_authorization",
                "interceptors"
            ]
        );
    }

    #[test]
    fn origin_form_becomes_absolute() {
        let rules = RuleEngine::new();
        let mut ctx = ctx_with(&rules, Scheme::HTTPS);
        let mut req = request("/a?b=1", None);
        assert!(matches!(
            NormalizeUrl.client_to_proxy_request(&mut ctx, &mut req),
            FilterAction::Continue
        ));
        assert_eq!(req.uri().to_string(), "https://secure.test/a?b=1");

        let mut ctx = ctx_with(&rules, Scheme::HTTP);
        let mut req = request("/x", Some("plain.test:8080"));
        NormalizeUrl.client_to_proxy_request(&mut ctx, &mut req);
        assert_eq!(req.uri().to_string(), "http://plain.test:8080/x");
    }

    #[test]
    fn blacklisted_request_is_short_circuited_and_recorded() -> anyhow::Result<()> {
        let rules = RuleEngine::new();
        rules.blacklist_requests(r"http://blocked\.test/.*", 410)?;
        let recorder = Arc::new(HarRecorder::new(CaptureSettings::default()));
        recorder.new_har(None, None);
        let registry = Arc::new(InterceptorRegistry::new());
        let c = chain(&recorder, &registry);

        let mut ctx = ctx_with(&rules, Scheme::HTTP);
        let mut req = request("http://blocked.test/x", None);
        let mut resp = c.run_request(&mut ctx, &mut req).expect("short circuit");
        assert_eq!(resp.status().as_u16(), 410);
        assert_eq!(ctx.blocked, Some(Block::Blacklisted(410)));

        c.run_response(&mut ctx, &mut resp);
        assert_eq!(
            ctx.capture.as_ref().map(|c| c.state()),
            Some(ExchangeState::Complete)
        );
        let har = recorder.har().expect("har");
        assert_eq!(har.log.entries[0].response.status, 410);
        Ok(())
    }

    #[test]
    fn rewrite_updates_url_and_host_and_remap_sets_target() -> anyhow::Result<()> {
        let rules = RuleEngine::new();
        rules.rewrite_url("http://a.test/(.*)", "http://b.test/$1")?;
        rules.rewrite_url("http://b.test/(.*)", "http://c.test:8081/$1")?;
        rules.remap_host("c.test", "127.0.0.1")?;
        let mut ctx = ctx_with(&rules, Scheme::HTTP);
        let mut req = request("http://a.test/p", Some("a.test"));
        assert!(matches!(
            RuleEnforcement.client_to_proxy_request(&mut ctx, &mut req),
            FilterAction::Continue
        ));
        assert_eq!(req.uri().to_string(), "http://c.test:8081/p");
        assert_eq!(req.headers().get(HOST).map(|v| v.as_bytes()), Some(&b"c.test:8081"[..]));
        assert_eq!(ctx.connect_host.as_deref(), Some("127.0.0.1"));
        Ok(())
    }

    #[test]
    fn headers_and_auth_are_injected() -> anyhow::Result<()> {
        let rules = RuleEngine::new();
        rules.add_header("X-Injected", "yes")?;
        rules.auto_basic_auth("auth.test", "u", "p")?;
        let mut ctx = ctx_with(&rules, Scheme::HTTP);
        let mut req = request("http://auth.test/", None);
        HeaderInjection.client_to_proxy_request(&mut ctx, &mut req);
        AutoAuthorization.client_to_proxy_request(&mut ctx, &mut req);
        assert_eq!(req.headers().get("x-injected").map(|v| v.as_bytes()), Some(&b"yes"[..]));
        assert!(req.headers().contains_key(AUTHORIZATION));

        let mut other = request("http://other.test/", None);
        AutoAuthorization.client_to_proxy_request(&mut ctx, &mut other);
        assert!(!other.headers().contains_key(AUTHORIZATION));
        Ok(())
    }

    #[test]
    fn interceptors_run_in_registration_order_and_see_har() {
        let recorder = Arc::new(HarRecorder::default());
        recorder.new_har(Some("page".into()), None);
        let registry = Arc::new(InterceptorRegistry::new());
        registry.add_request_interceptor(request_interceptor(
            |req: &mut Request<Bytes>, har: Option<&CaptureLog>| {
                req.headers_mut()
                    .insert("x-order", HeaderValue::from_static("first"));
                assert_eq!(har.and_then(|h| h.current_page_ref()).as_deref(), Some("page"));
                FilterAction::Continue
            },
        ));
        registry.add_request_interceptor(request_interceptor(
            |req: &mut Request<Bytes>, _har: Option<&CaptureLog>| {
                let seen = req.headers().get("x-order").cloned();
                if seen.as_ref().map(|v| v.as_bytes()) == Some(&b"first"[..]) {
                    FilterAction::ShortCircuit(synthetic_response(299, "scripted"))
                } else {
                    FilterAction::Continue
                }
            },
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        registry.add_response_interceptor(response_interceptor(
            move |resp: &mut Response<Bytes>, _har: Option<&CaptureLog>| {
                calls2.fetch_add(1, Ordering::SeqCst);
                resp.headers_mut()
                    .insert("x-seen", HeaderValue::from_static("1"));
            },
        ));

        let c = chain(&recorder, &registry);
        let rules = RuleEngine::new();
        let mut ctx = ctx_with(&rules, Scheme::HTTP);
        let mut req = request("http://x.test/", None);
        let mut resp = c.run_request(&mut ctx, &mut req).expect("short circuit");
        c.run_response(&mut ctx, &mut resp);

        assert_eq!(resp.status().as_u16(), 299);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let har = recorder.har().expect("har");
        // response interceptors run before the entry is finalized
        assert_eq!(har.log.entries[0].response.status, 299);
        assert_eq!(har.log.entries[0].response.headers_size, "x-seen".len() as i64 + 1 + 4);
    }

    #[test]
    fn cleared_registry_runs_nothing() {
        let recorder = Arc::new(HarRecorder::default());
        let registry = Arc::new(InterceptorRegistry::new());
        registry.add_request_interceptor(request_interceptor(
            |_req: &mut Request<Bytes>, _har: Option<&CaptureLog>| {
                FilterAction::ShortCircuit(synthetic_response(299, "scripted"))
            },
        ));
        registry.clear();

        let c = chain(&recorder, &registry);
        let rules = RuleEngine::new();
        let mut ctx = ctx_with(&rules, Scheme::HTTP);
        let mut req = request("http://x.test/", None);
        assert!(c.run_request(&mut ctx, &mut req).is_none());
    }
}
