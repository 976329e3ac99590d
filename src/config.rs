// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading. Every table is optional; missing values take the
//! defaults below. Each proxy instance keeps its own copy.

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::capture::CaptureSettings;
use crate::error::ConfigError;
use crate::rules::RuleEngine;
use crate::shaper::ShaperSettings;
use crate::upstream::UpstreamSettings;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Address proxy instances bind to.
    pub bind: IpAddr,

    /// Port used by the command line entrypoint.
    pub port: u16,

    /// Range the manager allocates ports from when none is requested.
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
            port_range_start: 8081,
            port_range_end: 8581,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Intercept CONNECT tunnels. When off, every tunnel is passed through.
    pub enabled: bool,
    /// When both paths are unset an in-memory CA is generated per instance.
    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,
    /// Host suffixes that are always tunnelled opaquely.
    pub passthrough_domains: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_cert_path: None,
            ca_key_path: None,
            passthrough_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Chained HTTP proxy, `host:port`.
    pub proxy: Option<String>,
    /// Skip certificate verification of upstream servers.
    pub trust_all_servers: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub headers: bool,
    pub content: bool,
    pub binary_content: bool,
    pub initial_page_ref: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            headers: true,
            content: false,
            binary_content: false,
            initial_page_ref: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Whole upstream dispatch; 0 disables.
    pub request_ms: u64,
    /// Each wait for upstream bytes; 0 disables.
    pub socket_ms: u64,
    /// Connection establishment; 0 disables.
    pub connect_ms: u64,
    /// DNS cache TTL; 0 disables caching.
    pub dns_cache_ms: u64,
    pub retry_count: u32,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            request_ms: 0,
            socket_ms: 60_000,
            connect_ms: 60_000,
            dns_cache_ms: 0,
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShapingConfig {
    pub enabled: bool,
    pub upstream_kbps: u64,
    pub downstream_kbps: u64,
    pub latency_ms: u64,
    pub payload_percentage: u8,
    pub max_bits_per_second: u64,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        let s = ShaperSettings::default();
        Self {
            enabled: s.enabled,
            upstream_kbps: s.upstream_kbps,
            downstream_kbps: s.downstream_kbps,
            latency_ms: s.latency_ms,
            payload_percentage: s.payload_percentage,
            max_bits_per_second: s.max_bits_per_second,
        }
    }
}

fn default_blacklist_status() -> u16 {
    404
}

fn default_whitelist_status() -> u16 {
    403
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlacklistConfig {
    pub pattern: String,
    #[serde(default = "default_blacklist_status")]
    pub status: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhitelistConfig {
    pub patterns: Vec<String>,
    #[serde(default = "default_whitelist_status")]
    pub status: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewriteConfig {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuthConfig {
    pub domain: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RulesConfig {
    pub header_filter: Option<String>,
    pub headers: HashMap<String, String>,
    pub hosts: HashMap<String, String>,
    pub blacklist: Vec<BlacklistConfig>,
    pub whitelist: Option<WhitelistConfig>,
    pub rewrite: Vec<RewriteConfig>,
    pub basic_auth: Vec<BasicAuthConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub tls: TlsConfig,
    pub upstream: UpstreamConfig,
    pub capture: CaptureConfig,
    pub timeouts: TimeoutsConfig,
    pub shaping: ShapingConfig,
    pub rules: RulesConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// ```toml
    /// [timeouts]
    /// connect_ms = 5000
    ///
    /// [[rules.blacklist]]
    /// pattern = "https?://ads\\..*"
    /// status = 404
    /// ```
    pub async fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let s = tokio::fs::read_to_string(path_ref)
            .await
            .with_context(|| format!("failed to read config {}", path_ref.display()))?;
        let cfg = Self::from_toml_str(&s)
            .with_context(|| format!("failed to parse config {}", path_ref.display()))?;
        Ok(cfg)
    }

    /// Parse and validate.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check every value that a control-plane call would reject.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shaper_settings()?;
        self.upstream_settings()?;
        if self.general.port_range_start > self.general.port_range_end {
            return Err(ConfigError::parameter(
                "port_range",
                format!(
                    "start {} is after end {}",
                    self.general.port_range_start, self.general.port_range_end
                ),
            ));
        }
        self.apply_rules(&RuleEngine::new())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            headers: self.capture.headers,
            content: self.capture.content,
            binary_content: self.capture.binary_content,
        }
    }

    pub fn shaper_settings(&self) -> Result<ShaperSettings, ConfigError> {
        let s = &self.shaping;
        if s.payload_percentage > 100 {
            return Err(ConfigError::parameter(
                "payload_percentage",
                format!("{} is greater than 100", s.payload_percentage),
            ));
        }
        Ok(ShaperSettings {
            enabled: s.enabled,
            upstream_kbps: s.upstream_kbps,
            downstream_kbps: s.downstream_kbps,
            latency_ms: s.latency_ms,
            payload_percentage: s.payload_percentage,
            max_bits_per_second: s.max_bits_per_second,
        })
    }

    pub fn upstream_settings(&self) -> Result<UpstreamSettings, ConfigError> {
        let t = &self.timeouts;
        let ms = |v: u64| (v > 0).then(|| Duration::from_millis(v));
        Ok(UpstreamSettings {
            retry_count: t.retry_count,
            request_timeout: ms(t.request_ms),
            socket_timeout: ms(t.socket_ms),
            connect_timeout: ms(t.connect_ms),
            proxy: self
                .upstream
                .proxy
                .as_deref()
                .map(str::parse::<crate::upstream::ProxyAddr>)
                .transpose()?,
            trust_all_servers: self.upstream.trust_all_servers,
        })
    }

    /// Install the configured rules through the same calls the control
    /// plane uses, so both paths validate identically.
    pub fn apply_rules(&self, engine: &RuleEngine) -> Result<(), ConfigError> {
        let r = &self.rules;
        for entry in &r.blacklist {
            engine.blacklist_requests(&entry.pattern, entry.status)?;
        }
        if let Some(wl) = &r.whitelist {
            engine.whitelist_requests(&wl.patterns, wl.status)?;
        }
        for rw in &r.rewrite {
            engine.rewrite_url(&rw.pattern, &rw.replacement)?;
        }
        for (host, target) in &r.hosts {
            engine.remap_host(host, target)?;
        }
        for (name, value) in &r.headers {
            engine.add_header(name, value)?;
        }
        engine.set_header_filter(r.header_filter.as_deref())?;
        for auth in &r.basic_auth {
            engine.auto_basic_auth(&auth.domain, &auth.username, &auth.password)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::fs;
    use uuid::Uuid;

    #[test]
    fn defaults_are_applied() {
        let cfg = Config::default();
        assert!(cfg.tls.enabled);
        assert!(cfg.capture.headers);
        assert!(!cfg.capture.content);
        assert_eq!(cfg.timeouts.socket_ms, 60_000);
        assert_eq!(cfg.shaping.payload_percentage, 100);
        assert_eq!(cfg.general.port_range_start, 8081);
    }

    #[test]
    fn empty_document_is_default() -> anyhow::Result<()> {
        let cfg = Config::from_toml_str("")?;
        assert_eq!(cfg.general.port, 8080);
        let upstream = cfg.upstream_settings()?;
        assert_eq!(upstream.request_timeout, None);
        assert_eq!(upstream.connect_timeout, Some(Duration::from_secs(60)));
        Ok(())
    }

    #[tokio::test]
    async fn load_toml_file() -> anyhow::Result<()> {
        let tmp_toml =
            std::env::temp_dir().join(format!("har-proxy_cfg_test_{}.toml", Uuid::new_v4()));
        let toml = r#"
[general]
bind = "0.0.0.0"
port = 9090

[tls]
enabled = false
passthrough_domains = ["bank.test"]

[upstream]
proxy = "corp-proxy.test:3128"

[timeouts]
request_ms = 1500
retry_count = 2

[shaping]
enabled = true
downstream_kbps = 512
payload_percentage = 50

[rules]
header_filter = "https?://api\\.test/.*"
headers = { "X-Test" = "1" }
hosts = { "api.test" = "127.0.0.1" }

[[rules.blacklist]]
pattern = "https?://ads\\.test/.*"

[rules.whitelist]
patterns = ["https?://api\\.test/.*"]
status = 418

[[rules.rewrite]]
pattern = "http://old\\.test/(.*)"
replacement = "http://new.test/$1"
"#;
        fs::write(&tmp_toml, toml).await?;
        let cfg = Config::load_from_path(&tmp_toml).await?;
        fs::remove_file(&tmp_toml).await?;

        assert_eq!(cfg.general.port, 9090);
        assert!(!cfg.tls.enabled);
        assert_eq!(cfg.tls.passthrough_domains, vec!["bank.test".to_string()]);
        assert_eq!(cfg.rules.blacklist[0].status, 404);

        let upstream = cfg.upstream_settings()?;
        assert_eq!(upstream.retry_count, 2);
        assert_eq!(upstream.request_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(upstream.proxy.map(|p| p.port), Some(3128));

        let shaping = cfg.shaper_settings()?;
        assert_eq!(shaping.downstream_kbps, 512);
        assert_eq!(shaping.payload_percentage, 50);

        let engine = RuleEngine::new();
        cfg.apply_rules(&engine)?;
        let rules = engine.snapshot();
        assert_eq!(
            rules.check_blocked("http://ads.test/banner").map(|b| b.status()),
            Some(404)
        );
        assert_eq!(
            rules.check_blocked("http://other.test/").map(|b| b.status()),
            Some(418)
        );
        assert_eq!(rules.remap_host("api.test"), Some("127.0.0.1"));
        assert_eq!(rules.headers_for("http://api.test/x").len(), 1);
        assert!(rules.headers_for("http://elsewhere.test/").is_empty());
        Ok(())
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let toml = r#"
[[rules.blacklist]]
pattern = "("
"#;
        let err = Config::from_toml_str(toml).expect_err("bad regex");
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn payload_percentage_over_100_is_rejected() {
        let toml = "[shaping]\npayload_percentage = 150\n";
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn bad_upstream_proxy_is_rejected() {
        let toml = "[upstream]\nproxy = \"no-port-here\"\n";
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let toml = "[general]\nport_range_start = 9000\nport_range_end = 8000\n";
        assert!(Config::from_toml_str(toml).is_err());
    }

    #[tokio::test]
    async fn load_missing_file_errors() {
        let p = std::env::temp_dir().join("har-proxy_cfg_missing_does_not_exist.toml");
        let res = Config::load_from_path(&p).await;
        assert!(res.is_err());
    }
}
