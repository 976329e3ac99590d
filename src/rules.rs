// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! URL rule tables: blacklist, whitelist, rewrite, host remap and
//! per-request header injection.
//!
//! A [`RuleSet`] is immutable once published. [`RuleEngine`] swaps whole
//! sets, so a request that took a [`RuleEngine::snapshot`] never sees a
//! partially-applied change.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hyper::header::{HeaderName, HeaderValue};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Regex that must match the whole URL.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    regex: Regex,
}

impl UrlPattern {
    pub fn full_match(pattern: &str) -> Result<Self, ConfigError> {
        let regex =
            Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| ConfigError::InvalidRegex {
                pattern: pattern.to_string(),
                source: e,
            })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }
}

#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub pattern: UrlPattern,
    pub status: u16,
}

#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    pub patterns: Vec<UrlPattern>,
    pub status: u16,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: Regex,
    replacement: String,
}

impl RewriteRule {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|e| ConfigError::InvalidRegex {
            pattern: pattern.to_string(),
            source: e,
        })?;
        Ok(Self {
            pattern: regex,
            replacement: replacement.to_string(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }
}

/// Why a request was refused before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Blacklisted(u16),
    NotWhitelisted(u16),
}

impl Block {
    pub fn status(&self) -> u16 {
        match self {
            Block::Blacklisted(s) | Block::NotWhitelisted(s) => *s,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Block::Blacklisted(_) => "blacklisted",
            Block::NotWhitelisted(_) => "not whitelisted",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    blacklist: Vec<BlacklistEntry>,
    whitelist: Whitelist,
    rewrites: Vec<RewriteRule>,
    host_remap: HashMap<String, String>,
    headers: Vec<(HeaderName, HeaderValue)>,
    header_filter: Option<UrlPattern>,
    basic_auth: HashMap<String, HeaderValue>,
}

impl RuleSet {
    /// Blacklist first, then whitelist. First blacklist match wins.
    pub fn check_blocked(&self, url: &str) -> Option<Block> {
        if let Some(entry) = self.blacklist.iter().find(|b| b.pattern.matches(url)) {
            return Some(Block::Blacklisted(entry.status));
        }
        if self.whitelist.enabled && !self.whitelist.patterns.iter().any(|p| p.matches(url)) {
            return Some(Block::NotWhitelisted(self.whitelist.status));
        }
        None
    }

    /// Apply every rewrite rule in order, each one against the output of the
    /// previous. Returns `None` when the URL is unchanged.
    pub fn rewrite(&self, url: &str) -> Option<String> {
        let mut current = url.to_string();
        for rule in &self.rewrites {
            if rule.pattern.is_match(&current) {
                current = rule
                    .pattern
                    .replace_all(&current, rule.replacement.as_str())
                    .into_owned();
            }
        }
        if current == url {
            None
        } else {
            Some(current)
        }
    }

    pub fn remap_host(&self, host: &str) -> Option<&str> {
        self.host_remap
            .get(&host.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Headers to inject for `url`, honouring the optional URL filter.
    pub fn headers_for(&self, url: &str) -> &[(HeaderName, HeaderValue)] {
        match &self.header_filter {
            Some(filter) if !filter.matches(url) => &[],
            _ => &self.headers,
        }
    }

    pub fn basic_auth_for(&self, host: &str) -> Option<&HeaderValue> {
        self.basic_auth.get(host)
    }

    pub fn blacklist(&self) -> &[BlacklistEntry] {
        &self.blacklist
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn rewrites(&self) -> &[RewriteRule] {
        &self.rewrites
    }

    pub fn host_remaps(&self) -> &HashMap<String, String> {
        &self.host_remap
    }
}

fn validate_status(status: u16) -> Result<u16, ConfigError> {
    if (100..=599).contains(&status) {
        Ok(status)
    } else {
        Err(ConfigError::InvalidStatus(status))
    }
}

/// Holder of the current [`RuleSet`]. Writers copy, modify and swap.
#[derive(Default)]
pub struct RuleEngine {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                warn!("rule set lock poisoned during read");
                poisoned.into_inner().clone()
            }
        }
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut RuleSet),
    {
        let mut guard = match self.current.write() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("rule set lock poisoned during write");
                poisoned.into_inner()
            }
        };
        let mut next = RuleSet::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    pub fn blacklist_requests(&self, pattern: &str, status: u16) -> Result<(), ConfigError> {
        let status = validate_status(status)?;
        let pattern = UrlPattern::full_match(pattern)?;
        debug!(pattern = pattern.as_str(), status, "blacklist rule added");
        self.update(|rs| rs.blacklist.push(BlacklistEntry { pattern, status }));
        Ok(())
    }

    pub fn clear_blacklist(&self) {
        self.update(|rs| rs.blacklist.clear());
    }

    /// Replace the whitelist and enable it.
    pub fn whitelist_requests<S: AsRef<str>>(
        &self,
        patterns: &[S],
        status: u16,
    ) -> Result<(), ConfigError> {
        let status = validate_status(status)?;
        let compiled = patterns
            .iter()
            .map(|p| UrlPattern::full_match(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = compiled.len(), status, "whitelist enabled");
        self.update(|rs| {
            rs.whitelist = Whitelist {
                patterns: compiled,
                status,
                enabled: true,
            }
        });
        Ok(())
    }

    pub fn clear_whitelist(&self) {
        self.update(|rs| rs.whitelist = Whitelist::default());
    }

    pub fn rewrite_url(&self, pattern: &str, replacement: &str) -> Result<(), ConfigError> {
        let rule = RewriteRule::new(pattern, replacement)?;
        self.update(|rs| rs.rewrites.push(rule));
        Ok(())
    }

    pub fn clear_rewrite_rules(&self) {
        self.update(|rs| rs.rewrites.clear());
    }

    pub fn remap_host(&self, host: &str, new_host: &str) -> Result<(), ConfigError> {
        if host.trim().is_empty() || new_host.trim().is_empty() {
            return Err(ConfigError::parameter("host", "host names must not be empty"));
        }
        let (host, new_host) = (host.to_ascii_lowercase(), new_host.to_string());
        self.update(|rs| {
            rs.host_remap.insert(host, new_host);
        });
        Ok(())
    }

    pub fn clear_host_remaps(&self) {
        self.update(|rs| rs.host_remap.clear());
    }

    /// Add or replace a header injected into outgoing requests.
    pub fn add_header(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ConfigError::parameter("header name", e.to_string()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ConfigError::parameter("header value", e.to_string()))?;
        self.update(|rs| {
            rs.headers.retain(|(n, _)| *n != name);
            rs.headers.push((name, value));
        });
        Ok(())
    }

    pub fn clear_headers(&self) {
        self.update(|rs| rs.headers.clear());
    }

    /// Restrict header injection to URLs fully matching `pattern`; `None`
    /// lifts the restriction.
    pub fn set_header_filter(&self, pattern: Option<&str>) -> Result<(), ConfigError> {
        let filter = pattern.map(UrlPattern::full_match).transpose()?;
        self.update(|rs| rs.header_filter = filter);
        Ok(())
    }

    pub fn auto_basic_auth(
        &self,
        domain: &str,
        username: &str,
        password: &str,
    ) -> Result<(), ConfigError> {
        let token = BASE64.encode(format!("{}:{}", username, password));
        let value = HeaderValue::from_str(&format!("Basic {}", token))
            .map_err(|e| ConfigError::parameter("credentials", e.to_string()))?;
        let domain = domain.to_ascii_lowercase();
        self.update(|rs| {
            rs.basic_auth.insert(domain, value);
        });
        Ok(())
    }

    pub fn stop_auto_basic_auth(&self, domain: &str) {
        let domain = domain.to_ascii_lowercase();
        self.update(|rs| {
            rs.basic_auth.remove(&domain);
        });
    }
}
