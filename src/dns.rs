// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Hostname resolution with an optional time-bounded cache.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::UpstreamError;

#[derive(Debug, Clone)]
struct CachedAddrs {
    addrs: Vec<IpAddr>,
    resolved_at: Instant,
}

/// Resolver memoizing addresses per hostname. A TTL of zero disables caching.
pub struct DnsCache {
    store: Arc<RwLock<HashMap<String, CachedAddrs>>>,
    ttl_ms: AtomicU64,
}

/// Result of one lookup; `cached` tells whether the network was skipped.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub addrs: Vec<SocketAddr>,
    pub cached: bool,
}

impl DnsCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            ttl_ms: AtomicU64::new(ttl_ms),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    pub fn set_ttl_ms(&self, ttl_ms: u64) {
        self.ttl_ms.store(ttl_ms, Ordering::Relaxed);
        if ttl_ms == 0 {
            self.clear();
        }
    }

    pub async fn resolve(&self, host: &str, port: u16) -> Result<Resolved, UpstreamError> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(Resolved {
                addrs: vec![SocketAddr::new(ip, port)],
                cached: true,
            });
        }

        let key = host.to_ascii_lowercase();
        if let Some(ips) = self.lookup(&key) {
            trace!(%host, "dns cache hit");
            return Ok(Resolved {
                addrs: ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect(),
                cached: true,
            });
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| UpstreamError::Dns {
                host: host.to_string(),
                reason: e.to_string(),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(UpstreamError::Dns {
                host: host.to_string(),
                reason: "no addresses returned".into(),
            });
        }
        debug!(%host, count = addrs.len(), "resolved");

        if !self.ttl().is_zero() {
            match self.store.write() {
                Ok(mut store) => {
                    store.insert(
                        key,
                        CachedAddrs {
                            addrs: addrs.iter().map(|a| a.ip()).collect(),
                            resolved_at: Instant::now(),
                        },
                    );
                }
                Err(_) => warn!("DnsCache lock poisoned during write"),
            }
        }

        Ok(Resolved {
            addrs,
            cached: false,
        })
    }

    fn lookup(&self, key: &str) -> Option<Vec<IpAddr>> {
        let ttl = self.ttl();
        if ttl.is_zero() {
            return None;
        }
        match self.store.read() {
            Ok(store) => store
                .get(key)
                .filter(|c| c.resolved_at.elapsed() < ttl)
                .map(|c| c.addrs.clone()),
            Err(_) => {
                warn!("DnsCache lock poisoned during read");
                None
            }
        }
    }

    pub fn invalidate(&self, host: &str) {
        match self.store.write() {
            Ok(mut store) => {
                store.remove(&host.to_ascii_lowercase());
            }
            Err(_) => warn!("DnsCache lock poisoned during invalidate"),
        }
    }

    pub fn clear(&self) {
        match self.store.write() {
            Ok(mut store) => store.clear(),
            Err(_) => warn!("DnsCache lock poisoned during clear"),
        }
    }

    /// Drop entries older than the TTL.
    pub fn cleanup_expired(&self) {
        let ttl = self.ttl();
        match self.store.write() {
            Ok(mut store) => store.retain(|_, c| !ttl.is_zero() && c.resolved_at.elapsed() < ttl),
            Err(_) => warn!("DnsCache lock poisoned during cleanup"),
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
