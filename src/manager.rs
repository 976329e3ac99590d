// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Registry of running proxy instances, keyed by listening port.

use crate::config::Config;
use crate::proxy::{ProxyOptions, ProxyServer};
use crate::upstream::ProxyAddr;
use anyhow::Context;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Per-instance overrides for [`ProxyManager::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Replaces the manager's default configuration for this instance.
    pub config: Option<Config>,
    /// Without a port, the first free port of the configured range is used.
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub upstream_proxy: Option<String>,
}

pub struct ProxyManager {
    defaults: Config,
    instances: RwLock<HashMap<u16, Arc<ProxyServer>>>,
}

impl ProxyManager {
    pub fn new(defaults: Config) -> Self {
        Self {
            defaults,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Start an instance and register it under its listening port.
    pub async fn create(&self, options: CreateOptions) -> anyhow::Result<Arc<ProxyServer>> {
        let cfg = options.config.as_ref().unwrap_or(&self.defaults);
        let bind = options.bind.unwrap_or(cfg.general.bind);

        let server = match options.port {
            Some(port) => {
                if port != 0 && self.get(port).is_some() {
                    anyhow::bail!("a proxy is already registered on port {}", port);
                }
                ProxyServer::start(
                    cfg,
                    ProxyOptions {
                        bind,
                        port,
                        upstream_proxy: options.upstream_proxy.clone(),
                    },
                )
                .await?
            }
            None => self.start_in_range(cfg, bind, options.upstream_proxy.clone()).await?,
        };

        let server = Arc::new(server);
        let port = server.port();
        match self.instances.write() {
            Ok(mut map) => {
                map.insert(port, server.clone());
            }
            Err(poisoned) => {
                warn!("ProxyManager lock poisoned during create");
                poisoned.into_inner().insert(port, server.clone());
            }
        }
        info!(port, "proxy created");
        Ok(server)
    }

    async fn start_in_range(
        &self,
        cfg: &Config,
        bind: IpAddr,
        upstream_proxy: Option<String>,
    ) -> anyhow::Result<ProxyServer> {
        // validated once; only bind failures move on to the next port
        cfg.validate().context("invalid proxy configuration")?;
        if let Some(proxy) = upstream_proxy.as_deref() {
            proxy
                .parse::<ProxyAddr>()
                .context("invalid upstream proxy")?;
        }

        let start = cfg.general.port_range_start;
        let end = cfg.general.port_range_end;
        for port in start..=end {
            if self.get(port).is_some() {
                continue;
            }
            let attempt = ProxyServer::start(
                cfg,
                ProxyOptions {
                    bind,
                    port,
                    upstream_proxy: upstream_proxy.clone(),
                },
            )
            .await;
            match attempt {
                Ok(server) => return Ok(server),
                Err(e) if is_addr_in_use(&e) => debug!(port, "port unavailable: {:#}", e),
                Err(e) => return Err(e),
            }
        }
        Err(anyhow::anyhow!("no free port in {}..={}", start, end))
            .context("cannot allocate a proxy port")
    }

    pub fn get(&self, port: u16) -> Option<Arc<ProxyServer>> {
        match self.instances.read() {
            Ok(map) => map.get(&port).cloned(),
            Err(poisoned) => {
                warn!("ProxyManager lock poisoned during read");
                poisoned.into_inner().get(&port).cloned()
            }
        }
    }

    /// Stop and unregister. Returns whether an instance was registered.
    pub async fn delete(&self, port: u16) -> bool {
        let removed = match self.instances.write() {
            Ok(mut map) => map.remove(&port),
            Err(poisoned) => poisoned.into_inner().remove(&port),
        };
        match removed {
            Some(server) => {
                server.stop().await;
                info!(port, "proxy deleted");
                true
            }
            None => false,
        }
    }

    /// Registered ports in ascending order.
    pub fn list(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = match self.instances.read() {
            Ok(map) => map.keys().copied().collect(),
            Err(poisoned) => poisoned.into_inner().keys().copied().collect(),
        };
        ports.sort_unstable();
        ports
    }

    /// Stop every registered instance.
    pub async fn shutdown(&self) {
        for port in self.list() {
            self.delete(port).await;
        }
    }
}

fn is_addr_in_use(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|e| e.kind() == io::ErrorKind::AddrInUse)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut cfg = Config::default();
        cfg.tls.enabled = false;
        cfg
    }

    #[tokio::test]
    async fn create_get_list_delete() -> anyhow::Result<()> {
        let manager = ProxyManager::new(cfg());
        let a = manager
            .create(CreateOptions {
                port: Some(0),
                ..CreateOptions::default()
            })
            .await?;
        let b = manager
            .create(CreateOptions {
                port: Some(0),
                ..CreateOptions::default()
            })
            .await?;

        let mut expected = vec![a.port(), b.port()];
        expected.sort_unstable();
        assert_eq!(manager.list(), expected);
        assert!(manager.get(a.port()).is_some());

        assert!(manager.delete(a.port()).await);
        assert!(!manager.delete(a.port()).await);
        assert!(manager.get(a.port()).is_none());
        assert_eq!(manager.list(), vec![b.port()]);

        manager.shutdown().await;
        assert!(manager.list().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn create_without_port_uses_range_and_skips_taken_ports() -> anyhow::Result<()> {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0")?;
        let taken = blocker.local_addr()?.port();

        let mut defaults = cfg();
        defaults.general.port_range_start = taken;
        defaults.general.port_range_end = taken.saturating_add(20);
        let manager = ProxyManager::new(defaults);

        let server = manager.create(CreateOptions::default()).await?;
        assert_ne!(server.port(), taken);
        assert!(server.port() > taken && server.port() <= taken.saturating_add(20));
        manager.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn create_on_registered_port_fails() -> anyhow::Result<()> {
        let manager = ProxyManager::new(cfg());
        let server = manager
            .create(CreateOptions {
                port: Some(0),
                ..CreateOptions::default()
            })
            .await?;
        let again = manager
            .create(CreateOptions {
                port: Some(server.port()),
                ..CreateOptions::default()
            })
            .await;
        assert!(again.is_err());
        manager.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn invalid_per_instance_config_is_rejected() {
        let manager = ProxyManager::new(cfg());
        let mut bad = cfg();
        bad.shaping.payload_percentage = 150;
        let res = manager
            .create(CreateOptions {
                config: Some(bad),
                port: Some(0),
                ..CreateOptions::default()
            })
            .await;
        assert!(res.is_err());
        assert!(manager.list().is_empty());
    }

    fn free_port() -> anyhow::Result<u16> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        Ok(listener.local_addr()?.port())
    }

    async fn create_error(manager: &ProxyManager, options: CreateOptions) -> String {
        match manager.create(options).await {
            Ok(server) => panic!("unexpectedly started on port {}", server.port()),
            Err(e) => format!("{:#}", e),
        }
    }

    #[tokio::test]
    async fn invalid_config_is_reported_when_allocating_from_range() -> anyhow::Result<()> {
        let port = free_port()?;
        let manager = ProxyManager::new(cfg());
        let mut bad = cfg();
        bad.general.port_range_start = port;
        bad.general.port_range_end = port;
        bad.shaping.payload_percentage = 150;

        let err = create_error(
            &manager,
            CreateOptions {
                config: Some(bad),
                ..CreateOptions::default()
            },
        )
        .await;
        assert!(err.contains("payload_percentage"), "{}", err);
        assert!(!err.contains("no free port"), "{}", err);
        assert!(manager.list().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn invalid_upstream_proxy_is_reported_when_allocating_from_range() {
        let manager = ProxyManager::new(cfg());
        let err = create_error(
            &manager,
            CreateOptions {
                upstream_proxy: Some("not a proxy".into()),
                ..CreateOptions::default()
            },
        )
        .await;
        assert!(err.contains("upstream_proxy"), "{}", err);
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn ca_failure_is_not_retried_on_other_ports() -> anyhow::Result<()> {
        let port = free_port()?;
        let mut bad = Config::default();
        bad.general.port_range_start = port;
        bad.general.port_range_end = port.saturating_add(5);
        bad.tls.ca_cert_path = Some("/nonexistent-dir/ca.crt".into());
        let manager = ProxyManager::new(bad);

        let err = create_error(&manager, CreateOptions::default()).await;
        assert!(err.contains("ca_key_path"), "{}", err);
        assert!(!err.contains("no free port"), "{}", err);
        Ok(())
    }
}
