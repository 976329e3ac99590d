// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use clap::Parser;
use std::net::IpAddr;
use tokio::signal;

use har_proxy::config::Config;
use har_proxy::har::save_har;
use har_proxy::proxy::{ProxyOptions, ProxyServer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "har-proxy")]
struct Args {
    /// Optional config TOML path
    #[arg(long)]
    config: Option<String>,

    /// Bind address; overrides `general.bind`
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Listen port; overrides `general.port`
    #[arg(long)]
    port: Option<u16>,

    /// Chain through another HTTP proxy, e.g. 10.0.0.1:3128
    #[arg(long)]
    upstream_proxy: Option<String>,

    /// Write the recorded HAR here on shutdown
    #[arg(long, default_value = "capture.har")]
    har: String,
}

async fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::load_from_path(p).await,
        None => Ok(Config::default()),
    }
}

fn proxy_options(args: &Args, cfg: &Config) -> ProxyOptions {
    ProxyOptions {
        bind: args.bind.unwrap_or(cfg.general.bind),
        port: args.port.unwrap_or(cfg.general.port),
        upstream_proxy: args.upstream_proxy.clone(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let cfg = load_config(args.config.as_deref()).await?;
    let server = ProxyServer::start(&cfg, proxy_options(&args, &cfg)).await?;
    server.new_har(cfg.capture.initial_page_ref.clone(), None);
    if server.ca_cert_pem().is_some() {
        info!(
            "TLS interception on; CA certificate at http://{}{}",
            server.addr(),
            har_proxy::proxy::CA_CERT_PATH
        );
    }

    if let Err(e) = signal::ctrl_c().await {
        warn!(%e, "failed to listen for ctrl-c");
    }
    info!("shutting down");
    server.stop().await;

    match server.end_har() {
        Some(har) => {
            save_har(&args.har, &har).await?;
            info!(path = %args.har, entries = har.log.entries.len(), "HAR written");
        }
        None => warn!("no HAR was recorded"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::fs;
    use uuid::Uuid;

    #[test]
    fn cli_flags_parse() {
        let args = Args::parse_from([
            "har-proxy",
            "--bind",
            "0.0.0.0",
            "--port",
            "9090",
            "--upstream-proxy",
            "10.0.0.1:3128",
            "--har",
            "out.har",
        ]);
        let opts = proxy_options(&args, &Config::default());
        assert_eq!(opts.bind.to_string(), "0.0.0.0");
        assert_eq!(opts.port, 9090);
        assert_eq!(opts.upstream_proxy.as_deref(), Some("10.0.0.1:3128"));
        assert_eq!(args.har, "out.har");
    }

    #[test]
    fn config_values_apply_without_flags() {
        let args = Args::parse_from(["har-proxy"]);
        let mut cfg = Config::default();
        cfg.general.port = 8181;
        let opts = proxy_options(&args, &cfg);
        assert_eq!(opts.port, 8181);
        assert_eq!(opts.bind, cfg.general.bind);
        assert!(opts.upstream_proxy.is_none());
    }

    #[tokio::test]
    async fn main_cli_config_loads_toml() {
        let tmp = std::env::temp_dir().join(format!("har_proxy_main_cfg_{}.toml", Uuid::new_v4()));
        let toml = r#"[general]
port = 9191

[capture]
initial_page_ref = "Landing"
"#;
        fs::write(&tmp, toml).await.expect("write tmp");

        let cfg = load_config(tmp.to_str()).await.expect("load config");
        assert_eq!(cfg.general.port, 9191);
        assert_eq!(cfg.capture.initial_page_ref.as_deref(), Some("Landing"));

        let _ = fs::remove_file(&tmp).await;
    }

    #[tokio::test]
    async fn main_missing_config_is_an_error() {
        let missing = std::env::temp_dir().join(format!("har_proxy_missing_{}.toml", Uuid::new_v4()));
        assert!(load_config(missing.to_str()).await.is_err());
        assert!(load_config(None).await.is_ok());
    }
}
