// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use har_proxy::config::Config;

mod common;
use common::{open_connect, plain_config, start_proxy};

// Toy server that expects `ping` and replies `pong`.
async fn ping_pong_server() -> anyhow::Result<(u16, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let task = tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 4];
            if socket.read_exact(&mut buf).await.is_ok() && &buf == b"ping" {
                let _ = socket.write_all(b"pong").await;
            }
        }
    });
    Ok((port, task))
}

#[tokio::test]
async fn connect_passthrough_tunnels_raw_tcp() -> anyhow::Result<()> {
    let (port, server_task) = ping_pong_server().await?;

    let mut cfg = Config::default();
    // a literal IP suffix so the tunnel reaches the toy server untouched
    cfg.tls.passthrough_domains = vec!["127.0.0.1".into()];
    let proxy = start_proxy(&cfg).await?;
    proxy.new_har(None, None);

    let (mut stream, head) = open_connect(proxy.addr(), "127.0.0.1", port).await?;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

    stream.write_all(b"ping").await?;
    let mut resp = [0u8; 4];
    timeout(Duration::from_secs(1), stream.read_exact(&mut resp)).await??;
    assert_eq!(&resp, b"pong");

    // opaque tunnels are not recorded
    let har = proxy.get_har().ok_or_else(|| anyhow::anyhow!("no har"))?;
    assert!(har.log.entries.is_empty());

    proxy.stop().await;
    let _ = server_task.await;
    Ok(())
}

#[tokio::test]
async fn connect_without_interception_tunnels() -> anyhow::Result<()> {
    let (port, server_task) = ping_pong_server().await?;
    let proxy = start_proxy(&plain_config()).await?;

    let (mut stream, head) = open_connect(proxy.addr(), "127.0.0.1", port).await?;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    stream.write_all(b"ping").await?;
    let mut resp = [0u8; 4];
    timeout(Duration::from_secs(1), stream.read_exact(&mut resp)).await??;
    assert_eq!(&resp, b"pong");

    proxy.stop().await;
    let _ = server_task.await;
    Ok(())
}

#[tokio::test]
async fn tunnel_follows_host_remap() -> anyhow::Result<()> {
    let (port, server_task) = ping_pong_server().await?;
    let proxy = start_proxy(&plain_config()).await?;
    proxy.remap_host("tunnel.test", "127.0.0.1")?;

    let (mut stream, head) = open_connect(proxy.addr(), "tunnel.test", port).await?;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    stream.write_all(b"ping").await?;
    let mut resp = [0u8; 4];
    timeout(Duration::from_secs(1), stream.read_exact(&mut resp)).await??;
    assert_eq!(&resp, b"pong");

    proxy.stop().await;
    let _ = server_task.await;
    Ok(())
}

#[tokio::test]
async fn blacklisted_tunnel_is_refused() -> anyhow::Result<()> {
    let proxy = start_proxy(&plain_config()).await?;
    proxy.blacklist_requests(r"https://tracker\.test/", 403)?;
    proxy.whitelist_requests(&[r"https://(tracker|allowed)\.test(:\d+)?/"], 451)?;

    let (_, head) = open_connect(proxy.addr(), "tracker.test", 443).await?;
    assert!(head.starts_with("HTTP/1.1 403"), "{}", head);

    let (_, head) = open_connect(proxy.addr(), "elsewhere.test", 443).await?;
    assert!(head.starts_with("HTTP/1.1 451"), "{}", head);

    proxy.stop().await;
    Ok(())
}

#[tokio::test]
async fn connect_passthrough_upstream_unavailable() -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let proxy = start_proxy(&plain_config()).await?;
    let (_stream, head) = open_connect(proxy.addr(), "127.0.0.1", port).await?;
    // the tunnel is only confirmed once the server side is connected
    assert!(head.starts_with("HTTP/1.1 502"), "{}", head);

    proxy.stop().await;
    Ok(())
}

#[tokio::test]
async fn nested_connect_inside_tunnel_is_rejected() -> anyhow::Result<()> {
    use rustls::pki_types::ServerName;
    use std::sync::Arc;

    let proxy = start_proxy(&Config::default()).await?;
    let (stream, head) = open_connect(proxy.addr(), "outer.test", 443).await?;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

    let pem = proxy
        .ca_cert_pem()
        .ok_or_else(|| anyhow::anyhow!("interception disabled"))?;
    let mut roots = rustls::RootCertStore::empty();
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    roots.add_parsable_certificates(certs);
    let client_cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_cfg));
    let name = ServerName::try_from("outer.test".to_string())
        .map_err(|_| anyhow::anyhow!("invalid server name"))?;
    let mut tls = connector.connect(name, stream).await?;

    tls.write_all(b"CONNECT inner.test:443 HTTP/1.1\r\nHost: inner.test:443\r\n\r\n")
        .await?;
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(2), tls.read(&mut buf)).await??;
    let resp = String::from_utf8_lossy(&buf[..n]);
    assert!(resp.starts_with("HTTP/1.1 405"), "{}", resp);

    proxy.stop().await;
    Ok(())
}
