// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use har_proxy::config::Config;
use har_proxy::proxy::{ProxyOptions, ProxyServer};

/// Config with interception off and nothing written to disk.
pub fn plain_config() -> Config {
    let mut cfg = Config::default();
    cfg.tls.enabled = false;
    cfg
}

// Start an instance on an ephemeral loopback port. It is accepting once
// start returns.
pub async fn start_proxy(cfg: &Config) -> anyhow::Result<ProxyServer> {
    ProxyServer::start(cfg, ProxyOptions::default()).await
}

/// reqwest client that sends every request through `proxy`.
pub fn proxied_client(proxy: SocketAddr) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", proxy))?)
        .timeout(Duration::from_secs(10))
        .build()?;
    Ok(client)
}

pub fn temp_path(prefix: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}_{}.{}", prefix, uuid::Uuid::new_v4(), ext))
}

// Send CONNECT and read the proxy's response head. Returns the stream
// positioned right after the head.
pub async fn open_connect(
    proxy_addr: SocketAddr,
    connect_host: &str,
    connect_port: u16,
) -> anyhow::Result<(TcpStream, String)> {
    let mut stream = TcpStream::connect(proxy_addr).await?;
    let connect = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
        host = connect_host,
        port = connect_port
    );
    stream.write_all(connect.as_bytes()).await?;

    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    let deadline = Instant::now() + Duration::from_secs(3);
    // one byte at a time so nothing past the head is consumed
    while !buf.ends_with(b"\r\n\r\n") {
        if Instant::now() > deadline {
            anyhow::bail!("timeout reading CONNECT response");
        }
        match timeout(Duration::from_millis(500), stream.read(&mut byte)).await {
            Ok(Ok(0)) => anyhow::bail!("unexpected EOF before complete CONNECT response"),
            Ok(Ok(_)) => buf.push(byte[0]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        }
    }
    Ok((stream, String::from_utf8_lossy(&buf).to_string()))
}

/// Read until EOF or `limit` elapses.
pub async fn read_to_end_within<S>(stream: &mut S, limit: Duration) -> anyhow::Result<Vec<u8>>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let deadline = Instant::now() + limit;
    let mut tmp = [0u8; 1024];
    loop {
        let now = Instant::now();
        if now > deadline {
            break;
        }
        match timeout(deadline - now, stream.read(&mut tmp)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => out.extend_from_slice(&tmp[..n]),
            Ok(Err(e)) => {
                if out.is_empty() {
                    return Err(e.into());
                }
                break;
            }
            Err(_) => break,
        }
    }
    Ok(out)
}
