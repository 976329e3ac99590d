// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use har_proxy::config::Config;
use har_proxy::manager::{CreateOptions, ProxyManager};

mod common;
use common::{proxied_client, temp_path};

#[tokio::test]
async fn instances_from_a_config_file_are_isolated() -> anyhow::Result<()> {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/open"))
        .and(header("x-env", "staging"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&mock)
        .await;

    let cfg_path = temp_path("har_proxy_manager_cfg", "toml");
    let toml = r#"
[tls]
enabled = false

[rules.headers]
"X-Env" = "staging"

[[rules.blacklist]]
pattern = "http://127\\.0\\.0\\.1:\\d+/closed"
status = 410
"#;
    tokio::fs::write(&cfg_path, toml).await?;
    let cfg = Config::load_from_path(&cfg_path).await?;
    let manager = ProxyManager::new(cfg);

    let first = manager
        .create(CreateOptions {
            port: Some(0),
            ..CreateOptions::default()
        })
        .await?;
    let second = manager
        .create(CreateOptions {
            port: Some(0),
            ..CreateOptions::default()
        })
        .await?;
    assert_eq!(manager.list().len(), 2);

    // a rule added on one instance does not leak into the other
    first.blacklist_requests(r"http://127\.0\.0\.1:\d+/open", 403)?;

    let via_first = proxied_client(first.addr())?;
    let via_second = proxied_client(second.addr())?;

    let blocked = via_first.get(format!("{}/open", mock.uri())).send().await?;
    assert_eq!(blocked.status().as_u16(), 403);
    let closed = via_second.get(format!("{}/closed", mock.uri())).send().await?;
    assert_eq!(closed.status().as_u16(), 410);

    first.clear_blacklist();
    for client in [&via_first, &via_second] {
        let resp = client.get(format!("{}/open", mock.uri())).send().await?;
        assert_eq!(resp.status().as_u16(), 200);
    }

    assert!(manager.delete(first.port()).await);
    assert_eq!(manager.list(), vec![second.port()]);

    manager.shutdown().await;
    let _ = tokio::fs::remove_file(&cfg_path).await;
    Ok(())
}

#[tokio::test]
async fn invalid_rules_in_config_file_are_rejected() -> anyhow::Result<()> {
    let cfg_path = temp_path("har_proxy_bad_cfg", "toml");
    tokio::fs::write(
        &cfg_path,
        "[[rules.blacklist]]\npattern = \"(unclosed\"\nstatus = 404\n",
    )
    .await?;
    let res = Config::load_from_path(&cfg_path).await;
    assert!(res.is_err());
    let _ = tokio::fs::remove_file(&cfg_path).await;
    Ok(())
}
