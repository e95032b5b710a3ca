// tests/integration/http_api_test.rs

//! The admin HTTP API: provisioning, service listing, schema sad paths,
//! and auth denial.

use super::fixtures::init_tracing;
use ahad::client::{self, DialOpts};
use ahad::config::CellConfig;
use ahad::core::AhaCell;
use ahad::core::registry::SvcInfo;
use ahad::server::{self, ServerHandle};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const NETW: &str = "loop.vertex.link";
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_http_aha(with_network: bool) -> (TempDir, Arc<AhaCell>, ServerHandle, String) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let mut conf = CellConfig::default();
    conf.aha_name = Some("aha".to_string());
    conf.auth_passwd = Some("secret".to_string());
    conf.dmon_listen = Some("tcp://127.0.0.1:0/".to_string());
    conf.https_port = Some(0);
    if with_network {
        conf.aha_network = Some(NETW.to_string());
        conf.provision_listen = Some("ssl://127.0.0.1:0".to_string());
        conf.aha_urls = vec![format!("ssl://127.0.0.1:27492?ca={NETW}&hostname=aha.{NETW}")];
    }

    let aha = AhaCell::open(dir.path(), conf).await.unwrap();
    let handle = server::launch_aha(aha.clone()).await.unwrap();
    let base = format!("http://127.0.0.1:{}", handle.http_addr.unwrap().port());
    (dir, aha, handle, base)
}

#[tokio::test]
async fn test_http_provision_service() {
    let (_dir, aha, handle, base) = spawn_http_aha(true).await;
    let url = format!("{base}/api/v1/aha/provision/service");
    let sess = reqwest::Client::new();

    // Simple request works.
    let info: Value = sess
        .post(&url)
        .basic_auth("root", Some("secret"))
        .json(&json!({"name": "00.foosvc"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["status"], "ok");
    let provurl = info["result"]["url"].as_str().unwrap().to_string();
    assert!(provurl.starts_with("ssl://127.0.0.1:"));

    // The minted token serves the full provisioning bundle.
    let opts = DialOpts {
        insecure: true,
        ..Default::default()
    };
    let iden = provurl.rsplit('/').next().unwrap();
    let proxy = client::open_url_opts(&provurl, &opts).await.unwrap();
    proxy
        .call("provResolve", json!({"iden": iden}), CALL_TIMEOUT)
        .await
        .unwrap();
    let provconf = proxy.call("getProvInfo", json!({}), CALL_TIMEOUT).await.unwrap();
    assert!(provconf.get("iden").is_some());
    assert_eq!(provconf["conf"]["aha:user"], "root");
    proxy.fini().await;

    // The full API carries ports, mirror, and conf overrides through.
    let data = json!({
        "name": "01.foosvc",
        "provinfo": {
            "dmon:port": 12345,
            "https:port": 8443,
            "mirror": "foosvc",
            "conf": {"aha:user": "test"},
        },
    });
    let info: Value = sess
        .post(&url)
        .basic_auth("root", Some("secret"))
        .json(&data)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["status"], "ok");
    let provurl = info["result"]["url"].as_str().unwrap().to_string();
    let iden = provurl.rsplit('/').next().unwrap().to_string();
    let token = aha.get_prov_token(&iden).unwrap();
    let conf = token.provinfo.get("conf").unwrap();
    assert_eq!(conf["aha:user"], "test");
    assert_eq!(conf["https:port"], 8443);
    assert!(
        conf["dmon:listen"]
            .as_str()
            .unwrap()
            .starts_with("ssl://0.0.0.0:12345")
    );
    assert_eq!(conf["mirror"], "aha://test@foosvc.loop.vertex.link");

    // Sad paths all land as SchemaViolation.
    for body in [
        None,
        Some(json!({})),
        Some(json!({"name": 1234})),
        Some(json!({"name": ""})),
        Some(json!({"name": "00.newp", "provinfo": 5309})),
        Some(json!({"name": "00.newp", "provinfo": {"dmon:port": -1}})),
        Some(json!({"name": "00.newp", "newp": "hehe"})),
    ] {
        let mut req = sess.post(&url).basic_auth("root", Some("secret"));
        if let Some(body) = &body {
            req = req.json(body);
        }
        let info: Value = req.send().await.unwrap().json().await.unwrap();
        assert_eq!(info["status"], "err", "body {body:?}");
        assert_eq!(info["code"], "SchemaViolation", "body {body:?}");
    }

    // Non-admins are refused.
    aha.add_user("lowuser", Some("lowuser"), false).await.unwrap();
    let info: Value = sess
        .post(&url)
        .basic_auth("lowuser", Some("lowuser"))
        .json(&json!({"name": "00.newp"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["status"], "err");
    assert_eq!(info["code"], "AuthDeny");

    handle.shutdown();
}

#[tokio::test]
async fn test_http_provision_needs_conf() {
    let (_dir, _aha, handle, base) = spawn_http_aha(false).await;
    let url = format!("{base}/api/v1/aha/provision/service");

    let info: Value = reqwest::Client::new()
        .post(&url)
        .basic_auth("root", Some("secret"))
        .json(&json!({"name": "00.newp"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["status"], "err");
    assert_eq!(info["code"], "NeedConfValu");

    handle.shutdown();
}

#[tokio::test]
async fn test_http_list_services() {
    let (_dir, aha, handle, base) = spawn_http_aha(true).await;
    let url = format!("{base}/api/v1/aha/services");
    let sess = reqwest::Client::new();

    let info = SvcInfo {
        online: Some("l0".to_string()),
        ..Default::default()
    };
    aha.add_aha_svc("0.cryo", info.clone(), Some("mynet"), None)
        .await
        .unwrap();
    aha.add_aha_svc("cryo", info, Some("mynet"), None).await.unwrap();

    let body: Value = sess
        .get(&url)
        .basic_auth("root", Some("secret"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    let result = body["result"].as_array().unwrap();
    assert_eq!(result.len(), 2);
    let names: Vec<&str> = result
        .iter()
        .map(|svc| svc["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"0.cryo.mynet"));
    assert!(names.contains(&"cryo.mynet"));

    let body: Value = sess
        .get(&url)
        .basic_auth("root", Some("secret"))
        .json(&json!({"network": "mynet"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let filtered = body["result"].as_array().unwrap();
    assert_eq!(filtered.len(), 2);
    assert!(filtered.iter().all(|svc| svc["network"] == "mynet"));

    let body: Value = sess
        .get(&url)
        .basic_auth("root", Some("secret"))
        .json(&json!({"network": "newp"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["result"].as_array().unwrap().len(), 0);

    // Unknown keys fail the declared schema, with or without valid ones.
    for body in [json!({"newp": "hehe"}), json!({"network": "mynet", "newp": "hehe"})] {
        let info: Value = sess
            .get(&url)
            .basic_auth("root", Some("secret"))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["status"], "err");
        assert_eq!(info["code"], "SchemaViolation");
    }

    // Reads are admin-only as well.
    aha.add_user("lowuser", Some("lowuser"), false).await.unwrap();
    let info: Value = sess
        .get(&url)
        .basic_auth("lowuser", Some("lowuser"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["status"], "err");
    assert_eq!(info["code"], "AuthDeny");

    handle.shutdown();
}

#[tokio::test]
async fn test_http_metrics_endpoint() {
    let (_dir, _aha, handle, base) = spawn_http_aha(false).await;

    let text = reqwest::get(format!("{base}/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("ahad_"));

    handle.shutdown();
}
