use ahad::config::CellConfig;
use ahad::core::AhaCell;
use ahad::core::errors::AhaError;
use ahad::core::registry::SvcInfo;
use ahad::core::urls::UrlInfo;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn test_aha() -> (TempDir, Arc<AhaCell>) {
    let dirn = tempfile::tempdir().unwrap();
    let aha = AhaCell::open(dirn.path(), CellConfig::default())
        .await
        .unwrap();
    (dirn, aha)
}

fn svc_info(link: &str) -> SvcInfo {
    SvcInfo {
        urlinfo: Some(UrlInfo::chop("tcp://127.0.0.1:8080/").unwrap()),
        online: Some(link.to_string()),
        ready: Some(true),
        leader: None,
        run: None,
    }
}

#[tokio::test]
async fn test_registry_add_get_del() {
    let (_dirn, aha) = test_aha().await;

    let mut wait = aha.waiter(1, "aha:svcadd");
    aha.add_aha_svc("test", svc_info("link00"), Some("example.net"), None)
        .await
        .unwrap();
    assert_eq!(wait.wait(Duration::from_secs(1)).await.len(), 1);

    let rec = aha.get_aha_svc("test.example.net").unwrap();
    assert_eq!(rec.name, "test");
    assert_eq!(rec.network, "example.net");
    assert_eq!(rec.fullname(), "test.example.net");
    assert_eq!(rec.svcinfo.online.as_deref(), Some("link00"));
    assert_eq!(rec.svcinfo.ready, Some(true));

    aha.del_aha_svc("test", Some("example.net")).await.unwrap();
    assert!(aha.get_aha_svc("test.example.net").is_none());
}

#[tokio::test]
async fn test_registry_fullname_split() {
    let (_dirn, aha) = test_aha().await;

    // Names carrying their own network split at the first dot.
    aha.add_aha_svc("0.cryo.mynet", svc_info("link00"), None, None)
        .await
        .unwrap();
    assert!(aha.get_aha_svc("0.cryo.mynet").is_some());

    // A bare name with no network anywhere is refused.
    let err = aha
        .add_aha_svc("newp", svc_info("link01"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AhaError::BadArg(_)));
}

#[tokio::test]
async fn test_registry_add_merges_info() {
    let (_dirn, aha) = test_aha().await;

    aha.add_aha_svc("test", svc_info("link00"), Some("example.net"), None)
        .await
        .unwrap();

    // Re-registration with only a new link keeps the address info.
    let update = SvcInfo {
        online: Some("link01".to_string()),
        ..Default::default()
    };
    aha.add_aha_svc("test", update, Some("example.net"), None)
        .await
        .unwrap();

    let rec = aha.get_aha_svc("test.example.net").unwrap();
    assert_eq!(rec.svcinfo.online.as_deref(), Some("link01"));
    assert!(rec.svcinfo.urlinfo.is_some());
    assert_eq!(rec.svcinfo.ready, Some(true));
}

#[tokio::test]
async fn test_svc_down_only_for_matching_link() {
    let (_dirn, aha) = test_aha().await;

    aha.add_aha_svc("test", svc_info("link00"), Some("example.net"), None)
        .await
        .unwrap();

    // A stale close for another link is a silent no-op.
    aha.set_aha_svc_down("test", "stale-link", Some("example.net"))
        .await
        .unwrap();
    let rec = aha.get_aha_svc("test.example.net").unwrap();
    assert_eq!(rec.svcinfo.online.as_deref(), Some("link00"));

    let mut wait = aha.waiter(1, "aha:svcdown");
    aha.set_aha_svc_down("test", "link00", Some("example.net"))
        .await
        .unwrap();
    assert_eq!(wait.wait(Duration::from_secs(1)).await.len(), 1);

    let rec = aha.get_aha_svc("test.example.net").unwrap();
    assert!(rec.svcinfo.online.is_none());
    // Readiness is orthogonal and survives offline transitions.
    assert_eq!(rec.svcinfo.ready, Some(true));

    // Downing an already-down record stays a no-op.
    aha.set_aha_svc_down("test", "link00", Some("example.net"))
        .await
        .unwrap();
    assert!(
        aha.get_aha_svc("test.example.net")
            .unwrap()
            .svcinfo
            .online
            .is_none()
    );
}

#[tokio::test]
async fn test_mod_svc_info_whitelist() {
    let (_dirn, aha) = test_aha().await;

    aha.add_aha_svc("test", svc_info("link00"), Some("example.net"), None)
        .await
        .unwrap();

    let err = aha
        .mod_aha_svc_info("test.example.net", json!({"newp": "newp"}))
        .await
        .unwrap_err();
    assert!(matches!(err, AhaError::BadArg(_)));

    aha.mod_aha_svc_info("test.example.net", json!({"ready": false}))
        .await
        .unwrap();
    let rec = aha.get_aha_svc("test.example.net").unwrap();
    assert_eq!(rec.svcinfo.ready, Some(false));
}

#[tokio::test]
async fn test_get_svcs_filters_by_network() {
    let (_dirn, aha) = test_aha().await;

    aha.add_aha_svc("0.cryo", svc_info("l0"), Some("foo"), None)
        .await
        .unwrap();
    aha.add_aha_svc("cryo", svc_info("l0"), Some("foo"), None)
        .await
        .unwrap();
    aha.add_aha_svc("axon", svc_info("l1"), Some("bar"), None)
        .await
        .unwrap();

    assert_eq!(aha.get_aha_svcs(None).len(), 3);
    let foo = aha.get_aha_svcs(Some("foo"));
    assert_eq!(foo.len(), 2);
    let names: Vec<String> = foo.iter().map(|rec| rec.fullname()).collect();
    assert!(names.contains(&"0.cryo.foo".to_string()));
    assert!(names.contains(&"cryo.foo".to_string()));
    assert!(aha.get_aha_svcs(Some("newp")).is_empty());
}

#[tokio::test]
async fn test_restart_preserves_ready_and_downs_online() {
    let dirn = tempfile::tempdir().unwrap();

    {
        let aha = AhaCell::open(dirn.path(), CellConfig::default())
            .await
            .unwrap();
        aha.add_aha_svc("0.cryo.mynet", svc_info("link00"), None, None)
            .await
            .unwrap();
    }

    // Reopen from the same directory: state replays from the log.
    let aha = AhaCell::open(dirn.path(), CellConfig::default())
        .await
        .unwrap();
    let rec = aha.get_aha_svc("0.cryo.mynet").unwrap();
    assert_eq!(rec.svcinfo.online.as_deref(), Some("link00"));

    let mut wait = aha.waiter(1, "aha:svcdown");
    aha.down_stale_svcs().await.unwrap();
    assert_eq!(wait.wait(Duration::from_secs(1)).await.len(), 1);

    let rec = aha.get_aha_svc("0.cryo.mynet").unwrap();
    assert!(rec.svcinfo.online.is_none());
    assert_eq!(rec.svcinfo.ready, Some(true));
}
