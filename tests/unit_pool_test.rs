use ahad::config::CellConfig;
use ahad::core::AhaCell;
use ahad::core::errors::AhaError;
use ahad::core::pool::pool_topic;
use ahad::core::registry::SvcInfo;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn test_aha() -> (TempDir, Arc<AhaCell>) {
    let dirn = tempfile::tempdir().unwrap();
    let mut conf = CellConfig::default();
    conf.aha_network = Some("loop.vertex.link".to_string());
    let aha = AhaCell::open(dirn.path(), conf).await.unwrap();
    (dirn, aha)
}

async fn add_svc(aha: &Arc<AhaCell>, name: &str) {
    let info = SvcInfo {
        online: Some(format!("link-{name}")),
        ready: Some(true),
        ..Default::default()
    };
    aha.add_aha_svc(name, info, None, None).await.unwrap();
}

#[tokio::test]
async fn test_pool_lifecycle() {
    let (_dirn, aha) = test_aha().await;

    add_svc(&aha, "00").await;
    add_svc(&aha, "01").await;

    let pool = aha.add_aha_pool("pool00...", "root").await.unwrap();
    assert_eq!(pool.fullname(), "pool00.loop.vertex.link");
    assert!(pool.created > 0);
    assert_eq!(pool.creator, "root");
    assert!(pool.services.is_empty());

    aha.add_aha_pool_svc("pool00...", "00...", "root")
        .await
        .unwrap();
    aha.add_aha_pool_svc("pool00...", "01...", "root")
        .await
        .unwrap();

    let pool = aha.get_aha_pool("pool00.loop.vertex.link").unwrap();
    assert_eq!(pool.services.len(), 2);
    assert!(pool.services.contains_key("00.loop.vertex.link"));
    let member = &pool.services["01.loop.vertex.link"];
    assert_eq!(member.creator, "root");
    assert!(member.created > 0);

    aha.del_aha_pool_svc("pool00...", "00...").await.unwrap();
    let pool = aha.get_aha_pool("pool00...").unwrap();
    assert_eq!(pool.services.len(), 1);

    aha.del_aha_pool("pool00...").await.unwrap();
    assert!(aha.get_aha_pool("pool00...").is_none());
    assert!(aha.get_aha_pools().is_empty());
}

#[tokio::test]
async fn test_pool_membership_events() {
    let (_dirn, aha) = test_aha().await;
    add_svc(&aha, "00").await;

    aha.add_aha_pool("pool00...", "root").await.unwrap();
    let topic = pool_topic("pool00.loop.vertex.link");

    let mut wait = aha.waiter(1, &topic);
    aha.add_aha_pool_svc("pool00...", "00...", "root")
        .await
        .unwrap();
    let events = wait.wait(Duration::from_secs(1)).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].get("event").and_then(Value::as_str), Some("svc:add"));
    assert_eq!(
        events[0].get("svcname").and_then(Value::as_str),
        Some("00.loop.vertex.link")
    );

    let mut wait = aha.waiter(1, &topic);
    aha.del_aha_pool_svc("pool00...", "00...").await.unwrap();
    let events = wait.wait(Duration::from_secs(1)).await;
    assert_eq!(events[0].get("event").and_then(Value::as_str), Some("svc:del"));
}

#[tokio::test]
async fn test_pool_requires_known_service() {
    let (_dirn, aha) = test_aha().await;

    aha.add_aha_pool("pool00...", "root").await.unwrap();
    let err = aha
        .add_aha_pool_svc("pool00...", "newp...", "root")
        .await
        .unwrap_err();
    assert!(matches!(err, AhaError::NoSuchName(_)));

    let err = aha
        .add_aha_pool_svc("newpool...", "newp...", "root")
        .await
        .unwrap_err();
    assert!(matches!(err, AhaError::NoSuchName(_)));
}
