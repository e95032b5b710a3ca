// tests/integration/provision_test.rs

//! End-to-end provisioning over the one-time TLS surface: certificate
//! trio, config merge, `prov.done` idempotence, token exhaustion, and
//! user enrollment.

use super::fixtures::init_tracing;
use ahad::client::{self, DialOpts, bootstrap};
use ahad::config::CellConfig;
use ahad::core::AhaCell;
use ahad::core::certs::CertDir;
use ahad::core::errors::AhaError;
use ahad::server::{self, ServerHandle};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const NETW: &str = "loop.vertex.link";
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Reserves a loopback port by binding and dropping a listener.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// An AHA with TLS RPC and provisioning listeners on loopback, advertising
/// dialable 127.0.0.1 URLs under its network's CA.
async fn spawn_prov_aha() -> (TempDir, Arc<AhaCell>, ServerHandle) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let dmon_port = free_port().await;

    let aha_url =
        format!("ssl://127.0.0.1:{dmon_port}?ca={NETW}&hostname=aha.{NETW}");

    let mut conf = CellConfig::default();
    conf.aha_name = Some("aha".to_string());
    conf.aha_network = Some(NETW.to_string());
    conf.aha_admin = Some(format!("root@{NETW}"));
    conf.dmon_listen = Some(aha_url.clone());
    conf.provision_listen = Some("ssl://127.0.0.1:0".to_string());
    conf.aha_urls = vec![aha_url];

    let aha = AhaCell::open(dir.path(), conf).await.unwrap();
    let handle = server::launch_aha(aha.clone()).await.unwrap();
    (dir, aha, handle)
}

#[tokio::test]
async fn test_bootstrap_tls_dial() {
    let (ahadir, aha, handle) = spawn_prov_aha().await;

    // Bootstrap minted the CA, the host cert, and the admin user cert.
    for path in [
        "certs/cas/loop.vertex.link.crt",
        "certs/cas/loop.vertex.link.key",
        "certs/hosts/aha.loop.vertex.link.crt",
        "certs/hosts/aha.loop.vertex.link.key",
        "certs/users/root@loop.vertex.link.crt",
        "certs/users/root@loop.vertex.link.key",
    ] {
        assert!(ahadir.path().join(path).exists(), "missing {path}");
    }

    // Mutual TLS with the admin user certificate reaches the RPC surface.
    let port = handle.dmon_addr.unwrap().port();
    let opts = DialOpts {
        certdir: Some(CertDir::new(ahadir.path())),
        ..Default::default()
    };
    let url = format!("ssl://root@127.0.0.1:{port}?hostname=aha.{NETW}&ca={NETW}");
    let proxy = client::open_url_opts(&url, &opts).await.unwrap();

    let info = proxy
        .call("getCellInfo", json!({}), CALL_TIMEOUT)
        .await
        .unwrap();
    assert!(info.pointer("/cell/iden").and_then(|v| v.as_str()).is_some());
    assert_eq!(
        info.pointer("/cell/iden").and_then(|v| v.as_str()).unwrap(),
        aha.cell.iden
    );

    proxy.fini().await;
    handle.shutdown();
}

#[tokio::test]
async fn test_provision_service_end_to_end() {
    let (_ahadir, aha, handle) = spawn_prov_aha().await;

    let onetime = aha.add_aha_svc_prov("00.axon", None).await.unwrap();
    assert!(onetime.starts_with("ssl://127.0.0.1:"));

    let memberdir = tempfile::tempdir().unwrap();
    std::fs::write(
        memberdir.path().join("cell.toml"),
        format!("\"aha:provision\" = \"{onetime}\"\n"),
    )
    .unwrap();

    let (cell, member_handle) = server::boot_cell(memberdir.path()).await.unwrap();

    // The certificate trio and the redemption sentinel landed on disk.
    for path in [
        "prov.done",
        "certs/cas/loop.vertex.link.crt",
        "certs/hosts/00.axon.loop.vertex.link.crt",
        "certs/hosts/00.axon.loop.vertex.link.key",
        "certs/users/root@loop.vertex.link.crt",
        "certs/users/root@loop.vertex.link.key",
    ] {
        assert!(memberdir.path().join(path).exists(), "missing {path}");
    }

    // The merged config carries the provisioning values.
    assert_eq!(cell.cell.conf.aha_name.as_deref(), Some("00.axon"));
    assert_eq!(cell.cell.conf.aha_network.as_deref(), Some(NETW));
    assert_eq!(cell.cell.conf.aha_leader.as_deref(), Some("axon"));
    assert_eq!(cell.cell.conf.aha_registry.len(), 1);

    // The member registered over mutual TLS; the alias carries leader.
    let rec =
        super::fixtures::wait_svc_online(&aha, "00.axon.loop.vertex.link", Duration::from_secs(2))
            .await;
    assert_eq!(rec.svcinfo.ready, Some(true));
    let alias =
        super::fixtures::wait_svc_online(&aha, "axon.loop.vertex.link", Duration::from_secs(2))
            .await;
    assert_eq!(alias.svcinfo.leader, Some(true));

    // The one-time URL is exhausted: a second redemption fails.
    let opts = DialOpts {
        insecure: true,
        ..Default::default()
    };
    let iden = onetime.rsplit('/').next().unwrap();
    let proxy = client::open_url_opts(&onetime, &opts).await.unwrap();
    let err = proxy
        .call("provResolve", json!({"iden": iden}), CALL_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, AhaError::NoSuchName(_)));
    proxy.fini().await;

    // Restarting from the same directory skips provisioning entirely.
    member_handle.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let conf = CellConfig::from_dir(memberdir.path()).unwrap();
    assert!(!bootstrap::needs_provisioning(memberdir.path(), &conf).unwrap());

    let (cell2, member_handle) = server::boot_cell(memberdir.path()).await.unwrap();
    assert_eq!(cell2.cell.iden, cell.cell.iden);
    super::fixtures::wait_svc_online(&aha, "00.axon.loop.vertex.link", Duration::from_secs(2))
        .await;

    member_handle.shutdown();
    handle.shutdown();
}

#[tokio::test]
async fn test_prov_session_pins_csr_cn() {
    let (_ahadir, aha, handle) = spawn_prov_aha().await;

    let onetime = aha.add_aha_svc_prov("newp", None).await.unwrap();
    let iden = onetime.rsplit('/').next().unwrap().to_string();

    let opts = DialOpts {
        insecure: true,
        ..Default::default()
    };
    let proxy = client::open_url_opts(&onetime, &opts).await.unwrap();
    proxy
        .call("provResolve", json!({"iden": iden}), CALL_TIMEOUT)
        .await
        .unwrap();

    // A CSR for any CN other than the token's is refused.
    let scratch = tempfile::tempdir().unwrap();
    let certdir = CertDir::new(scratch.path());
    let csr = certdir
        .gen_csr(ahad::core::certs::CertKind::Host, "lalala.loop.vertex.link")
        .unwrap();
    let err = proxy
        .call("signHostCsr", json!({"csr": csr}), CALL_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, AhaError::BadArg(_)));

    // Admin-only surface is absent on a one-time session.
    let err = proxy
        .call("getAhaSvcs", json!({}), CALL_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, AhaError::NoSuchName(_)));

    proxy.fini().await;
    handle.shutdown();
}

#[tokio::test]
async fn test_user_enrollment() {
    let (_ahadir, aha, handle) = spawn_prov_aha().await;

    // A member to dial once enrolled.
    let onetime = aha.add_aha_svc_prov("00.axon", None).await.unwrap();
    let memberdir = tempfile::tempdir().unwrap();
    std::fs::write(
        memberdir.path().join("cell.toml"),
        format!("\"aha:provision\" = \"{onetime}\"\n"),
    )
    .unwrap();
    let (cell, member_handle) = server::boot_cell(memberdir.path()).await.unwrap();
    super::fixtures::wait_svc_online(&aha, "00.axon.loop.vertex.link", Duration::from_secs(2))
        .await;

    let enroll_url = aha.add_aha_user_enroll("visi").await.unwrap();
    let syndir = tempfile::tempdir().unwrap();
    bootstrap::enroll_user(syndir.path(), &enroll_url).await.unwrap();

    for path in [
        "telepath.toml",
        "certs/cas/loop.vertex.link.crt",
        "certs/users/visi@loop.vertex.link.crt",
        "certs/users/visi@loop.vertex.link.key",
    ] {
        assert!(syndir.path().join(path).exists(), "missing {path}");
    }
    let teleconf = std::fs::read_to_string(syndir.path().join("telepath.toml")).unwrap();
    assert!(teleconf.contains("version = 1"));
    assert!(teleconf.contains("ssl://visi@127.0.0.1:"));

    // The member must know the user before cert dials succeed.
    cell.add_user("visi");

    let opts = DialOpts {
        certdir: Some(CertDir::new(syndir.path())),
        ..Default::default()
    };
    client::load_tele_conf(syndir.path(), opts.clone()).unwrap();

    let proxy = client::open_url_opts("aha://visi@axon...", &opts).await.unwrap();
    let iden = proxy
        .call("getCellIden", json!({}), CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(iden.as_str().unwrap(), cell.cell.iden);
    proxy.fini().await;

    // Locked users are denied even with a valid certificate.
    cell.set_user_locked("visi", true);
    let proxy = client::open_url_opts("aha://visi@axon...", &opts).await.unwrap();
    let err = proxy
        .call("getCellIden", json!({}), CALL_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, AhaError::AuthDeny(_)));
    assert!(err.to_string().contains("locked"));
    proxy.fini().await;

    member_handle.shutdown();
    handle.shutdown();
}
