use ahad::config::CellConfig;
use ahad::core::AhaCell;
use ahad::core::errors::AhaError;
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;

async fn prov_aha() -> (TempDir, Arc<AhaCell>) {
    let dirn = tempfile::tempdir().unwrap();
    let mut conf = CellConfig::default();
    conf.aha_name = Some("aha".to_string());
    conf.aha_network = Some("loop.vertex.link".to_string());
    conf.provision_listen = Some("ssl://aha.loop.vertex.link:27272".to_string());
    conf.aha_urls = vec!["ssl://aha.loop.vertex.link:27492".to_string()];
    let aha = AhaCell::open(dirn.path(), conf).await.unwrap();
    (dirn, aha)
}

#[tokio::test]
async fn test_prov_requires_conf_keys() {
    let dirn = tempfile::tempdir().unwrap();
    let mut conf = CellConfig::default();
    conf.aha_name = Some("aha".to_string());
    conf.aha_network = Some("loop.vertex.link".to_string());
    // No provision:listen configured.
    let aha = AhaCell::open(dirn.path(), conf).await.unwrap();

    let err = aha.add_aha_svc_prov("00.axon", None).await.unwrap_err();
    assert!(matches!(err, AhaError::NeedConfValu(_)));
}

#[tokio::test]
async fn test_prov_network_mismatch() {
    let (_dirn, aha) = prov_aha().await;

    let provinfo = json!({"conf": {"aha:network": "stuff.goes.beep"}});
    let err = aha
        .add_aha_svc_prov("bazfaz", Some(provinfo))
        .await
        .unwrap_err();
    assert!(matches!(err, AhaError::BadConfValu(_)));
    assert!(err.to_string().contains("must be equal to the Aha servers network"));
}

#[tokio::test]
async fn test_prov_token_conf_bundle() {
    let (_dirn, aha) = prov_aha().await;

    let provinfo = json!({"dmon:port": 1234, "https:port": 443});
    let url = aha
        .add_aha_svc_prov("00.axon", Some(provinfo))
        .await
        .unwrap();
    assert!(url.starts_with("ssl://aha.loop.vertex.link:27272/"));

    let iden = url.rsplit('/').next().unwrap();
    let token = aha.get_prov_token(iden).unwrap();
    assert_eq!(token.name, "00.axon");
    assert_eq!(token.network, "loop.vertex.link");

    let conf = token.provinfo.get("conf").unwrap();
    assert_eq!(conf["aha:name"], "00.axon");
    assert_eq!(conf["aha:network"], "loop.vertex.link");
    // Numbered names imply their logical leader.
    assert_eq!(conf["aha:leader"], "axon");
    assert_eq!(
        conf["dmon:listen"],
        "ssl://0.0.0.0:1234?hostname=00.axon.loop.vertex.link&ca=loop.vertex.link"
    );
    assert_eq!(conf["https:port"], 443);

    let registry: Vec<String> =
        serde_json::from_value(conf.get("aha:registry").cloned().unwrap()).unwrap();
    assert_eq!(registry, vec!["ssl://root@aha.loop.vertex.link:27492"]);
}

#[tokio::test]
async fn test_prov_mirror_conf() {
    let (_dirn, aha) = prov_aha().await;

    let url = aha
        .add_aha_svc_prov("01.axon", Some(json!({"mirror": "axon"})))
        .await
        .unwrap();
    let iden = url.rsplit('/').next().unwrap();
    let token = aha.get_prov_token(iden).unwrap();

    let conf = token.provinfo.get("conf").unwrap();
    assert_eq!(conf["mirror"], "aha://root@axon.loop.vertex.link");
    assert_eq!(conf["aha:leader"], "axon");
}

#[tokio::test]
async fn test_prov_token_single_use() {
    let (_dirn, aha) = prov_aha().await;

    let url = aha.add_aha_svc_prov("foobar", None).await.unwrap();
    let iden = url.rsplit('/').next().unwrap().to_string();

    assert!(aha.get_prov_token(&iden).is_ok());
    aha.consume_prov_token(&iden).await.unwrap();

    let err = aha.get_prov_token(&iden).unwrap_err();
    assert!(matches!(err, AhaError::NoSuchName(_)));

    // Consuming twice stays quiet; the token is simply gone.
    aha.consume_prov_token(&iden).await.unwrap();
}

#[tokio::test]
async fn test_prov_explicit_delete() {
    let (_dirn, aha) = prov_aha().await;

    let url = aha.add_aha_svc_prov("bork", None).await.unwrap();
    let iden = url.rsplit('/').next().unwrap().to_string();
    aha.del_aha_svc_prov(&iden).await.unwrap();
    assert!(aha.get_prov_token(&iden).is_err());

    let url = aha.add_aha_user_enroll("bork00").await.unwrap();
    let iden = url.rsplit('/').next().unwrap().to_string();
    let token = aha.get_prov_token(&iden).unwrap();
    let conf = token.provinfo.get("conf").unwrap();
    assert_eq!(conf["aha:user"], "bork00");
    let servers: Vec<String> =
        serde_json::from_value(conf.get("aha:servers").cloned().unwrap()).unwrap();
    assert_eq!(servers, vec!["ssl://bork00@aha.loop.vertex.link:27492"]);

    aha.del_aha_user_enroll(&iden).await.unwrap();
    assert!(aha.get_prov_token(&iden).is_err());
}

#[tokio::test]
async fn test_ca_cert_idempotent_across_restart() {
    let dirn = tempfile::tempdir().unwrap();
    let mut conf = CellConfig::default();
    conf.aha_name = Some("aha".to_string());
    conf.aha_network = Some("do.vertex.link".to_string());
    conf.aha_admin = Some("root@do.vertex.link".to_string());

    let cacert = {
        let aha = AhaCell::open(dirn.path(), conf.clone()).await.unwrap();

        // Bootstrap wrote the CA, host, and admin user certificates.
        for path in [
            "certs/cas/do.vertex.link.crt",
            "certs/cas/do.vertex.link.key",
            "certs/hosts/aha.do.vertex.link.crt",
            "certs/hosts/aha.do.vertex.link.key",
            "certs/users/root@do.vertex.link.crt",
            "certs/users/root@do.vertex.link.key",
        ] {
            assert!(dirn.path().join(path).exists(), "missing {path}");
        }

        assert!(aha.get_ca_cert("newp.net").is_none());
        let cacert = aha.gen_ca_cert("do.vertex.link").await.unwrap();
        assert_eq!(aha.gen_ca_cert("do.vertex.link").await.unwrap(), cacert);
        cacert
    };

    // The same bytes come back after a restart from the same directory.
    let aha = AhaCell::open(dirn.path(), conf).await.unwrap();
    assert_eq!(aha.gen_ca_cert("do.vertex.link").await.unwrap(), cacert);

    // Signing the same CSR twice yields distinct serials under one CA.
    let certdir = ahad::core::certs::CertDir::new(dirn.path());
    let csr = certdir
        .gen_csr(ahad::core::certs::CertKind::Host, "cryo.do.vertex.link")
        .unwrap();
    let cert0 = aha.sign_host_csr(&csr).await.unwrap();
    let cert1 = aha.sign_host_csr(&csr).await.unwrap();
    assert_ne!(cert0, cert1);
    assert_ne!(
        ahad::core::certs::cert_serial(&cert0).unwrap(),
        ahad::core::certs::cert_serial(&cert1).unwrap()
    );

    // Wrong-network CSRs are refused outright.
    let csr = certdir
        .gen_csr(ahad::core::certs::CertKind::Host, "lalala")
        .unwrap();
    let err = aha.sign_host_csr(&csr).await.unwrap_err();
    assert!(matches!(err, AhaError::BadArg(_)));

    let csr = certdir
        .gen_csr(ahad::core::certs::CertKind::User, "visi@other.net")
        .unwrap();
    let err = aha.sign_user_csr(&csr).await.unwrap_err();
    assert!(matches!(err, AhaError::BadArg(_)));
}

#[tokio::test]
async fn test_get_aha_urls_from_conf() {
    let (_dirn, aha) = prov_aha().await;
    assert_eq!(
        aha.get_aha_urls(),
        vec!["ssl://aha.loop.vertex.link:27492".to_string()]
    );
}

#[tokio::test]
async fn test_enroll_token_value_shape() {
    let (_dirn, aha) = prov_aha().await;
    let url = aha.add_aha_user_enroll("visi").await.unwrap();
    let iden = url.rsplit('/').next().unwrap();
    let token = aha.get_prov_token(iden).unwrap();
    let conf = token.provinfo.get("conf").unwrap();
    assert_eq!(conf["version"], Value::from(1));
    assert_eq!(conf["aha:network"], "loop.vertex.link");
}
