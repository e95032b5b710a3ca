// src/client/bootstrap.rs

//! Member-side provisioning: redeem a one-time URL into a certificate trio
//! and a merged startup configuration, exactly once per token.

use super::{DialOpts, open_url_opts};
use crate::config::CellConfig;
use crate::core::certs::{CertDir, CertKind};
use crate::core::errors::AhaError;
use crate::core::urls::UrlInfo;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const PROV_TIMEOUT: Duration = Duration::from_secs(30);

fn prov_iden(url: &str) -> Result<String, AhaError> {
    let info = UrlInfo::chop(url)?;
    let iden = info
        .path
        .as_deref()
        .map(|p| p.trim_matches('/').to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AhaError::BadArg("provisioning url has no token".to_string()))?;
    Ok(iden)
}

/// Returns true when a cell directory still needs provisioning: it has an
/// `aha:provision` URL whose token differs from the recorded `prov.done`.
pub fn needs_provisioning(dirn: &Path, conf: &CellConfig) -> Result<bool, AhaError> {
    let Some(url) = conf.aha_provision.as_deref() else {
        return Ok(false);
    };
    let iden = prov_iden(url)?;
    match std::fs::read_to_string(dirn.join("prov.done")) {
        Ok(done) => Ok(done.trim() != iden),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// Redeems the one-time URL: writes the certificate trio, merges the
/// provisioning conf into `cell.toml`, and records `prov.done`.
/// Returns the re-loaded configuration.
pub async fn provision_cell(dirn: &Path, conf: &CellConfig) -> Result<CellConfig, AhaError> {
    let url = conf
        .aha_provision
        .clone()
        .ok_or(AhaError::NeedConfValu("aha:provision".to_string()))?;
    let iden = prov_iden(&url)?;

    // The member holds no CA yet; the unguessable token is the
    // authenticator for this one session.
    let opts = DialOpts {
        insecure: true,
        timeout: Some(PROV_TIMEOUT),
        ..Default::default()
    };
    let proxy = open_url_opts(&url, &opts).await?;

    proxy
        .call("provResolve", json!({"iden": iden}), PROV_TIMEOUT)
        .await?;

    let provinfo = proxy.call("getProvInfo", json!({}), PROV_TIMEOUT).await?;
    let provconf = provinfo
        .get("conf")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let name = provconf
        .get("aha:name")
        .and_then(Value::as_str)
        .ok_or_else(|| AhaError::BadArg("provisioning conf has no aha:name".to_string()))?;
    let network = provconf
        .get("aha:network")
        .and_then(Value::as_str)
        .ok_or_else(|| AhaError::BadArg("provisioning conf has no aha:network".to_string()))?;
    let user = provconf
        .get("aha:user")
        .and_then(Value::as_str)
        .unwrap_or("root");

    info!("provisioning {name}.{network} from AHA service");

    let certdir = CertDir::new(dirn);

    let ca = proxy
        .call("getCaCert", json!({}), PROV_TIMEOUT)
        .await?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| AhaError::NotReady("AHA has no CA for its network".to_string()))?;
    certdir.save_ca_cert(network, &ca)?;

    let hostcn = format!("{name}.{network}");
    let csr = certdir.gen_csr(CertKind::Host, &hostcn)?;
    let cert = proxy
        .call("signHostCsr", json!({"csr": csr}), PROV_TIMEOUT)
        .await?;
    certdir.save_cert(
        CertKind::Host,
        &hostcn,
        cert.as_str()
            .ok_or_else(|| AhaError::Internal("host cert reply was not a string".to_string()))?,
    )?;

    let usercn = format!("{user}@{network}");
    let csr = certdir.gen_csr(CertKind::User, &usercn)?;
    let cert = proxy
        .call("signUserCsr", json!({"csr": csr}), PROV_TIMEOUT)
        .await?;
    certdir.save_cert(
        CertKind::User,
        &usercn,
        cert.as_str()
            .ok_or_else(|| AhaError::Internal("user cert reply was not a string".to_string()))?,
    )?;

    let merged = CellConfig::apply_provisioning(dirn, &provconf)?;
    std::fs::write(dirn.join("prov.done"), &iden)?;

    // Closing the session is what consumes the token on the AHA.
    proxy.fini().await;
    Ok(merged)
}

/// Redeems a user-enrollment URL into a client certificate directory plus
/// a `telepath.toml` naming the AHA servers.
pub async fn enroll_user(dirn: &Path, url: &str) -> Result<(), AhaError> {
    let iden = prov_iden(url)?;

    let opts = DialOpts {
        insecure: true,
        timeout: Some(PROV_TIMEOUT),
        ..Default::default()
    };
    let proxy = open_url_opts(url, &opts).await?;
    proxy
        .call("provResolve", json!({"iden": iden}), PROV_TIMEOUT)
        .await?;

    let provinfo = proxy.call("getProvInfo", json!({}), PROV_TIMEOUT).await?;
    let conf = provinfo.get("conf").cloned().unwrap_or_else(|| json!({}));

    let network = conf
        .get("aha:network")
        .and_then(Value::as_str)
        .ok_or_else(|| AhaError::BadArg("enrollment conf has no aha:network".to_string()))?;
    let user = conf
        .get("aha:user")
        .and_then(Value::as_str)
        .ok_or_else(|| AhaError::BadArg("enrollment conf has no aha:user".to_string()))?;

    let certdir = CertDir::new(dirn);

    let ca = proxy
        .call("getCaCert", json!({}), PROV_TIMEOUT)
        .await?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| AhaError::NotReady("AHA has no CA for its network".to_string()))?;
    certdir.save_ca_cert(network, &ca)?;

    let usercn = format!("{user}@{network}");
    let csr = certdir.gen_csr(CertKind::User, &usercn)?;
    let cert = proxy
        .call("signUserCsr", json!({"csr": csr}), PROV_TIMEOUT)
        .await?;
    certdir.save_cert(
        CertKind::User,
        &usercn,
        cert.as_str()
            .ok_or_else(|| AhaError::Internal("user cert reply was not a string".to_string()))?,
    )?;

    let mut table = toml::Table::new();
    table.insert("version".to_string(), toml::Value::Integer(1));
    let servers = conf
        .get("aha:servers")
        .and_then(Value::as_array)
        .map(|urls| {
            urls.iter()
                .filter_map(Value::as_str)
                .map(|s| toml::Value::String(s.to_string()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    table.insert("aha:servers".to_string(), toml::Value::Array(servers));
    std::fs::create_dir_all(dirn)?;
    std::fs::write(
        dirn.join("telepath.toml"),
        toml::to_string(&table)
            .map_err(|e| AhaError::Internal(format!("could not render telepath.toml: {e}")))?,
    )?;

    proxy.fini().await;
    info!("enrolled {usercn}; certificates and telepath.toml written");
    Ok(())
}
