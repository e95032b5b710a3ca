// src/core/certs.rs

//! Certificate handling: the per-cell `certs/` directory and the network
//! certificate authority.
//!
//! Layout under a cell directory:
//!   certs/cas/<network>.{crt,key}
//!   certs/hosts/<name>.<network>.{crt,key}
//!   certs/users/<user>@<network>.{crt,key}

use crate::core::errors::AhaError;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Which branch of the cert tree a name lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertKind {
    Host,
    User,
}

impl CertKind {
    fn dirname(self) -> &'static str {
        match self {
            CertKind::Host => "hosts",
            CertKind::User => "users",
        }
    }
}

/// A generated or stored PEM pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PemPair {
    pub cert: String,
    pub key: String,
}

/// The on-disk certificate directory of one cell.
#[derive(Debug, Clone)]
pub struct CertDir {
    dirn: PathBuf,
}

impl CertDir {
    pub fn new(dirn: &Path) -> Self {
        Self {
            dirn: dirn.join("certs"),
        }
    }

    pub fn ca_cert_path(&self, network: &str) -> PathBuf {
        self.dirn.join("cas").join(format!("{network}.crt"))
    }

    pub fn ca_key_path(&self, network: &str) -> PathBuf {
        self.dirn.join("cas").join(format!("{network}.key"))
    }

    pub fn cert_path(&self, kind: CertKind, cn: &str) -> PathBuf {
        self.dirn.join(kind.dirname()).join(format!("{cn}.crt"))
    }

    pub fn key_path(&self, kind: CertKind, cn: &str) -> PathBuf {
        self.dirn.join(kind.dirname()).join(format!("{cn}.key"))
    }

    fn write(&self, path: &Path, text: &str) -> Result<(), AhaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn save_ca_pair(&self, network: &str, pair: &PemPair) -> Result<(), AhaError> {
        self.write(&self.ca_cert_path(network), &pair.cert)?;
        self.write(&self.ca_key_path(network), &pair.key)?;
        Ok(())
    }

    pub fn save_ca_cert(&self, network: &str, cert: &str) -> Result<(), AhaError> {
        self.write(&self.ca_cert_path(network), cert)
    }

    pub fn load_ca_cert(&self, network: &str) -> Option<String> {
        std::fs::read_to_string(self.ca_cert_path(network)).ok()
    }

    pub fn save_cert(&self, kind: CertKind, cn: &str, cert: &str) -> Result<(), AhaError> {
        self.write(&self.cert_path(kind, cn), cert)
    }

    pub fn load_cert(&self, kind: CertKind, cn: &str) -> Option<String> {
        std::fs::read_to_string(self.cert_path(kind, cn)).ok()
    }

    pub fn load_key(&self, kind: CertKind, cn: &str) -> Option<String> {
        std::fs::read_to_string(self.key_path(kind, cn)).ok()
    }

    /// Generates a fresh key pair for `cn`, stores the key, and returns a
    /// CSR for the AHA (or its provisioning surface) to sign.
    pub fn gen_csr(&self, kind: CertKind, cn: &str) -> Result<String, AhaError> {
        let key = KeyPair::generate()?;
        let params = leaf_params(cn)?;
        let csr = params.serialize_request(&key)?;

        self.write(&self.key_path(kind, cn), &key.serialize_pem())?;
        Ok(csr.pem()?)
    }
}

fn leaf_params(cn: &str) -> Result<CertificateParams, AhaError> {
    // Hosts get their CN as a SAN so rustls hostname checks succeed;
    // user CNs are not valid DNS names and carry no SAN.
    let sans = if cn.contains('@') {
        Vec::new()
    } else {
        vec![cn.to_string()]
    };
    let mut params = CertificateParams::new(sans)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    Ok(params)
}

fn fresh_serial() -> Result<[u8; 16], AhaError> {
    let mut buf = [0u8; 16];
    getrandom::fill(&mut buf).map_err(|e| AhaError::Internal(e.to_string()))?;
    // Clear the sign bit so DER encoders keep the serial positive.
    buf[0] &= 0x7f;
    Ok(buf)
}

/// Generates a self-signed CA pair for a network.
pub fn gen_ca_pair(network: &str) -> Result<PemPair, AhaError> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::new(Vec::new())?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, network);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(SerialNumber::from(fresh_serial()?.to_vec()));

    let cert = params.self_signed(&key)?;
    Ok(PemPair {
        cert: cert.pem(),
        key: key.serialize_pem(),
    })
}

/// Rebuilds the issuing certificate from stored PEMs so leaf certs can be
/// signed across restarts.
fn rebuild_issuer(ca: &PemPair) -> Result<(Certificate, KeyPair), AhaError> {
    let key = KeyPair::from_pem(&ca.key)
        .map_err(|e| AhaError::Internal(format!("CA key unreadable: {e}")))?;
    let params = CertificateParams::from_ca_cert_pem(&ca.cert)
        .map_err(|e| AhaError::Internal(format!("CA cert unreadable: {e}")))?;
    let cert = params.self_signed(&key)?;
    Ok((cert, key))
}

/// Extracts the CN from a PEM CSR. Malformed PEMs are `bad-arg`.
pub fn csr_cn(pem: &str) -> Result<String, AhaError> {
    let csr = CertificateSigningRequestParams::from_pem(pem)
        .map_err(|e| AhaError::BadArg(format!("malformed CSR: {e}")))?;
    dn_common_name(&csr.params.distinguished_name)
        .ok_or_else(|| AhaError::BadArg("CSR has no common name".to_string()))
}

fn dn_common_name(dn: &DistinguishedName) -> Option<String> {
    match dn.get(&DnType::CommonName)? {
        DnValue::Utf8String(s) => Some(s.clone()),
        DnValue::PrintableString(s) => Some(s.as_str().to_string()),
        DnValue::Ia5String(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

/// The outcome of signing a CSR: the leaf PEM plus the serial recorded in
/// the nexus.
#[derive(Debug, Clone)]
pub struct SignedCert {
    pub cert: String,
    pub serial: String,
}

/// Signs a CSR with the network CA. Every call produces a fresh serial, so
/// re-signing the same CSR yields distinct but equally valid certs.
pub fn sign_csr(ca: &PemPair, pem: &str) -> Result<SignedCert, AhaError> {
    let mut csr = CertificateSigningRequestParams::from_pem(pem)
        .map_err(|e| AhaError::BadArg(format!("malformed CSR: {e}")))?;

    let serial = fresh_serial()?;
    let serial_hex = hex::encode(serial);
    csr.params.serial_number = Some(SerialNumber::from(serial.to_vec()));

    let (issuer, issuer_key) = rebuild_issuer(ca)?;
    let cert = csr.signed_by(&issuer, &issuer_key)?;

    Ok(SignedCert {
        cert: cert.pem(),
        serial: serial_hex,
    })
}

/// Validates a host CN of the form `<name>.<network>` against the AHA's
/// own network. Hostnames are lowercased before comparison.
pub fn check_host_cn(cn: &str, network: &str) -> Result<String, AhaError> {
    let cn = cn.to_lowercase();
    let suffix = format!(".{}", network.to_lowercase());
    match cn.strip_suffix(&suffix) {
        Some(name) if !name.is_empty() && !name.contains('@') => Ok(cn),
        _ => Err(AhaError::BadArg(format!(
            "host CSR CN '{cn}' is not within network '{network}'"
        ))),
    }
}

/// Validates a user CN of the form `<user>@<network>`.
pub fn check_user_cn(cn: &str, network: &str) -> Result<String, AhaError> {
    match cn.split_once('@') {
        Some((user, netw)) if !user.is_empty() && netw.eq_ignore_ascii_case(network) => {
            Ok(format!("{user}@{}", netw.to_lowercase()))
        }
        _ => Err(AhaError::BadArg(format!(
            "user CSR CN '{cn}' is not within network '{network}'"
        ))),
    }
}

// --- PEM → rustls conversions shared by the server and client TLS setup ---

pub fn pem_to_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, AhaError> {
    let mut reader = Cursor::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AhaError::BadArg(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(AhaError::BadArg("no certificates in PEM".to_string()));
    }
    Ok(certs)
}

pub fn pem_to_key(pem: &str) -> Result<PrivateKeyDer<'static>, AhaError> {
    let mut reader = Cursor::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| AhaError::BadArg(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| AhaError::BadArg("no private key in PEM".to_string()))
}

/// Pulls the CN out of a peer's leaf certificate after a TLS handshake.
pub fn peer_cert_cn(der: &CertificateDer<'_>) -> Result<String, AhaError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| AhaError::AuthDeny(format!("unparseable peer certificate: {e}")))?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| AhaError::AuthDeny("peer certificate has no CN".to_string()))
}

/// Reads the serial from a PEM certificate, for issuance assertions.
pub fn cert_serial(pem: &str) -> Result<String, AhaError> {
    let ders = pem_to_certs(pem)?;
    let (_, cert) = x509_parser::parse_x509_certificate(ders[0].as_ref())
        .map_err(|e| AhaError::BadArg(format!("unparseable certificate: {e}")))?;
    Ok(cert.raw_serial_as_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_and_leaf_flow() {
        let ca = gen_ca_pair("loop.vertex.link").unwrap();
        assert!(ca.cert.contains("BEGIN CERTIFICATE"));

        let dir = tempfile::tempdir().unwrap();
        let certdir = CertDir::new(dir.path());
        let csr = certdir
            .gen_csr(CertKind::Host, "00.axon.loop.vertex.link")
            .unwrap();

        assert_eq!(csr_cn(&csr).unwrap(), "00.axon.loop.vertex.link");

        let signed0 = sign_csr(&ca, &csr).unwrap();
        let signed1 = sign_csr(&ca, &csr).unwrap();
        assert_ne!(signed0.cert, signed1.cert);
        assert_ne!(
            cert_serial(&signed0.cert).unwrap(),
            cert_serial(&signed1.cert).unwrap()
        );
    }

    #[test]
    fn cn_checks() {
        assert!(check_host_cn("00.axon.mynet", "mynet").is_ok());
        assert!(check_host_cn("lalala", "mynet").is_err());
        assert!(check_host_cn("visi@mynet", "mynet").is_err());

        assert!(check_user_cn("visi@mynet", "mynet").is_ok());
        assert!(check_user_cn("visi@other", "mynet").is_err());
        assert!(check_user_cn("lalala", "mynet").is_err());
    }

    #[test]
    fn malformed_csr_is_bad_arg() {
        let err = csr_cn("not a pem").unwrap_err();
        assert!(matches!(err, crate::core::errors::AhaError::BadArg(_)));
    }
}
