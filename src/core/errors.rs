// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use strum_macros::IntoStaticStr;
use thiserror::Error;

/// The main error enum, representing all failures the fabric can surface.
/// Variants map one-to-one onto the wire fault codes and HTTP error codes,
/// so a callee's error always reaches the caller unchanged.
#[derive(Error, Debug, IntoStaticStr)]
pub enum AhaError {
    /// A lookup failed: registry miss, expired or consumed token, or an
    /// unknown name in the resolver.
    #[error("NoSuchName: {0}")]
    #[strum(serialize = "NoSuchName")]
    NoSuchName(String),

    /// Called before prerequisite state exists (e.g. no AHA servers known).
    #[error("NotReady: {0}")]
    #[strum(serialize = "NotReady")]
    NotReady(String),

    /// A required configuration key is absent.
    #[error("NeedConfValu: missing configuration '{0}'")]
    #[strum(serialize = "NeedConfValu")]
    NeedConfValu(String),

    /// Configuration is present but semantically wrong.
    #[error("BadConfValu: {0}")]
    #[strum(serialize = "BadConfValu")]
    BadConfValu(String),

    /// A request payload failed validation.
    #[error("BadArg: {0}")]
    #[strum(serialize = "BadArg")]
    BadArg(String),

    /// The caller lacks permission, is locked, or failed TLS validation.
    #[error("AuthDeny: {0}")]
    #[strum(serialize = "AuthDeny")]
    AuthDeny(String),

    /// A local deadline expired. The remote effect is ambiguous.
    #[error("Timeout: {0}")]
    #[strum(serialize = "Timeout")]
    Timeout(String),

    /// An HTTP request body failed its declared schema.
    #[error("SchemaViolation: {0}")]
    #[strum(serialize = "SchemaViolation")]
    SchemaViolation(String),

    /// The transport session closed underneath a pending call.
    #[error("LinkShut: {0}")]
    #[strum(serialize = "LinkShut")]
    LinkShut(String),

    /// Persistent state predates or post-dates this binary.
    #[error("BadStorageVersion: {0}")]
    #[strum(serialize = "BadStorageVersion")]
    BadStorageVersion(String),

    #[error("IO Error: {0}")]
    #[strum(serialize = "IoError")]
    Io(Arc<std::io::Error>),

    #[error("Internal Error: {0}")]
    #[strum(serialize = "InternalError")]
    Internal(String),
}

impl AhaError {
    /// The symbolic code carried on the wire and in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        self.into()
    }

    /// Rebuilds an error from a wire fault. Unknown codes collapse to
    /// `Internal` so a newer peer cannot crash an older caller.
    pub fn from_code(code: &str, mesg: &str) -> Self {
        let mesg = mesg.to_string();
        match code {
            "NoSuchName" => AhaError::NoSuchName(mesg),
            "NotReady" => AhaError::NotReady(mesg),
            "NeedConfValu" => AhaError::NeedConfValu(mesg),
            "BadConfValu" => AhaError::BadConfValu(mesg),
            "BadArg" => AhaError::BadArg(mesg),
            "AuthDeny" => AhaError::AuthDeny(mesg),
            "Timeout" => AhaError::Timeout(mesg),
            "SchemaViolation" => AhaError::SchemaViolation(mesg),
            "LinkShut" => AhaError::LinkShut(mesg),
            "BadStorageVersion" => AhaError::BadStorageVersion(mesg),
            _ => AhaError::Internal(mesg),
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// The Arc makes cloning cheap and shared.
impl Clone for AhaError {
    fn clone(&self) -> Self {
        match self {
            AhaError::NoSuchName(s) => AhaError::NoSuchName(s.clone()),
            AhaError::NotReady(s) => AhaError::NotReady(s.clone()),
            AhaError::NeedConfValu(s) => AhaError::NeedConfValu(s.clone()),
            AhaError::BadConfValu(s) => AhaError::BadConfValu(s.clone()),
            AhaError::BadArg(s) => AhaError::BadArg(s.clone()),
            AhaError::AuthDeny(s) => AhaError::AuthDeny(s.clone()),
            AhaError::Timeout(s) => AhaError::Timeout(s.clone()),
            AhaError::SchemaViolation(s) => AhaError::SchemaViolation(s.clone()),
            AhaError::LinkShut(s) => AhaError::LinkShut(s.clone()),
            AhaError::BadStorageVersion(s) => AhaError::BadStorageVersion(s.clone()),
            AhaError::Io(e) => AhaError::Io(Arc::clone(e)),
            AhaError::Internal(s) => AhaError::Internal(s.clone()),
        }
    }
}

impl PartialEq for AhaError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AhaError::Io(e1), AhaError::Io(e2)) => e1.to_string() == e2.to_string(),
            _ => {
                core::mem::discriminant(self) == core::mem::discriminant(other)
                    && self.to_string() == other.to_string()
            }
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for AhaError {
    fn from(e: std::io::Error) -> Self {
        AhaError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for AhaError {
    fn from(e: serde_json::Error) -> Self {
        AhaError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<url::ParseError> for AhaError {
    fn from(e: url::ParseError) -> Self {
        AhaError::BadArg(format!("invalid url: {e}"))
    }
}

impl From<rcgen::Error> for AhaError {
    fn from(e: rcgen::Error) -> Self {
        AhaError::BadArg(format!("certificate error: {e}"))
    }
}

impl From<rustls::Error> for AhaError {
    fn from(e: rustls::Error) -> Self {
        AhaError::AuthDeny(format!("TLS error: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for AhaError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AhaError::Timeout("deadline exceeded".to_string())
    }
}
