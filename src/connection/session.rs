// src/connection/session.rs

//! Defines how an accepted transport session enters the handler: what the
//! listener already knows about the peer before the first frame arrives.

/// How the peer authenticated at the transport layer, if at all.
#[derive(Debug, Clone, Default)]
pub enum PeerAuth {
    /// Nothing yet; the session must issue an `auth` call.
    #[default]
    Anonymous,
    /// A trusted local socket (unix domain or in-process). Sessions arrive
    /// as the root user, the way local admin tools expect.
    TrustedLocal,
    /// Mutual TLS; the peer certificate CN selects the user.
    CertCn(String),
}

/// Listener-supplied facts about one accepted session.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub auth: PeerAuth,
    /// True when this session arrived on the provisioning listener. Such a
    /// session must resolve a one-time token before anything else.
    pub prov_only: bool,
}
