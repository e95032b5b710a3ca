// src/core/auth.rs

//! The fabric's user database: names, Argon2 password hashes, admin and
//! locked flags. Users live in the hive and mutate through nexus edits so
//! mirrors agree on who may talk to them.

use crate::core::errors::AhaError;
use crate::core::hive::Hive;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One user record as stored under `auth/users/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserDef {
    pub iden: String,
    pub name: String,
    /// The Argon2 password hash, absent for cert-only identities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow: Option<String>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub locked: bool,
}

fn user_path(name: &str) -> [&str; 3] {
    ["auth", "users", name]
}

/// Hashes a password for storage.
pub fn hash_passwd(passwd: &str) -> Result<String, AhaError> {
    let salt = SaltString::generate(&mut OsRng);
    let shadow = Argon2::default()
        .hash_password(passwd.as_bytes(), &salt)
        .map_err(|_| AhaError::Internal("password hashing failed".to_string()))?;
    Ok(shadow.to_string())
}

/// Constant-shape password check against a stored hash.
pub fn check_passwd(shadow: &str, passwd: &str) -> bool {
    match PasswordHash::new(shadow) {
        Ok(parsed) => Argon2::default()
            .verify_password(passwd.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

// --- Apply helpers, invoked from the nexus apply path only ---

pub fn apply_user_add(hive: &Hive, user: &UserDef) {
    // Additive: an existing record keeps its shadow unless the edit
    // carries one, but admin/locked are asserted as given.
    let mut merged = user.clone();
    if merged.shadow.is_none()
        && let Some(existing) = get_user(hive, &user.name)
    {
        merged.shadow = existing.shadow;
        merged.iden = existing.iden;
    }
    hive.set(
        &user_path(&merged.name),
        serde_json::to_value(&merged).unwrap_or(Value::Null),
    );
}

pub fn apply_user_passwd(hive: &Hive, name: &str, shadow: &str) {
    if let Some(mut user) = get_user(hive, name) {
        user.shadow = Some(shadow.to_string());
        hive.set(
            &user_path(name),
            serde_json::to_value(&user).unwrap_or(Value::Null),
        );
    }
}

pub fn apply_user_locked(hive: &Hive, name: &str, locked: bool) {
    if let Some(mut user) = get_user(hive, name) {
        user.locked = locked;
        hive.set(
            &user_path(name),
            serde_json::to_value(&user).unwrap_or(Value::Null),
        );
    }
}

pub fn apply_user_admin(hive: &Hive, name: &str, admin: bool) {
    if let Some(mut user) = get_user(hive, name) {
        user.admin = admin;
        hive.set(
            &user_path(name),
            serde_json::to_value(&user).unwrap_or(Value::Null),
        );
    }
}

// --- Reads ---

pub fn get_user(hive: &Hive, name: &str) -> Option<UserDef> {
    hive.get(&user_path(name))
        .and_then(|v| serde_json::from_value(v).ok())
}

/// Password login. Locked users are denied even with the right password.
pub fn auth_passwd(hive: &Hive, name: &str, passwd: &str) -> Result<UserDef, AhaError> {
    let user = get_user(hive, name)
        .ok_or_else(|| AhaError::AuthDeny(format!("no such user: {name}")))?;
    if user.locked {
        return Err(AhaError::AuthDeny(format!("user {name} is locked")));
    }
    let Some(shadow) = user.shadow.as_deref() else {
        return Err(AhaError::AuthDeny(format!("user {name} has no password")));
    };
    if !check_passwd(shadow, passwd) {
        return Err(AhaError::AuthDeny(format!("invalid password for {name}")));
    }
    Ok(user)
}

/// Certificate login: the peer proved control of a CA-signed cert whose CN
/// names this user. Locked users are still denied.
pub fn auth_cert_cn(hive: &Hive, name: &str) -> Result<UserDef, AhaError> {
    let user = get_user(hive, name)
        .ok_or_else(|| AhaError::AuthDeny(format!("no such user: {name}")))?;
    if user.locked {
        return Err(AhaError::AuthDeny(format!("user {name} is locked")));
    }
    Ok(user)
}
