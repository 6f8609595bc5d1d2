#![forbid(unsafe_code)]

//! Shared security helpers used by the viewtube backend.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. Running as a regular
/// unprivileged user keeps local installs predictable and avoids accidental
/// writes into system directories.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Checks an `Authorization` header against the forced-refresh secret.
///
/// An unset/empty secret never authorizes anything, so a blank env var does
/// not leave the endpoint open.
pub fn verify_bearer(header: Option<&str>, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    matches!(
        header.and_then(|value| value.strip_prefix("Bearer ")),
        Some(token) if token == secret
    )
}

/// Checks a webhook signature header against the shared secret.
///
/// This is a plain equality check, not an HMAC over the payload; the hub we
/// subscribe to only echoes the shared token back.
pub fn verify_webhook_signature(signature: Option<&str>, secret: &str) -> bool {
    !secret.is_empty() && signature == Some(secret)
}
