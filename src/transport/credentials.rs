//! Time-windowed broker credentials
//!
//! Secret mode: `client_id = <id>_0_0_<YYYYMMDDHH>` and
//! `password = hex(HMAC-SHA256(key = YYYYMMDDHH, msg = secret))`, using the
//! current UTC hour as the window. Certificate mode carries key material paths
//! and no password.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// How the edge authenticates to the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Shared secret, hashed per hour
    Secret {
        /// Device or bridge secret
        secret: String,
    },
    /// X.509 client certificate
    Certificate {
        /// PEM certificate path
        cert_path: PathBuf,
        /// PEM private key path
        key_path: PathBuf,
    },
}

/// Credentials for one connection attempt
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub username: String,
    pub password: Option<String>,
    pub certificate: Option<(PathBuf, PathBuf)>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("certificate", &self.certificate)
            .finish()
    }
}

impl Credentials {
    /// Derive credentials for `identity` at `now`
    ///
    /// # Errors
    ///
    /// Returns an error if the secret cannot be signed
    pub fn derive(identity: &str, auth: &AuthMode, now: DateTime<Utc>) -> Result<Self> {
        let stamp = timestamp(now);
        let client_id = format!("{identity}_0_0_{stamp}");

        Ok(match auth {
            AuthMode::Secret { secret } => Self {
                client_id,
                username: identity.to_string(),
                password: Some(sign_secret(secret, &stamp)?),
                certificate: None,
            },
            AuthMode::Certificate {
                cert_path,
                key_path,
            } => Self {
                client_id,
                username: identity.to_string(),
                password: None,
                certificate: Some((cert_path.clone(), key_path.clone())),
            },
        })
    }
}

/// Hour-resolution UTC timestamp used as the signing window
#[must_use]
pub fn timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H").to_string()
}

/// Hex HMAC of `secret` keyed by the timestamp
///
/// # Errors
///
/// Returns an error if the MAC rejects the key
pub fn sign_secret(secret: &str, stamp: &str) -> Result<String> {
    Ok(hex::encode(hmac_sha256(stamp.as_bytes(), secret.as_bytes())?))
}

/// HMAC-SHA256(key, data)
///
/// # Errors
///
/// Returns an error if the MAC rejects the key
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Transport(format!("invalid signing key: {e}")))?;
    Ok(mac.chain_update(data).finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn hmac_matches_rfc4231_case_2() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn long_keys_are_hashed_first() {
        let key = [0xaa_u8; 131];
        let mac =
            hmac_sha256(&key, b"Test Using Larger Than Block-Size Key - Hash Key First").unwrap();
        assert_eq!(
            hex::encode(mac),
            "60e431591ee0b67f0d8a26aacbf5b77f8e0bc6213728c5140546040f0ee37f54"
        );
    }

    #[test]
    fn secret_mode_uses_hour_window() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 45, 12).unwrap();
        let creds = Credentials::derive(
            "bridge-01",
            &AuthMode::Secret {
                secret: "s3cr3t".to_string(),
            },
            now,
        )
        .unwrap();

        assert_eq!(creds.client_id, "bridge-01_0_0_2024030907");
        assert_eq!(creds.username, "bridge-01");
        assert_eq!(
            creds.password.as_deref(),
            Some(sign_secret("s3cr3t", "2024030907").unwrap().as_str())
        );
        assert!(creds.certificate.is_none());
    }

    #[test]
    fn password_rotates_with_the_hour() {
        let auth = AuthMode::Secret {
            secret: "s3cr3t".to_string(),
        };
        let at = |h, m, sec| {
            Credentials::derive("gw", &auth, Utc.with_ymd_and_hms(2024, 3, 9, h, m, sec).unwrap())
                .unwrap()
        };
        let a = at(7, 0, 0);
        let b = at(7, 59, 59);
        let c = at(8, 0, 0);

        assert_eq!(a.password, b.password);
        assert_ne!(b.password, c.password);
    }

    #[test]
    fn certificate_mode_has_no_password() {
        let creds = Credentials::derive(
            "gw",
            &AuthMode::Certificate {
                cert_path: "/etc/edge/cert.pem".into(),
                key_path: "/etc/edge/key.pem".into(),
            },
            Utc::now(),
        )
        .unwrap();
        assert!(creds.password.is_none());
        assert!(creds.certificate.is_some());
        assert!(!format!("{creds:?}").contains("s3cr3t"));
    }
}
