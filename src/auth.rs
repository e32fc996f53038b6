//! Caller identity for socket upgrades.
//!
//! Tokens are issued elsewhere; this crate only needs to turn a presented token
//! into an [`Identity`]. [`JwtIdentity`] does that for HS256 access tokens carrying
//! `user_id` and `username` claims.
//!
//! ## Example Usage
//! ```no_run
//! use scorecast::auth::{IdentityProvider, JwtIdentity};
//!
//! # async fn demo(token: &str) -> anyhow::Result<()> {
//! let provider = JwtIdentity::new("my-secret-key");
//! let identity = provider.identify(token).await?;
//! println!("{} connected", identity.username);
//! # Ok(())
//! # }
//! ```

use crate::connection::Identity;
use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Resolves a bearer token to the user behind it.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
  async fn identify(&self, token: &str) -> Result<Identity>;
}

/// Access token payload.
///
/// ## Fields
/// - `user_id`: Numeric id of the user.
/// - `username`: Display name shown to other players.
/// - `exp`: Expiration as a UNIX timestamp.
/// - `iss`: Optional issuer, checked when configured.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
  pub user_id: u64,
  pub username: String,
  pub exp: usize,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub iss: Option<String>,
}

/// Validation options for [`JwtIdentity`].
#[derive(Clone, Debug, Default)]
pub struct JwtOptions {
  /// Allowed clock skew in seconds.
  pub leeway: u64,
  pub issuer: Option<String>,
}

/// Verifies HS256 access tokens signed with a shared secret.
#[derive(Clone)]
pub struct JwtIdentity {
  key: DecodingKey,
  validation: Validation,
}

impl JwtIdentity {
  pub fn new(secret: &str) -> Self {
    Self::with_options(secret, JwtOptions::default())
  }

  pub fn with_options(secret: &str, options: JwtOptions) -> Self {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = options.leeway;
    if let Some(ref iss) = options.issuer {
      validation.set_issuer(&[iss]);
    }
    Self {
      key: DecodingKey::from_secret(secret.as_bytes()),
      validation,
    }
  }

  /// Decode and validate an access token.
  pub fn verify(&self, token: &str) -> Result<AccessClaims> {
    let data = decode::<AccessClaims>(token, &self.key, &self.validation).context("Failed to decode access token")?;
    Ok(data.claims)
  }
}

#[async_trait]
impl IdentityProvider for JwtIdentity {
  async fn identify(&self, token: &str) -> Result<Identity> {
    let claims = self.verify(token)?;
    Ok(Identity::new(claims.user_id, claims.username))
  }
}

/// ######################################## TESTS ########################################
