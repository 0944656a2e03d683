//! The trust-delegation state machine.
//!
//! Ingress verification turns an `X-Bkapi-Jwt` token into
//! [`TrustDelegation::VerifiedUnsigned`]; the signing step runs lazily,
//! only when a tool call actually reaches a backend, and yields a fresh
//! [`SignedCredential`] each time. Transitions are forward-only.

use std::{fmt, sync::Arc, time::Duration};

use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use tracing::debug;

use crate::{
    claims::{AppClaim, DelegatedClaims, InboundClaims, InnerClaims, UserClaim},
    error::{AuthError, AuthResult},
};

/// Tolerance for clock skew between the gateway and this process.
const CLOCK_SKEW_LEEWAY_SECS: i64 = 60;

/// Key material published for one gateway, looked up by its well-known name.
#[derive(Clone, Default)]
pub struct JwtKeyPair {
    /// PEM-encoded RSA public key used to verify inbound tokens.
    pub public_key: String,
    /// PEM-encoded RSA private key used to sign inner JWTs. May be absent,
    /// in which case signing fails per call rather than at ingress.
    pub private_key: Option<String>,
}

impl fmt::Debug for JwtKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtKeyPair")
            .field("public_key", &format!("{} bytes", self.public_key.len()))
            .field("private_key", &self.private_key.as_ref().map(|_| "****"))
            .finish()
    }
}

/// The virtual app code scoping a delegated identity to one proxied server.
pub fn virtual_app_code(mcp_server_id: i64, app_code: &str) -> String {
    format!("v_mcp_{}_{}", mcp_server_id, app_code)
}

/// Identity verified at ingress, carrying everything needed to sign later.
#[derive(Clone)]
pub struct VerifiedIdentity {
    claims: DelegatedClaims,
    signing_key: Option<Arc<EncodingKey>>,
    key_id: String,
}

impl fmt::Debug for VerifiedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedIdentity")
            .field("claims", &self.claims)
            .field("signing_key", &self.signing_key.as_ref().map(|_| "****"))
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// A freshly signed inner JWT, valid for one backend call window.
#[derive(Clone)]
pub struct SignedCredential {
    token: String,
}

impl SignedCredential {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn into_token(self) -> String {
        self.token
    }
}

impl fmt::Debug for SignedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedCredential")
            .field("token", &"****")
            .finish()
    }
}

/// Forward-only delegation state for one inbound request.
#[derive(Debug, Clone, Default)]
pub enum TrustDelegation {
    #[default]
    Unverified,
    VerifiedUnsigned(Box<VerifiedIdentity>),
    Signed(SignedCredential),
}

impl From<SignedCredential> for TrustDelegation {
    fn from(credential: SignedCredential) -> Self {
        TrustDelegation::Signed(credential)
    }
}

impl TrustDelegation {
    /// Read claims without verifying the signature.
    ///
    /// Used only to reject structurally hopeless requests (no app claim,
    /// unverified app) before the gateway's public key is even resolved.
    /// Never a substitute for [`TrustDelegation::verify`].
    pub fn peek(token: &str) -> AuthResult<InboundClaims> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = jsonwebtoken::dangerous::insecure_decode::<InboundClaims>(token)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        Ok(data.claims)
    }

    /// Verify an inbound token against the gateway's published public key.
    ///
    /// On success the state moves to `VerifiedUnsigned`; the private key is
    /// carried along so that signing needs no further lookups.
    pub fn verify(token: &str, keys: &JwtKeyPair, gateway_name: &str) -> AuthResult<Self> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let decoding_key = DecodingKey::from_rsa_pem(keys.public_key.as_bytes())
            .map_err(|e| AuthError::InvalidPublicKey(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_nbf = true;
        validation.validate_aud = false;

        let data = decode::<InboundClaims>(token, &decoding_key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::ImmatureSignature => AuthError::NotYetValid,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature(e.to_string()),
                _ => AuthError::Malformed(e.to_string()),
            }
        })?;
        let claims = data.claims;

        // jsonwebtoken does not check iat; a token stamped in the future is
        // as suspect as an expired one.
        if let Some(iat) = claims.iat {
            if iat > Utc::now().timestamp() + CLOCK_SKEW_LEEWAY_SECS {
                return Err(AuthError::IssuedInFuture);
            }
        }

        let app = claims.app.as_ref().ok_or(AuthError::MissingAppCode)?;
        if app.app_code.is_empty() {
            return Err(AuthError::MissingAppCode);
        }
        if !app.verified {
            return Err(AuthError::AppNotVerified);
        }

        debug!(app_code = %app.app_code, "inbound jwt verified");

        let signing_key = match &keys.private_key {
            Some(pem) => Some(Arc::new(
                EncodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| AuthError::InvalidPrivateKey(e.to_string()))?,
            )),
            None => None,
        };

        Ok(TrustDelegation::VerifiedUnsigned(Box::new(
            VerifiedIdentity {
                claims: DelegatedClaims::from_inbound(&claims),
                signing_key,
                key_id: gateway_name.to_string(),
            },
        )))
    }

    /// The verified claims, if this delegation has passed ingress.
    pub fn claims(&self) -> Option<&DelegatedClaims> {
        match self {
            TrustDelegation::VerifiedUnsigned(identity) => Some(&identity.claims),
            _ => None,
        }
    }

    /// Sign an inner JWT scoped to `mcp_server_id`.
    ///
    /// Valid only in the `VerifiedUnsigned` state. Each call mints a fresh
    /// credential with new `iat`/`nbf`/`exp`; nothing is cached.
    pub fn sign(&self, mcp_server_id: i64, ttl: Duration) -> AuthResult<SignedCredential> {
        let identity = match self {
            TrustDelegation::VerifiedUnsigned(identity) => identity,
            _ => return Err(AuthError::NotVerified),
        };
        let key = identity
            .signing_key
            .as_ref()
            .ok_or(AuthError::SigningKeyUnavailable)?;

        let now = Utc::now().timestamp();
        let claims = InnerClaims {
            app: AppClaim {
                app_code: virtual_app_code(mcp_server_id, &identity.claims.app_code),
                verified: identity.claims.app_verified,
            },
            user: UserClaim {
                username: identity.claims.username.clone(),
                verified: identity.claims.user_verified,
            },
            iss: identity.claims.issuer.clone(),
            aud: identity.claims.audience.clone(),
            iat: now,
            nbf: now,
            exp: now + ttl.as_secs() as i64,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(identity.key_id.clone());
        let token = encode(&header, &claims, key).map_err(|e| AuthError::Signing(e.to_string()))?;
        Ok(SignedCredential { token })
    }
}
