//! Claim shapes for inbound gateway JWTs and outbound inner JWTs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `app` claim of a gateway-issued JWT.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppClaim {
    #[serde(default)]
    pub app_code: String,
    #[serde(default)]
    pub verified: bool,
}

/// The `user` claim of a gateway-issued JWT.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserClaim {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub verified: bool,
}

/// Raw claims of an inbound token, as issued by the API gateway.
///
/// `aud` is kept opaque: gateways emit both string and array forms and the
/// value is only ever carried through to the inner JWT.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundClaims {
    #[serde(default)]
    pub app: Option<AppClaim>,
    #[serde(default)]
    pub user: Option<UserClaim>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<Value>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub nbf: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
}

/// Verified claims carried through request-scoped context, not yet signed
/// into an outbound credential.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegatedClaims {
    pub app_code: String,
    pub app_verified: bool,
    pub username: String,
    pub user_verified: bool,
    pub issuer: Option<String>,
    pub audience: Option<Value>,
}

impl DelegatedClaims {
    pub(crate) fn from_inbound(claims: &InboundClaims) -> Self {
        let app = claims.app.clone().unwrap_or_default();
        let user = claims.user.clone().unwrap_or_default();
        Self {
            app_code: app.app_code,
            app_verified: app.verified,
            username: user.username,
            user_verified: user.verified,
            issuer: claims.iss.clone(),
            audience: claims.aud.clone(),
        }
    }
}

/// Claims of the outbound inner JWT, signed on demand per backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerClaims {
    pub app: AppClaim,
    pub user: UserClaim,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<Value>,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_claims_minimal() {
        let claims: InboundClaims = serde_json::from_str(r#"{"exp": 1}"#).unwrap();
        assert!(claims.app.is_none());
        assert!(claims.user.is_none());
        assert_eq!(claims.exp, Some(1));
    }

    #[test]
    fn test_inbound_claims_full() {
        let json = r#"{
            "app": {"app_code": "demo", "verified": true},
            "user": {"username": "alice", "verified": true},
            "iss": "apigw",
            "aud": ["svc-a", "svc-b"],
            "exp": 100, "nbf": 1, "iat": 1
        }"#;
        let claims: InboundClaims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.app.as_ref().unwrap().app_code, "demo");
        assert!(claims.user.as_ref().unwrap().verified);
        assert_eq!(claims.iss.as_deref(), Some("apigw"));
        assert!(claims.aud.as_ref().unwrap().is_array());
    }

    #[test]
    fn test_delegated_from_inbound_defaults() {
        let claims = InboundClaims::default();
        let delegated = DelegatedClaims::from_inbound(&claims);
        assert!(delegated.app_code.is_empty());
        assert!(!delegated.app_verified);
        assert!(delegated.username.is_empty());
    }
}
