//! Two-phase JWT trust delegation for the MCP gateway.
//!
//! This crate provides:
//! - Verification of inbound gateway-issued JWTs (`X-Bkapi-Jwt`)
//! - Request-scoped carriage of verified-but-unsigned claims
//! - Lazy signing of a narrowly scoped "inner JWT" for backend calls
//!
//! The delegation lifecycle is a forward-only state machine:
//! `Unverified -> VerifiedUnsigned -> Signed`. One instance exists per
//! inbound request; nothing here is cached or shared across requests.

mod claims;
mod delegation;
mod error;

pub use claims::{AppClaim, DelegatedClaims, InboundClaims, InnerClaims, UserClaim};
pub use delegation::{virtual_app_code, JwtKeyPair, SignedCredential, TrustDelegation};
pub use error::{AuthError, AuthResult};
