mod error;

pub use error::*;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::{thread_rng, RngCore};
use sha2::{Digest, Sha256};

/// Name of the session cookie when served over https. The `__Host-` prefix
/// pins it to our exact origin, so browsers insist on Secure and Path=/.
pub const COOKIE_SESSION: &str = "__Host-sid";
/// Session cookie name for plain-http dev setups (fake oauth enabled), since
/// browsers won't store a `__Host-` cookie without Secure.
pub const COOKIE_SESSION_INSECURE: &str = "sid";

/// 32 bytes from thread_rng, base64url'd with no padding. Good for session
/// IDs, oauth state params, PKCE verifiers, fake auth codes, etc.
pub fn new_opaque_id() -> String {
    let mut bytes = [0u8; 32];
    thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The S256 PKCE challenge for a verifier: base64url(sha256(verifier)), no padding.
pub fn pkce_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// A fresh (verifier, challenge) pair for one login attempt.
pub fn make_pkce() -> (String, String) {
    let verifier = new_opaque_id();
    let challenge = pkce_challenge(&verifier);
    (verifier, challenge)
}
