//! Request signer (§4.9's mtCall step): computes the HMAC-SHA256 the
//! gateway attaches to a signed call before forwarding it to
//! `daemon.SignFetch`. Verification of that signature and of the receive
//! window is the stored procedure's job (§4.10: "implicit contract,
//! enforced by SQL"), not this process's.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex-encoded HMAC-SHA256 over `action || nonce || payload`,
/// matching the order the signed-call frame is built in on the wire.
pub fn sign(key: &[u8], nonce: &str, action: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    mac.update(action.as_bytes());
    mac.update(nonce.as_bytes());
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}
