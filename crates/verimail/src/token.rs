//! Verification token generation.

use rand::{rngs::OsRng, RngCore};

/// Number of random bytes behind every token
pub const TOKEN_BYTES: usize = 32;

/// Generate a fresh, unguessable verification token.
///
/// Draws [`TOKEN_BYTES`] from the operating system CSPRNG and hex-encodes them,
/// so the result is safe to embed in a URL without further escaping. `OsRng`
/// panics if the entropy source fails, which is treated as fatal.
pub fn generate() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
