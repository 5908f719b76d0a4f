//! Message encryption: ephemeral P-256 ECDH against the recipient's static
//! key, HKDF-SHA-256 key derivation, AES-256-GCM. The wire framing is
//! base64(ephemeral_public_key || nonce || ciphertext_with_tag) with the
//! ephemeral key as an uncompressed SEC1 point.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::GatewayError;

/// HKDF info string binding derived keys to this use.
const HKDF_INFO: &[u8] = b"message-encryption";

/// Uncompressed SEC1 P-256 point length.
const EPHEMERAL_PUB_LEN: usize = 65;

const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length.
const TAG_LEN: usize = 16;

/// Parse and validate a JWK public key: must be EC on P-256 with
/// coordinates on the curve. Any mismatch is a hard failure.
pub fn parse_public_key(jwk: &str) -> Result<PublicKey, GatewayError> {
    PublicKey::from_jwk_str(jwk).map_err(|e| GatewayError::PublicKeyInvalid(e.to_string()))
}

fn derive_key(shared: &p256::ecdh::SharedSecret) -> Result<[u8; 32], GatewayError> {
    let mut key = [0u8; 32];
    Hkdf::<Sha256>::new(None, shared.raw_secret_bytes())
        .expand(HKDF_INFO, &mut key)
        .map_err(|e| GatewayError::Other(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// Encrypt `plaintext` to the holder of the JWK public key.
pub fn encrypt_message(recipient_jwk: &str, plaintext: &[u8]) -> Result<String, GatewayError> {
    let recipient = parse_public_key(recipient_jwk)?;

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_pub = ephemeral.public_key();
    let shared = ephemeral.diffie_hellman(&recipient);
    let key = derive_key(&shared)?;

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| GatewayError::Other(format!("cipher init failed: {e}")))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| GatewayError::Other("encryption failed".to_string()))?;

    let point = ephemeral_pub.to_encoded_point(false);
    let mut framed = Vec::with_capacity(EPHEMERAL_PUB_LEN + NONCE_LEN + ciphertext.len());
    framed.extend_from_slice(point.as_bytes());
    framed.extend_from_slice(&nonce);
    framed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(framed))
}

/// Decrypt a framed message with the recipient's static secret key.
pub fn decrypt_message(
    recipient: &SecretKey,
    framed_b64: &str,
) -> Result<Vec<u8>, GatewayError> {
    let framed = BASE64
        .decode(framed_b64)
        .map_err(|e| GatewayError::Other(format!("bad ciphertext framing: {e}")))?;
    if framed.len() < EPHEMERAL_PUB_LEN + NONCE_LEN + TAG_LEN {
        return Err(GatewayError::Other("ciphertext too short".to_string()));
    }

    let ephemeral = PublicKey::from_sec1_bytes(&framed[..EPHEMERAL_PUB_LEN])
        .map_err(|e| GatewayError::PublicKeyInvalid(e.to_string()))?;
    let shared = p256::ecdh::diffie_hellman(
        recipient.to_nonzero_scalar(),
        ephemeral.as_affine(),
    );
    let key = derive_key(&shared)?;

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| GatewayError::Other(format!("cipher init failed: {e}")))?;
    let nonce = &framed[EPHEMERAL_PUB_LEN..EPHEMERAL_PUB_LEN + NONCE_LEN];
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            &framed[EPHEMERAL_PUB_LEN + NONCE_LEN..],
        )
        .map_err(|_| GatewayError::Other("decryption failed".to_string()))
}
