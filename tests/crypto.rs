//! Tests for the message encryption contract: ECDH + HKDF + AES-GCM
//! round-trips, JWK validation, and framing integrity.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use derecho::error::GatewayError;
use derecho::persist::crypto::{decrypt_message, encrypt_message, parse_public_key};

fn keypair() -> (p256::SecretKey, String) {
    let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
    let jwk = secret.public_key().to_jwk_string();
    (secret, jwk)
}

#[test]
fn encrypt_decrypt_round_trips() {
    let (secret, jwk) = keypair();
    for plaintext in ["", "hello", "unicode ♞ works", &"x".repeat(10 * 1024)] {
        let framed = encrypt_message(&jwk, plaintext.as_bytes()).unwrap();
        let decrypted = decrypt_message(&secret, &framed).unwrap();
        assert_eq!(decrypted, plaintext.as_bytes());
    }
}

#[test]
fn each_encryption_uses_a_fresh_ephemeral_key() {
    let (_, jwk) = keypair();
    let a = encrypt_message(&jwk, b"same").unwrap();
    let b = encrypt_message(&jwk, b"same").unwrap();
    assert_ne!(a, b);
}

#[test]
fn framing_carries_uncompressed_point_and_nonce() {
    let (_, jwk) = keypair();
    let framed = encrypt_message(&jwk, b"payload").unwrap();
    let raw = BASE64.decode(framed).unwrap();
    // 65-byte SEC1 point + 12-byte nonce + ciphertext + 16-byte tag
    assert!(raw.len() >= 65 + 12 + 7 + 16);
    assert_eq!(raw[0], 0x04, "SEC1 uncompressed point marker");
}

#[test]
fn wrong_curve_jwk_is_rejected() {
    // a P-384 key must not validate as P-256
    let jwk = r#"{"kty":"EC","crv":"P-384","x":"AA","y":"AA"}"#;
    assert!(matches!(
        parse_public_key(jwk),
        Err(GatewayError::PublicKeyInvalid(_))
    ));
}

#[test]
fn malformed_jwk_is_rejected() {
    for bad in [
        "",
        "not json",
        r#"{"kty":"RSA","n":"AA","e":"AQAB"}"#,
        // valid shape, but coordinates not on the curve
        r#"{"kty":"EC","crv":"P-256","x":"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA","y":"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"}"#,
    ] {
        assert!(
            matches!(parse_public_key(bad), Err(GatewayError::PublicKeyInvalid(_))),
            "jwk should be rejected: {bad}"
        );
    }
}

#[test]
fn encrypting_to_invalid_key_is_a_hard_failure() {
    assert!(matches!(
        encrypt_message("garbage", b"data"),
        Err(GatewayError::PublicKeyInvalid(_))
    ));
}

#[test]
fn tampered_ciphertext_fails_decryption() {
    let (secret, jwk) = keypair();
    let framed = encrypt_message(&jwk, b"integrity matters").unwrap();
    let mut raw = BASE64.decode(&framed).unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0xff;
    let tampered = BASE64.encode(raw);
    assert!(decrypt_message(&secret, &tampered).is_err());
}

#[test]
fn truncated_ciphertext_is_rejected() {
    let (secret, _) = keypair();
    let short = BASE64.encode([0u8; 16]);
    assert!(decrypt_message(&secret, &short).is_err());
    assert!(decrypt_message(&secret, "!!!not-base64!!!").is_err());
}

#[test]
fn decryption_with_the_wrong_key_fails() {
    let (_, jwk) = keypair();
    let (other_secret, _) = keypair();
    let framed = encrypt_message(&jwk, b"for someone else").unwrap();
    assert!(decrypt_message(&other_secret, &framed).is_err());
}
