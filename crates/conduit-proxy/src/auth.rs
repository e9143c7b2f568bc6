use std::net::IpAddr;
use std::time::Duration;

use conduit_types::GameProfile;
use num_bigint::BigInt;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("key generation failed: {0}")]
    KeyGen(#[from] rsa::Error),
    #[error("could not encode public key: {0}")]
    KeyEncode(#[from] rsa::pkcs8::spki::Error),
    #[error("ciphertext did not decrypt")]
    Decrypt,
    #[error("shared secret must be 16 bytes, got {0}")]
    BadSecretLength(usize),
    #[error("verify token mismatch")]
    TokenMismatch,
    #[error("session service error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("session service did not verify the login")]
    Unverified,
}

/// The proxy's per-process RSA identity, generated once at startup and used
/// for every online-mode exchange.
pub struct ProxyKeyPair {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
}

impl ProxyKeyPair {
    pub fn generate() -> Result<Self, AuthError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024)?;
        let public_der = RsaPublicKey::from(&private)
            .to_public_key_der()?
            .as_bytes()
            .to_vec();
        Ok(Self {
            private,
            public_der,
        })
    }

    /// X.509 SubjectPublicKeyInfo DER, as the EncryptionRequest carries it.
    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, AuthError> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|_| AuthError::Decrypt)
    }

    /// Random 4-byte verify token for one exchange.
    pub fn new_verify_token() -> [u8; 4] {
        rand::random()
    }
}

/// The Minecraft-style server-ID digest: SHA-1 over
/// `server_id ‖ shared_secret ‖ public_key`, rendered as a signed
/// two's-complement hex number with no leading zeroes.
pub fn server_hash(server_id: &str, shared_secret: &[u8], public_key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(server_id.as_bytes());
    hasher.update(shared_secret);
    hasher.update(public_key);
    let digest = hasher.finalize();
    BigInt::from_signed_bytes_be(&digest).to_str_radix(16)
}

/// Client for the HTTP session service the proxy trusts for online-mode
/// identity.
pub struct SessionService {
    http: reqwest::Client,
    base_url: String,
}

pub const DEFAULT_SESSION_SERVER: &str = "https://sessionserver.mojang.com";

impl SessionService {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// `GET /session/minecraft/hasJoined`. 200 with a profile is a verified
    /// login; 204 or any other status is not.
    pub async fn has_joined(
        &self,
        username: &str,
        server_hash: &str,
        ip: Option<IpAddr>,
    ) -> Result<Option<GameProfile>, AuthError> {
        let mut request = self
            .http
            .get(format!("{}/session/minecraft/hasJoined", self.base_url))
            .query(&[("username", username), ("serverId", server_hash)]);
        if let Some(ip) = ip {
            request = request.query(&[("ip", ip.to_string())]);
        }
        let response = request.send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Ok(None);
        }
        let profile = response.json::<GameProfile>().await?;
        Ok(Some(profile))
    }
}

impl Default for SessionService {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_SERVER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The classic protocol test vectors: digests of bare usernames.
    #[test]
    fn server_hash_matches_known_vectors() {
        assert_eq!(
            server_hash("Notch", b"", b""),
            "4ed1f46bbe04bc756bcb17c0c7ce3e4632f06a48"
        );
        assert_eq!(
            server_hash("jeb_", b"", b""),
            "-7c9d5b0044c130109a5d7b5fb5c317c02b4e28c1"
        );
        assert_eq!(
            server_hash("simon", b"", b""),
            "88e16a1019277b15d58faf0541e11910eb756f6"
        );
    }

    #[test]
    fn server_hash_covers_secret_and_key() {
        let base = server_hash("", b"secret", b"key");
        assert_ne!(base, server_hash("", b"secret", b"other"));
        assert_ne!(base, server_hash("", b"other", b"key"));
    }

    #[test]
    fn keypair_roundtrips_rsa_pkcs1v15() {
        use rsa::pkcs8::DecodePublicKey;
        let keys = ProxyKeyPair::generate().unwrap();
        let public = RsaPublicKey::from_public_key_der(keys.public_der()).unwrap();
        let mut rng = rand::thread_rng();
        let secret = [7u8; 16];
        let ciphertext = public.encrypt(&mut rng, Pkcs1v15Encrypt, &secret).unwrap();
        assert_eq!(keys.decrypt(&ciphertext).unwrap(), secret);
    }

    #[test]
    fn verify_tokens_are_random() {
        // Two fresh tokens colliding is a 2^-32 event; treat as failure.
        assert_ne!(ProxyKeyPair::new_verify_token(), ProxyKeyPair::new_verify_token());
    }
}
