//! RSA key pairs signing with PKCS#1 v1.5 and SHA-256.
//!
//! Roots created with these keys sign their own certificate with SHA-256.
//! Signing engines pick the digest per profile through
//! [`IssuerKey`](crate::keys::IssuerKey).
use rand_core::{CryptoRngCore, OsRng};
use rsa::{RsaPrivateKey, pkcs8::DecodePrivateKey, traits::PublicKeyParts};
use signature::Keypair;
use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::keys::CertificateKeypair;

#[cfg(not(test))]
pub const DEFAULT_KEY_SIZE: usize = 4096;

// Key generation in unit tests is expensive, 2048 is the smallest size which
// still fits SHA-512 PKCS#1 v1.5 signatures.
#[cfg(test)]
pub const DEFAULT_KEY_SIZE: usize = 2048;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate RSA key"))]
    CreateKey { source: rsa::Error },

    #[snafu(display("failed to decode RSA key from PKCS#8 PEM"))]
    DeserializeSigningKey { source: rsa::pkcs8::Error },
}

#[derive(Debug)]
pub struct SigningKey(rsa::pkcs1v15::SigningKey<sha2::Sha256>);

impl SigningKey {
    /// Generates a key of `key_size` bits. 4096 bit keys can take seconds.
    #[instrument(name = "create_rsa_signing_key_with_size")]
    pub fn with_key_size(key_size: usize) -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, key_size).context(CreateKeySnafu)?;
        Ok(Self::from(private_key))
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        self.0.as_ref()
    }
}

impl From<RsaPrivateKey> for SigningKey {
    fn from(private_key: RsaPrivateKey) -> Self {
        Self(rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(private_key))
    }
}

impl CertificateKeypair for SigningKey {
    type Error = Error;
    type Signature = rsa::pkcs1v15::Signature;
    type SigningKey = rsa::pkcs1v15::SigningKey<sha2::Sha256>;
    type VerifyingKey = rsa::pkcs1v15::VerifyingKey<sha2::Sha256>;

    /// Generates a key of [`DEFAULT_KEY_SIZE`] bits.
    #[instrument(name = "create_rsa_signing_key")]
    fn new() -> Result<Self> {
        let mut csprng = OsRng;
        Self::new_with_rng(&mut csprng)
    }

    #[instrument(name = "create_rsa_signing_key_custom_rng", skip_all)]
    fn new_with_rng<Rng>(rng: &mut Rng) -> Result<Self>
    where
        Rng: CryptoRngCore,
    {
        let private_key = RsaPrivateKey::new(rng, DEFAULT_KEY_SIZE).context(CreateKeySnafu)?;
        Ok(Self::from(private_key))
    }

    fn signing_key(&self) -> &Self::SigningKey {
        &self.0
    }

    fn verifying_key(&self) -> Self::VerifyingKey {
        self.0.verifying_key()
    }

    #[instrument(name = "create_rsa_signing_key_from_pkcs8_pem", skip(input))]
    fn from_pkcs8_pem(input: &str) -> Result<Self, Self::Error> {
        let private_key =
            RsaPrivateKey::from_pkcs8_pem(input).context(DeserializeSigningKeySnafu)?;

        Ok(Self::from(private_key))
    }

    fn algorithm_name() -> &'static str {
        "rsa"
    }

    fn key_size(&self) -> usize {
        self.private_key().size() * 8
    }
}
