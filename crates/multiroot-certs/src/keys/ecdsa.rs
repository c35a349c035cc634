//! ECDSA key pairs on the NIST P-256 curve, signing with SHA-256.
use p256::{NistP256, pkcs8::DecodePrivateKey};
use rand_core::{CryptoRngCore, OsRng};
use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::keys::CertificateKeypair;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to deserialize ECDSA key from PEM"))]
    DeserializeKeyFromPem { source: p256::pkcs8::Error },
}

#[derive(Debug)]
pub struct SigningKey(p256::ecdsa::SigningKey);

impl From<p256::ecdsa::SigningKey> for SigningKey {
    fn from(signing_key: p256::ecdsa::SigningKey) -> Self {
        Self(signing_key)
    }
}

impl CertificateKeypair for SigningKey {
    type Error = Error;
    type Signature = ecdsa::der::Signature<NistP256>;
    type SigningKey = p256::ecdsa::SigningKey;
    type VerifyingKey = p256::ecdsa::VerifyingKey;

    #[instrument(name = "create_ecdsa_signing_key")]
    fn new() -> Result<Self> {
        let mut csprng = OsRng;
        Self::new_with_rng(&mut csprng)
    }

    #[instrument(name = "create_ecdsa_signing_key_custom_rng", skip_all)]
    fn new_with_rng<Rng>(rng: &mut Rng) -> Result<Self>
    where
        Rng: CryptoRngCore,
    {
        Ok(Self(p256::ecdsa::SigningKey::random(rng)))
    }

    fn signing_key(&self) -> &Self::SigningKey {
        &self.0
    }

    fn verifying_key(&self) -> Self::VerifyingKey {
        *self.0.verifying_key()
    }

    #[instrument(name = "create_ecdsa_signing_key_from_pkcs8_pem", skip(input))]
    fn from_pkcs8_pem(input: &str) -> Result<Self, Self::Error> {
        let signing_key =
            p256::ecdsa::SigningKey::from_pkcs8_pem(input).context(DeserializeKeyFromPemSnafu)?;

        Ok(Self(signing_key))
    }

    fn algorithm_name() -> &'static str {
        "ecdsa"
    }

    fn key_size(&self) -> usize {
        256
    }
}
