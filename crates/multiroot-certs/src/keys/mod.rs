//! Key pairs of certificate authorities.
//!
//! [`CertificateKeypair`] is implemented by the [`ecdsa`] (P-256) and
//! [`rsa`] key pairs. It is used where the algorithm is fixed at compile time,
//! for example when a root is created with
//! [`CertificateAuthority`](crate::ca::CertificateAuthority). Signing engines
//! are configured at runtime and hold an [`IssuerKey`] instead, which can be
//! either family and is loaded from any of the common PEM encodings.
//!
//! ```no_run
//! use multiroot_certs::keys::{CertificateKeypair, ecdsa, rsa};
//!
//! let ecdsa_key = ecdsa::SigningKey::new().unwrap();
//! let rsa_key = rsa::SigningKey::with_key_size(2048).unwrap();
//! ```
//!
//! The `rsa` crate is affected by the Marvin timing attack on decryption,
//! see <https://rustsec.org/advisories/RUSTSEC-2023-0071.html>. Keys here are
//! only ever used to sign.
use std::fmt::Debug;

use p256::pkcs8::EncodePrivateKey;
use rand_core::CryptoRngCore;
use signature::{Keypair, Signer};
use x509_cert::spki::{EncodePublicKey, SignatureAlgorithmIdentifier, SignatureBitStringEncoding};

pub mod ecdsa;
mod issuer;
pub mod rsa;

pub use issuer::*;

pub trait CertificateKeypair
where
    <Self::SigningKey as Keypair>::VerifyingKey: EncodePublicKey,
    Self: Debug + Sized,
{
    type SigningKey: SignatureAlgorithmIdentifier
        + Keypair
        + Signer<Self::Signature>
        + EncodePrivateKey;
    type Signature: SignatureBitStringEncoding;
    type VerifyingKey: EncodePublicKey;

    type Error: std::error::Error + 'static;

    /// Generates a key with [`rand_core::OsRng`].
    fn new() -> Result<Self, Self::Error>;

    fn new_with_rng<Rng>(rng: &mut Rng) -> Result<Self, Self::Error>
    where
        Rng: CryptoRngCore;

    fn signing_key(&self) -> &Self::SigningKey;

    fn verifying_key(&self) -> Self::VerifyingKey;

    /// Loads a key pair from a PKCS#8 `PRIVATE KEY` PEM block.
    fn from_pkcs8_pem(input: &str) -> Result<Self, Self::Error>;

    /// Lowercase algorithm name, used in logs.
    fn algorithm_name() -> &'static str;

    /// Key length in bits.
    fn key_size(&self) -> usize;
}
