//! This crate provides types, traits and functions to issue X.509
//! certificates under signing policies. It can be used to create certificate
//! authorities (CAs), to describe what these CAs may issue using policies
//! and profiles, and to sign certificate signing requests (CSRs).
//!
//! The main entry point is the [`SigningEngine`](sign::SigningEngine), which
//! binds one CA identity to one [`Policy`](policy::Policy). Engines can be
//! backed by self-signed roots created with the
//! [`CertificateAuthority`](ca::CertificateAuthority) builder or by any
//! certificate and key loaded from PEM, including intermediates issued by
//! another engine.
//!
//! ## References
//!
//! - <https://datatracker.ietf.org/doc/html/rfc5280>
//! - <https://datatracker.ietf.org/doc/html/rfc2986>
//! - <https://github.com/zmap/zlint>
use p256::pkcs8::EncodePrivateKey;
use snafu::{ResultExt, Snafu};
use strum::{Display, EnumString};
use x509_cert::{Certificate, der::EncodePem, spki::EncodePublicKey};
use zeroize::Zeroizing;

use crate::{keys::CertificateKeypair, sign::PEM_LINE_ENDING};

pub mod ca;
pub mod keys;
pub mod policy;
pub mod sign;

/// Error variants which can be encountered when serializing a
/// [`CertificatePair`].
#[derive(Debug, Snafu)]
pub enum CertificatePairError {
    #[snafu(display("failed to serialize certificate as PEM"))]
    SerializeCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to serialize private key as PKCS8 PEM"))]
    SerializePrivateKey { source: p256::pkcs8::Error },
}

/// Contains the certificate and the signing / embedded key pair.
///
/// A [`CertificateAuthority`](crate::ca::CertificateAuthority) uses this
/// struct internally to store the signing key pair which is used to sign the
/// CA itself (self-signed).
#[derive(Debug)]
pub struct CertificatePair<S>
where
    S: CertificateKeypair,
    <S::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    certificate: Certificate,
    key_pair: S,
}

impl<S> CertificatePair<S>
where
    S: CertificateKeypair,
    <S::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    pub fn new(certificate: Certificate, key_pair: S) -> Self {
        Self {
            certificate,
            key_pair,
        }
    }

    /// Returns a reference to the [`Certificate`].
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Returns a reference to the (signing) key pair.
    pub fn key_pair(&self) -> &S {
        &self.key_pair
    }

    pub fn into_parts(self) -> (Certificate, S) {
        (self.certificate, self.key_pair)
    }

    pub fn certificate_pem(&self) -> Result<String, CertificatePairError> {
        self.certificate
            .to_pem(PEM_LINE_ENDING)
            .context(SerializeCertificateSnafu)
    }

    /// Returns the private key as PKCS#8 PEM. The returned string is zeroized
    /// on drop.
    pub fn private_key_pem(&self) -> Result<Zeroizing<String>, CertificatePairError> {
        self.key_pair
            .signing_key()
            .to_pkcs8_pem(PEM_LINE_ENDING)
            .context(SerializePrivateKeySnafu)
    }
}

/// Supported private key types, currently [RSA](crate::keys::rsa) and
/// [ECDSA](crate::keys::ecdsa).
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum PrivateKeyType {
    Ecdsa,
    Rsa,
}
