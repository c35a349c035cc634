//! Contains types and functions to generate self-signed certificate
//! authorities (CAs).
//!
//! A CA created here is only the starting point of a chain. To issue
//! certificates, hand it to a [`SigningEngine`](crate::sign::SigningEngine).
use x509_cert::{Certificate, name::Name, spki::EncodePublicKey};

use crate::{
    CertificatePair,
    keys::{CertificateKeypair, ecdsa, rsa},
};

mod ca_builder;
mod consts;
pub use ca_builder::*;
pub use consts::*;

/// A self-signed certificate authority (CA).
///
/// Use [`CertificateAuthorityBuilder`] to create new CAs.
#[derive(Debug)]
pub struct CertificateAuthority<SK>
where
    SK: CertificateKeypair,
    <SK::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    certificate_pair: CertificatePair<SK>,
}

impl<SK> CertificateAuthority<SK>
where
    SK: CertificateKeypair,
    <SK::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    pub fn new(certificate_pair: CertificatePair<SK>) -> Self {
        Self { certificate_pair }
    }

    /// Use this function in combination with [`CertificateAuthorityBuilder`] to create new CAs.
    pub fn builder<'a>() -> CertificateAuthorityBuilderBuilder<'a, SK> {
        CertificateAuthorityBuilder::start_builder()
    }

    pub fn signing_key(&self) -> &SK::SigningKey {
        self.certificate_pair.key_pair().signing_key()
    }

    pub fn ca_cert(&self) -> &Certificate {
        self.certificate_pair.certificate()
    }

    pub fn certificate_pair(&self) -> &CertificatePair<SK> {
        &self.certificate_pair
    }

    pub fn into_certificate_pair(self) -> CertificatePair<SK> {
        self.certificate_pair
    }

    /// The name certificates issued by this CA carry as their issuer, which
    /// is the subject of the CA certificate.
    pub fn issuer_name(&self) -> &Name {
        &self.ca_cert().tbs_certificate.subject
    }
}

impl CertificateAuthority<rsa::SigningKey> {
    /// Same as [`Self::builder`], but enforces the RSA algorithm for key creation.
    pub fn builder_with_rsa<'a>() -> CertificateAuthorityBuilderBuilder<'a, rsa::SigningKey> {
        Self::builder()
    }
}

impl CertificateAuthority<ecdsa::SigningKey> {
    /// Same as [`Self::builder`], but enforces the ecdsa algorithm for key creation.
    pub fn builder_with_ecdsa<'a>() -> CertificateAuthorityBuilderBuilder<'a, ecdsa::SigningKey> {
        Self::builder()
    }
}
