use bon::Builder;
use multiroot_shared::time::Duration;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile},
    der::referenced::OwnedToRef,
    ext::pkix::{
        AuthorityKeyIdentifier, BasicConstraints, KeyUsage, KeyUsages, SubjectKeyIdentifier,
    },
    name::Name,
    spki::{EncodePublicKey, SubjectPublicKeyInfoOwned},
    time::Validity,
};

use super::CertificateAuthority;
use crate::{
    CertificatePair,
    ca::{DEFAULT_CA_VALIDITY, ROOT_CA_SUBJECT},
    keys::CertificateKeypair,
    sign::generate_serial_number,
};

#[derive(Debug, Snafu)]
pub enum CreateCertificateAuthorityError<E>
where
    E: std::error::Error + 'static,
{
    #[snafu(display("failed to compute the validity period of the root"))]
    ComputeValidity { source: x509_cert::der::Error },

    #[snafu(display("failed to parse {subject:?} as distinguished name"))]
    ParseSubject {
        source: x509_cert::der::Error,
        subject: String,
    },

    #[snafu(display("failed to generate the root key pair"))]
    GenerateKeyPair { source: E },

    #[snafu(display("failed to encode the root public key"))]
    EncodeSubjectPublicKeyInfo { source: x509_cert::spki::Error },

    #[snafu(display("failed to generate serial number"))]
    GenerateSerialNumber { source: x509_cert::der::Error },

    #[snafu(display("failed to derive the key identifier of the root"))]
    DeriveKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to self-sign the root certificate"))]
    SelfSign { source: x509_cert::builder::Error },
}

/// Creates a self-signed root, the trust anchor of one label.
///
/// Without a key pair, a fresh one of the algorithm `SKP` is generated. The
/// root carries BasicConstraints (critical, CA, optional path length),
/// KeyUsage limited to certificate and CRL signing, and matching subject and
/// authority key identifiers.
///
/// ```no_run
/// use multiroot_certs::ca::CertificateAuthority;
///
/// let root = CertificateAuthority::builder_with_rsa()
///     .subject("CN=Example Root CA,O=Example")
///     .max_path_len(1)
///     .build()
///     .expect("failed to create root");
/// ```
#[derive(Builder)]
#[builder(start_fn = start_builder, finish_fn = finish_builder)]
pub struct CertificateAuthorityBuilder<'a, SKP>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    /// Distinguished name in RFC 4514 form, [`ROOT_CA_SUBJECT`] if unset.
    #[builder(default = ROOT_CA_SUBJECT)]
    subject: &'a str,

    #[builder(default = DEFAULT_CA_VALIDITY)]
    validity: Duration,

    /// Limits how many intermediates may follow the root. Unlimited if unset.
    max_path_len: Option<u8>,

    signing_key_pair: Option<SKP>,
}

impl<SKP, S> CertificateAuthorityBuilderBuilder<'_, SKP, S>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
    S: certificate_authority_builder_builder::IsComplete,
{
    /// Shorthand for `finish_builder().build()`.
    pub fn build(
        self,
    ) -> Result<CertificateAuthority<SKP>, CreateCertificateAuthorityError<SKP::Error>> {
        self.finish_builder().build()
    }
}

impl<SKP> CertificateAuthorityBuilder<'_, SKP>
where
    SKP: CertificateKeypair,
    <SKP::SigningKey as signature::Keypair>::VerifyingKey: EncodePublicKey,
{
    #[instrument(
        name = "create_root_certificate_authority",
        skip(self),
        fields(subject = self.subject, algorithm = SKP::algorithm_name()),
    )]
    pub fn build(
        self,
    ) -> Result<CertificateAuthority<SKP>, CreateCertificateAuthorityError<SKP::Error>> {
        let subject: Name = self.subject.parse().context(ParseSubjectSnafu {
            subject: self.subject,
        })?;
        let validity = Validity::from_now(*self.validity).context(ComputeValiditySnafu)?;

        let key_pair = match self.signing_key_pair {
            Some(key_pair) => key_pair,
            None => SKP::new().context(GenerateKeyPairSnafu)?,
        };
        let spki = SubjectPublicKeyInfoOwned::from_key(key_pair.verifying_key())
            .context(EncodeSubjectPublicKeyInfoSnafu)?;

        // Both identifiers are the SHA-1 of the root's own public key, so
        // certificates issued by this root can point back at it.
        let subject_key_identifier = SubjectKeyIdentifier::try_from(spki.owned_to_ref())
            .context(DeriveKeyIdentifierSnafu)?;
        let authority_key_identifier = AuthorityKeyIdentifier::try_from(spki.owned_to_ref())
            .context(DeriveKeyIdentifierSnafu)?;

        let serial_number = generate_serial_number().context(GenerateSerialNumberSnafu)?;
        debug!(
            ca.serial = %serial_number,
            ca.not_before = %validity.not_before,
            ca.not_after = %validity.not_after,
            ca.max_path_len = ?self.max_path_len,
            ca.public_key.size = key_pair.key_size(),
            "self-signing root certificate"
        );

        let mut builder = CertificateBuilder::new(
            Profile::Manual { issuer: None },
            serial_number,
            validity,
            subject,
            spki,
            key_pair.signing_key(),
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&BasicConstraints {
                ca: true,
                path_len_constraint: self.max_path_len,
            })
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&KeyUsage(KeyUsages::KeyCertSign | KeyUsages::CRLSign))
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&subject_key_identifier)
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&authority_key_identifier)
            .context(AddCertificateExtensionSnafu)?;

        let certificate = builder
            .build::<SKP::Signature>()
            .context(SelfSignSnafu)?;

        Ok(CertificateAuthority {
            certificate_pair: CertificatePair::new(certificate, key_pair),
        })
    }
}

#[cfg(test)]
mod tests {
    use x509_cert::{certificate::TbsCertificateInner, der::Decode};

    use super::*;
    use crate::{
        keys::{IssuerKey, ecdsa, rsa},
        sign::{KeyFamily, verify::verify_signed_by},
    };

    fn basic_constraints(certificate: &TbsCertificateInner) -> BasicConstraints {
        let extension = certificate
            .extensions
            .iter()
            .flatten()
            .find(|extension| {
                extension.extn_id == const_oid::db::rfc5280::ID_CE_BASIC_CONSTRAINTS
            })
            .expect("root must carry BasicConstraints");

        assert!(extension.critical);
        BasicConstraints::from_der(extension.extn_value.as_bytes()).unwrap()
    }

    fn lifetime(certificate: &TbsCertificateInner) -> std::time::Duration {
        let not_before = certificate.validity.not_before.to_system_time();
        let not_after = certificate.validity.not_after.to_system_time();
        not_after.duration_since(not_before).unwrap()
    }

    #[test]
    fn default_root() {
        let ca = CertificateAuthority::builder_with_ecdsa().build().unwrap();
        let tbs = &ca.ca_cert().tbs_certificate;

        assert_eq!(tbs.subject, ROOT_CA_SUBJECT.parse().unwrap());
        assert_eq!(lifetime(tbs), *DEFAULT_CA_VALIDITY);

        let constraints = basic_constraints(tbs);
        assert!(constraints.ca);
        assert_eq!(constraints.path_len_constraint, None);
    }

    #[test]
    fn customized_root() {
        let ca = CertificateAuthority::builder()
            .subject("CN=Test")
            .signing_key_pair(rsa::SigningKey::new().unwrap())
            .validity(Duration::from_days_unchecked(13))
            .max_path_len(0)
            .build()
            .unwrap();
        let tbs = &ca.ca_cert().tbs_certificate;

        assert_eq!(tbs.subject, "CN=Test".parse().unwrap());
        assert_eq!(lifetime(tbs), *Duration::from_days_unchecked(13));
        assert_eq!(basic_constraints(tbs).path_len_constraint, Some(0));
    }

    #[test]
    fn root_is_self_signed() {
        let ca = CertificateAuthority::builder_with_ecdsa()
            .subject("CN=Self Signed,O=Example")
            .build()
            .unwrap();

        assert_eq!(ca.issuer_name(), &ca.ca_cert().tbs_certificate.issuer);
        verify_signed_by(ca.ca_cert(), ca.ca_cert()).unwrap();
    }

    #[test]
    fn invalid_subject() {
        let result = CertificateAuthority::builder_with_ecdsa()
            .subject("not a distinguished name")
            .build();

        assert!(matches!(
            result,
            Err(CreateCertificateAuthorityError::ParseSubject { .. })
        ));
    }

    #[test]
    fn root_key_loads_as_issuer_key() {
        let ca = CertificateAuthority::builder_with_ecdsa().build().unwrap();

        let key_pem = ca.certificate_pair().private_key_pem().unwrap();
        let key = IssuerKey::from_pem(&key_pem).unwrap();
        assert_eq!(key.family(), KeyFamily::Ecdsa);
        assert_eq!(
            key.subject_public_key_info().unwrap(),
            ca.ca_cert().tbs_certificate.subject_public_key_info
        );

        let certificate_pem = ca.certificate_pair().certificate_pem().unwrap();
        assert!(certificate_pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn root_key_reloads_as_key_pair() {
        let ca = CertificateAuthority::builder_with_ecdsa().build().unwrap();
        let key_pem = ca.certificate_pair().private_key_pem().unwrap();

        let key_pair = ecdsa::SigningKey::from_pkcs8_pem(&key_pem).unwrap();
        assert_eq!(key_pair.verifying_key(), ca.certificate_pair().key_pair().verifying_key());
    }
}
