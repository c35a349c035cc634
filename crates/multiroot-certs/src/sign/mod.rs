//! The signing engine turns certificate signing requests (CSRs) into issued
//! certificates.
//!
//! A [`SigningEngine`] owns exactly one CA identity (certificate and private
//! key) and one [`Policy`]. It has no notion of being a root: any certificate
//! with a matching private key works, so a CA certificate issued by one engine
//! can back the next engine down the chain.
//!
//! ```no_run
//! use multiroot_certs::{
//!     ca::CertificateAuthority,
//!     policy::{Policy, SigningProfile},
//!     sign::SigningEngine,
//! };
//! use multiroot_shared::time::Duration;
//!
//! let ca = CertificateAuthority::builder_with_ecdsa().build().unwrap();
//! let policy = Policy::new(SigningProfile::new(
//!     ["digital signature", "server auth"],
//!     Duration::from_hours_unchecked(24),
//! ));
//!
//! let engine = SigningEngine::from_certificate_authority(ca, policy).unwrap();
//! # let csr_pem = b"";
//! let issued = engine.sign(csr_pem, &engine.policy().default, None).unwrap();
//! println!("{}", issued.as_pem());
//! ```
use std::{
    fmt::Display,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use bon::Builder;
use const_oid::db::rfc5280::ID_CE_SUBJECT_KEY_IDENTIFIER;
use signature::Keypair;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, info, instrument};
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::{
        Decode, DecodePem, Encode, EncodePem, asn1::BitString, pem::LineEnding,
        referenced::OwnedToRef,
    },
    ext::pkix::{
        AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAltName,
        SubjectKeyIdentifier,
    },
    name::Name,
    request::CertReq,
    serial_number::SerialNumber,
    spki::{AlgorithmIdentifierOwned, DynSignatureAlgorithmIdentifier, SubjectPublicKeyInfoOwned},
    time::{Time, Validity},
};

use crate::{
    ca::CertificateAuthority,
    keys::{CertificateKeypair, IssuerKey, IssuerKeyError, IssuerPublicKey},
    policy::{Policy, PolicyError, SigningProfile, UsageBits},
};

mod algorithm;
pub mod subject;
pub mod verify;

pub use algorithm::*;
pub use subject::{NameEntry, SubjectName, SubjectOverride};

/// The PEM line ending used for issued certificates.
pub const PEM_LINE_ENDING: LineEnding = LineEnding::LF;

/// The profile name used in errors when a profile is passed to
/// [`SigningEngine::sign`] directly.
const DIRECT_PROFILE_NAME: &str = "direct";

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classifies signing failures by who is at fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignErrorKind {
    /// The CSR, the subject override or the profile is unusable.
    BadRequest,

    /// The cryptographic operation or the certificate assembly failed.
    Signing,

    /// The engine produced a certificate it can't parse or verify itself.
    InvalidCertificate,

    /// An invariant of the engine itself is broken.
    Internal,
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("empty request"))]
    EmptyRequest,

    #[snafu(display("failed to parse certificate signing request"))]
    ParseRequest { source: x509_cert::der::Error },

    #[snafu(display("failed to verify the signature of the certificate signing request"))]
    VerifyRequestSignature { source: verify::VerifyError },

    #[snafu(display("invalid signing profile"))]
    InvalidProfile { source: PolicyError },

    #[snafu(display("invalid subject override"))]
    InvalidSubject { source: subject::SubjectError },

    #[snafu(display("the certificate would have neither a subject nor subject alternative names"))]
    EmptySubject,

    #[snafu(display("failed to read the current time"))]
    ReadClock { source: std::time::SystemTimeError },

    #[snafu(display("validity period is out of range"))]
    ValidityOutOfRange,

    #[snafu(display("failed to convert validity period into X.509 time"))]
    ConvertValidity { source: x509_cert::der::Error },

    #[snafu(display(
        "certificate would expire at {not_after:?}, after the issuer which expires at {issuer_not_after:?}"
    ))]
    CertOutlivesIssuer {
        not_after: SystemTime,
        issuer_not_after: SystemTime,
    },

    #[snafu(display(
        "signature algorithm {algorithm} cannot be used with the {family} issuer key"
    ))]
    IncompatibleSignatureAlgorithm {
        algorithm: SignatureAlgorithm,
        family: KeyFamily,
    },

    #[snafu(display("failed to generate serial number"))]
    GenerateSerialNumber { source: x509_cert::der::Error },

    #[snafu(display("failed to create subject key identifier"))]
    CreateSubjectKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display("failed to create certificate builder"))]
    CreateCertificateBuilder { source: x509_cert::builder::Error },

    #[snafu(display("failed to add certificate extension"))]
    AddCertificateExtension { source: x509_cert::builder::Error },

    #[snafu(display("failed to encode the certificate to be signed"))]
    EncodeTbsCertificate { source: x509_cert::der::Error },

    #[snafu(display("the signing lock was poisoned by a previous panic"))]
    PoisonedSignLock,

    #[snafu(display("failed to sign certificate"))]
    SignCertificate { source: IssuerKeyError },

    #[snafu(display("failed to encode signature"))]
    EncodeSignature { source: x509_cert::der::Error },

    #[snafu(display("failed to assemble certificate"))]
    AssembleCertificate { source: x509_cert::builder::Error },

    #[snafu(display("failed to serialize certificate as PEM"))]
    SerializeCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to parse the issued certificate"))]
    ParseIssuedCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to verify the issued certificate against the issuer"))]
    VerifyIssuedCertificate { source: verify::VerifyError },
}

impl Error {
    pub fn kind(&self) -> SignErrorKind {
        match self {
            Error::EmptyRequest
            | Error::ParseRequest { .. }
            | Error::VerifyRequestSignature { .. }
            | Error::InvalidProfile { .. }
            | Error::InvalidSubject { .. }
            | Error::EmptySubject
            | Error::ValidityOutOfRange
            | Error::CertOutlivesIssuer { .. }
            | Error::CreateSubjectKeyIdentifier { .. } => SignErrorKind::BadRequest,

            Error::IncompatibleSignatureAlgorithm { .. }
            | Error::ConvertValidity { .. }
            | Error::GenerateSerialNumber { .. }
            | Error::CreateCertificateBuilder { .. }
            | Error::AddCertificateExtension { .. }
            | Error::EncodeTbsCertificate { .. }
            | Error::SignCertificate { .. }
            | Error::EncodeSignature { .. }
            | Error::AssembleCertificate { .. }
            | Error::SerializeCertificate { .. } => SignErrorKind::Signing,

            Error::ParseIssuedCertificate { .. } | Error::VerifyIssuedCertificate { .. } => {
                SignErrorKind::InvalidCertificate
            }

            Error::ReadClock { .. } | Error::PoisonedSignLock => SignErrorKind::Internal,
        }
    }
}

/// Errors which can occur when constructing a [`SigningEngine`].
#[derive(Debug, Snafu)]
pub enum CreateEngineError {
    #[snafu(display("the signing policy is invalid"))]
    InvalidPolicy { source: PolicyError },

    #[snafu(display("no certificate found in PEM input"))]
    NoCertificate,

    #[snafu(display("failed to parse the issuer certificate"))]
    ParseCertificate { source: x509_cert::der::Error },

    #[snafu(display("failed to load the issuer private key"))]
    LoadKey { source: IssuerKeyError },

    #[snafu(display("failed to encode the public key"))]
    EncodePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to encode the certificate public key"))]
    EncodeCertificatePublicKey { source: x509_cert::der::Error },

    #[snafu(display("the private key does not belong to the issuer certificate"))]
    KeyMismatch,

    #[snafu(display(
        "default signature algorithm {algorithm} cannot be used with the {family} issuer key"
    ))]
    IncompatibleDefaultAlgorithm {
        algorithm: SignatureAlgorithm,
        family: KeyFamily,
    },

    #[snafu(display(
        "signature algorithm {algorithm} of profile {profile:?} cannot be used with the {family} issuer key"
    ))]
    IncompatibleProfileAlgorithm {
        algorithm: SignatureAlgorithm,
        family: KeyFamily,
        profile: String,
    },

    #[snafu(display("failed to decode the subject key identifier of the issuer"))]
    DecodeIssuerKeyIdentifier { source: x509_cert::der::Error },

    #[snafu(display("failed to create the authority key identifier"))]
    CreateAuthorityKeyIdentifier { source: x509_cert::der::Error },
}

/// A certificate issued by a [`SigningEngine`], PEM-encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedCertificate(String);

impl IssuedCertificate {
    pub fn as_pem(&self) -> &str {
        &self.0
    }

    pub fn into_pem(self) -> String {
        self.0
    }

    /// Decodes the PEM-encoded certificate.
    pub fn parse(&self) -> Result<Certificate, x509_cert::der::Error> {
        Certificate::from_pem(self.0.as_bytes())
    }
}

impl Display for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Issues certificates for one CA identity according to one [`Policy`].
///
/// Use [`SigningEngine::builder`], [`SigningEngine::from_pem`] or
/// [`SigningEngine::from_certificate_authority`] to construct an engine.
#[derive(Debug)]
pub struct SigningEngine {
    certificate: Certificate,
    key: IssuerKey,
    policy: Policy,
    default_signature_algorithm: SignatureAlgorithm,
    authority_key_identifier: AuthorityKeyIdentifier,
    sign_lock: Option<Mutex<()>>,
}

/// Builds a [`SigningEngine`]. All checks (policy validation, key and
/// certificate match, signature algorithm compatibility) run in
/// [`SigningEngineBuilder::build`].
#[derive(Builder)]
#[builder(start_fn = start_builder, finish_fn = finish_builder)]
pub struct SigningEngineBuilder {
    /// The certificate of the CA identity. It doesn't need to be self-signed.
    certificate: Certificate,

    /// The private key matching the public key of `certificate`.
    key: IssuerKey,

    policy: Policy,

    /// The signature algorithm used when a profile doesn't override it.
    ///
    /// If not specified, the default of the key is used, see
    /// [`IssuerKey::default_signature_algorithm`].
    default_signature_algorithm: Option<SignatureAlgorithm>,

    /// Serializes all private key operations of this engine. Only needed for
    /// key stores which can't be used concurrently.
    #[builder(default)]
    serialize_signing: bool,
}

impl<S> SigningEngineBuilderBuilder<S>
where
    S: signing_engine_builder_builder::IsComplete,
{
    /// Convenience function to avoid calling `builder().finish_builder().build()`
    pub fn build(self) -> Result<SigningEngine, CreateEngineError> {
        self.finish_builder().build()
    }
}

impl SigningEngineBuilder {
    #[instrument(
        name = "build_signing_engine",
        skip(self),
        fields(issuer = %self.certificate.tbs_certificate.subject),
    )]
    pub fn build(self) -> Result<SigningEngine, CreateEngineError> {
        self.policy.validate().context(InvalidPolicySnafu)?;

        let key_spki = self
            .key
            .subject_public_key_info()
            .context(EncodePublicKeySnafu)?;
        let certificate_spki = &self.certificate.tbs_certificate.subject_public_key_info;
        ensure!(
            spki_der(&key_spki)? == spki_der(certificate_spki)?,
            KeyMismatchSnafu
        );

        let family = self.key.family();
        let default_signature_algorithm = self
            .default_signature_algorithm
            .unwrap_or_else(|| self.key.default_signature_algorithm());
        ensure!(
            default_signature_algorithm.family() == family,
            IncompatibleDefaultAlgorithmSnafu {
                algorithm: default_signature_algorithm,
                family
            }
        );

        for (name, profile) in self.policy.iter() {
            if let Some(algorithm) = profile.signature_algorithm {
                ensure!(
                    algorithm.family() == family,
                    IncompatibleProfileAlgorithmSnafu {
                        algorithm,
                        family,
                        profile: name
                    }
                );
            }
        }

        let authority_key_identifier = authority_key_identifier(&self.certificate)?;

        debug!(
            issuer.key_family = %family,
            issuer.curve = ?self.key.curve(),
            issuer.default_signature_algorithm = %default_signature_algorithm,
            serialize_signing = self.serialize_signing,
            "created signing engine"
        );

        Ok(SigningEngine {
            certificate: self.certificate,
            key: self.key,
            policy: self.policy,
            default_signature_algorithm,
            authority_key_identifier,
            sign_lock: self.serialize_signing.then(|| Mutex::new(())),
        })
    }
}

fn spki_der(spki: &SubjectPublicKeyInfoOwned) -> Result<Vec<u8>, CreateEngineError> {
    spki.to_der().context(EncodeCertificatePublicKeySnafu)
}

/// Prefers the subject key identifier of the issuer certificate so that the
/// identifiers line up even if the issuer was created by other tooling.
fn authority_key_identifier(
    certificate: &Certificate,
) -> Result<AuthorityKeyIdentifier, CreateEngineError> {
    let subject_key_identifier = certificate
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|extension| extension.extn_id == ID_CE_SUBJECT_KEY_IDENTIFIER);

    match subject_key_identifier {
        Some(extension) => {
            let ski = SubjectKeyIdentifier::from_der(extension.extn_value.as_bytes())
                .context(DecodeIssuerKeyIdentifierSnafu)?;

            Ok(AuthorityKeyIdentifier {
                key_identifier: Some(ski.0),
                authority_cert_issuer: None,
                authority_cert_serial_number: None,
            })
        }
        None => AuthorityKeyIdentifier::try_from(
            certificate
                .tbs_certificate
                .subject_public_key_info
                .owned_to_ref(),
        )
        .context(CreateAuthorityKeyIdentifierSnafu),
    }
}

impl SigningEngine {
    pub fn builder() -> SigningEngineBuilderBuilder {
        SigningEngineBuilder::start_builder()
    }

    /// Creates an engine from a PEM-encoded certificate and private key. Only
    /// the first certificate of `certificate_pem` is used.
    #[instrument(name = "create_signing_engine_from_pem", skip_all)]
    pub fn from_pem(
        certificate_pem: &str,
        key_pem: &str,
        policy: Policy,
        default_signature_algorithm: Option<SignatureAlgorithm>,
    ) -> Result<Self, CreateEngineError> {
        let certificate = Certificate::load_pem_chain(certificate_pem.as_bytes())
            .context(ParseCertificateSnafu)?
            .into_iter()
            .next()
            .context(NoCertificateSnafu)?;
        let key = IssuerKey::from_pem(key_pem).context(LoadKeySnafu)?;

        Self::builder()
            .certificate(certificate)
            .key(key)
            .policy(policy)
            .maybe_default_signature_algorithm(default_signature_algorithm)
            .build()
    }

    /// Creates an engine backed by a [`CertificateAuthority`].
    pub fn from_certificate_authority<SK>(
        ca: CertificateAuthority<SK>,
        policy: Policy,
    ) -> Result<Self, CreateEngineError>
    where
        SK: CertificateKeypair + Into<IssuerKey>,
        <SK::SigningKey as Keypair>::VerifyingKey: x509_cert::spki::EncodePublicKey,
    {
        let (certificate, key_pair) = ca.into_certificate_pair().into_parts();

        Self::builder()
            .certificate(certificate)
            .key(key_pair.into())
            .policy(policy)
            .build()
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn subject(&self) -> &Name {
        &self.certificate.tbs_certificate.subject
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn key_family(&self) -> KeyFamily {
        self.key.family()
    }

    pub fn default_signature_algorithm(&self) -> SignatureAlgorithm {
        self.default_signature_algorithm
    }

    /// Signs the PEM-encoded CSR according to `profile`.
    ///
    /// The profile doesn't need to be part of the engine's policy, which
    /// allows direct callers to issue certificates with ad-hoc profiles.
    /// No authentication happens here, that is the job of the caller.
    #[instrument(
        name = "sign_certificate_request",
        skip_all,
        fields(issuer = %self.subject()),
    )]
    pub fn sign(
        &self,
        csr_pem: &[u8],
        profile: &SigningProfile,
        subject_override: Option<&SubjectOverride>,
    ) -> Result<IssuedCertificate> {
        ensure!(!csr_pem.trim_ascii().is_empty(), EmptyRequestSnafu);

        let request = CertReq::from_pem(csr_pem).context(ParseRequestSnafu)?;
        verify::verify_certificate_request(&request).context(VerifyRequestSignatureSnafu)?;

        profile
            .validate(DIRECT_PROFILE_NAME)
            .context(InvalidProfileSnafu)?;
        let usages: UsageBits = profile
            .parse_usages(DIRECT_PROFILE_NAME)
            .context(InvalidProfileSnafu)?
            .into_iter()
            .collect();

        let subject = match subject_override.and_then(|o| o.name.as_ref()) {
            Some(name) => name.to_name().context(InvalidSubjectSnafu)?,
            None => request.info.subject.clone(),
        };
        let alt_names = match subject_override.and_then(|o| o.hosts.as_deref()) {
            Some(hosts) => subject::hosts_to_general_names(hosts).context(InvalidSubjectSnafu)?,
            None => subject::requested_alt_names(&request).context(InvalidSubjectSnafu)?,
        };
        ensure!(
            !subject.0.is_empty() || !alt_names.is_empty(),
            EmptySubjectSnafu
        );

        let algorithm = profile
            .signature_algorithm
            .unwrap_or(self.default_signature_algorithm);
        ensure!(
            algorithm.family() == self.key.family(),
            IncompatibleSignatureAlgorithmSnafu {
                algorithm,
                family: self.key.family()
            }
        );

        let validity = self.validity(profile)?;
        let serial_number = generate_serial_number().context(GenerateSerialNumberSnafu)?;

        let subject_key_identifier =
            SubjectKeyIdentifier::try_from(request.info.public_key.owned_to_ref())
                .context(CreateSubjectKeyIdentifierSnafu)?;

        debug!(
            certificate.subject = %subject,
            certificate.serial = %serial_number,
            certificate.not_before = %validity.not_before,
            certificate.not_after = %validity.not_after,
            certificate.signature_algorithm = %algorithm,
            certificate.is_ca = profile.is_ca(),
            "assembling certificate"
        );

        let signer = AlgorithmBoundKey {
            key: &self.key,
            algorithm,
        };
        let mut builder = CertificateBuilder::new(
            Profile::Manual {
                issuer: Some(self.subject().clone()),
            },
            serial_number.clone(),
            validity,
            subject,
            request.info.public_key.clone(),
            &signer,
        )
        .context(CreateCertificateBuilderSnafu)?;

        builder
            .add_extension(&BasicConstraints {
                ca: profile.is_ca(),
                path_len_constraint: profile
                    .ca_constraint
                    .max_path_len
                    .filter(|_| profile.is_ca()),
            })
            .context(AddCertificateExtensionSnafu)?;

        if let Some((first, rest)) = usages.key_usages.split_first() {
            let mut key_usage = KeyUsage((*first).into());
            for usage in rest {
                key_usage.0 |= *usage;
            }

            builder
                .add_extension(&key_usage)
                .context(AddCertificateExtensionSnafu)?;
        }

        if !usages.extended_key_usages.is_empty() {
            builder
                .add_extension(&ExtendedKeyUsage(usages.extended_key_usages))
                .context(AddCertificateExtensionSnafu)?;
        }

        builder
            .add_extension(&subject_key_identifier)
            .context(AddCertificateExtensionSnafu)?;
        builder
            .add_extension(&self.authority_key_identifier)
            .context(AddCertificateExtensionSnafu)?;

        if !alt_names.is_empty() {
            builder
                .add_extension(&SubjectAltName(alt_names))
                .context(AddCertificateExtensionSnafu)?;
        }

        let tbs_certificate = builder.finalize().context(EncodeTbsCertificateSnafu)?;
        let signature = self.sign_raw(algorithm, &tbs_certificate)?;
        let signature = BitString::from_bytes(&signature).context(EncodeSignatureSnafu)?;
        let certificate = builder
            .assemble(signature)
            .context(AssembleCertificateSnafu)?;

        let pem = certificate
            .to_pem(PEM_LINE_ENDING)
            .context(SerializeCertificateSnafu)?;

        // Never hand out something we can't read back ourselves.
        let issued = Certificate::from_pem(pem.as_bytes()).context(ParseIssuedCertificateSnafu)?;
        verify::verify_signed_by(&issued, &self.certificate)
            .context(VerifyIssuedCertificateSnafu)?;

        info!(
            certificate.subject = %issued.tbs_certificate.subject,
            certificate.serial = %serial_number,
            "issued certificate"
        );

        Ok(IssuedCertificate(pem))
    }

    fn sign_raw(&self, algorithm: SignatureAlgorithm, message: &[u8]) -> Result<Vec<u8>> {
        let _guard = match &self.sign_lock {
            Some(lock) => Some(lock.lock().map_err(|_| PoisonedSignLockSnafu.build())?),
            None => None,
        };

        self.key
            .sign(algorithm, message)
            .context(SignCertificateSnafu)
    }

    /// NotBefore is the current time (truncated to seconds) minus the
    /// profile's backdate, NotAfter is NotBefore plus the profile's expiry.
    fn validity(&self, profile: &SigningProfile) -> Result<Validity> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context(ReadClockSnafu)?;
        let now = UNIX_EPOCH + std::time::Duration::from_secs(now.as_secs());

        let not_before = now
            .checked_sub(*profile.backdate)
            .context(ValidityOutOfRangeSnafu)?;
        let not_after = not_before
            .checked_add(*profile.expiry)
            .context(ValidityOutOfRangeSnafu)?;

        let issuer_not_after = self
            .certificate
            .tbs_certificate
            .validity
            .not_after
            .to_system_time();
        ensure!(
            not_after <= issuer_not_after,
            CertOutlivesIssuerSnafu {
                not_after,
                issuer_not_after
            }
        );

        Ok(Validity {
            not_before: Time::try_from(not_before).context(ConvertValiditySnafu)?,
            not_after: Time::try_from(not_after).context(ConvertValiditySnafu)?,
        })
    }
}

/// Generates a random, positive serial number of 20 octets as permitted by
/// RFC 5280, section 4.1.2.2.
pub(crate) fn generate_serial_number() -> Result<SerialNumber, x509_cert::der::Error> {
    let mut serial = rand::random::<[u8; 20]>();
    serial[0] &= 0x7f;

    SerialNumber::new(&serial)
}

/// Binds an [`IssuerKey`] to the signature algorithm selected for one
/// certificate, which is what [`CertificateBuilder`] needs to fill in the
/// signature algorithm and issuer fields.
struct AlgorithmBoundKey<'a> {
    key: &'a IssuerKey,
    algorithm: SignatureAlgorithm,
}

impl Keypair for AlgorithmBoundKey<'_> {
    type VerifyingKey = IssuerPublicKey;

    fn verifying_key(&self) -> Self::VerifyingKey {
        self.key.public_key()
    }
}

impl DynSignatureAlgorithmIdentifier for AlgorithmBoundKey<'_> {
    fn signature_algorithm_identifier(&self) -> x509_cert::spki::Result<AlgorithmIdentifierOwned> {
        Ok(self.algorithm.algorithm_identifier())
    }
}
