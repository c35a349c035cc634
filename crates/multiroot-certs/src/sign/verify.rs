//! Signature verification of certificates and certificate signing requests.
use rsa::{Pkcs1v15Sign, RsaPublicKey, pkcs8::DecodePublicKey};
use signature::hazmat::PrehashVerifier;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use x509_cert::{
    Certificate,
    der::Encode,
    name::Name,
    request::CertReq,
    spki::SubjectPublicKeyInfoOwned,
};

use crate::sign::{AlgorithmError, EcdsaCurve, KeyFamily, SignatureAlgorithm};

pub type Result<T, E = VerifyError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum VerifyError {
    #[snafu(display("unsupported algorithm"))]
    Algorithm { source: AlgorithmError },

    #[snafu(display(
        "signature algorithm {algorithm} does not match the {family} public key"
    ))]
    FamilyMismatch {
        algorithm: SignatureAlgorithm,
        family: KeyFamily,
    },

    #[snafu(display("failed to encode the public key as DER"))]
    EncodePublicKey { source: x509_cert::der::Error },

    #[snafu(display("failed to decode the RSA public key"))]
    DecodeRsaPublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to decode the ECDSA {curve} public key"))]
    DecodeEcdsaPublicKey {
        source: x509_cert::spki::Error,
        curve: EcdsaCurve,
    },

    #[snafu(display("the ECDSA {curve} public key is the identity point"))]
    InvalidEcdsaPublicKey {
        source: signature::Error,
        curve: EcdsaCurve,
    },

    #[snafu(display("failed to encode the signed content as DER"))]
    EncodeSignedContent { source: x509_cert::der::Error },

    #[snafu(display("signature bit string is not octet aligned"))]
    UnalignedSignature,

    #[snafu(display("RSA signature does not verify"))]
    RsaSignature { source: rsa::Error },

    #[snafu(display("ECDSA signature does not verify"))]
    EcdsaSignature { source: signature::Error },

    #[snafu(display("certificate issuer {issuer} does not match the issuer subject {subject}"))]
    IssuerMismatch { issuer: Name, subject: Name },
}

/// Verifies that `signature` over `message` was produced with `algorithm` by
/// the private half of `spki`.
pub fn verify_signature(
    spki: &SubjectPublicKeyInfoOwned,
    algorithm: SignatureAlgorithm,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let family = KeyFamily::of_public_key(spki).context(AlgorithmSnafu)?;
    ensure!(
        algorithm.family() == family,
        FamilyMismatchSnafu { algorithm, family }
    );

    let spki_der = spki.to_der().context(EncodePublicKeySnafu)?;
    let digest = algorithm.digest(message);

    match family {
        KeyFamily::Rsa => {
            let public_key =
                RsaPublicKey::from_public_key_der(&spki_der).context(DecodeRsaPublicKeySnafu)?;
            let scheme = match algorithm {
                SignatureAlgorithm::Sha384WithRsa => Pkcs1v15Sign::new::<sha2::Sha384>(),
                SignatureAlgorithm::Sha512WithRsa => Pkcs1v15Sign::new::<sha2::Sha512>(),
                _ => Pkcs1v15Sign::new::<sha2::Sha256>(),
            };

            public_key
                .verify(scheme, &digest, signature)
                .context(RsaSignatureSnafu)
        }
        KeyFamily::Ecdsa => verify_ecdsa(spki, &spki_der, &digest, signature),
    }
}

fn verify_ecdsa(
    spki: &SubjectPublicKeyInfoOwned,
    spki_der: &[u8],
    digest: &[u8],
    signature: &[u8],
) -> Result<()> {
    let curve = EcdsaCurve::of_public_key(spki).context(AlgorithmSnafu)?;
    let digest = &curve.widen_prehash(digest.to_vec());

    match curve {
        EcdsaCurve::P256 => {
            let public_key = p256::ecdsa::VerifyingKey::from_public_key_der(spki_der)
                .context(DecodeEcdsaPublicKeySnafu { curve })?;
            let signature =
                p256::ecdsa::Signature::from_der(signature).context(EcdsaSignatureSnafu)?;
            public_key.verify_prehash(digest, &signature)
        }
        EcdsaCurve::P384 => {
            let public_key = p384::ecdsa::VerifyingKey::from_public_key_der(spki_der)
                .context(DecodeEcdsaPublicKeySnafu { curve })?;
            let signature =
                p384::ecdsa::Signature::from_der(signature).context(EcdsaSignatureSnafu)?;
            public_key.verify_prehash(digest, &signature)
        }
        EcdsaCurve::P521 => {
            let public_key = p521::PublicKey::from_public_key_der(spki_der)
                .context(DecodeEcdsaPublicKeySnafu { curve })?;
            let public_key = p521::ecdsa::VerifyingKey::from_affine(*public_key.as_affine())
                .context(InvalidEcdsaPublicKeySnafu { curve })?;
            let signature =
                p521::ecdsa::Signature::from_der(signature).context(EcdsaSignatureSnafu)?;
            public_key.verify_prehash(digest, &signature)
        }
    }
    .context(EcdsaSignatureSnafu)
}

/// Verifies that `certificate` names `issuer` as its issuer and carries a
/// valid signature of the issuer's key.
pub fn verify_signed_by(certificate: &Certificate, issuer: &Certificate) -> Result<()> {
    let issuer_subject = &issuer.tbs_certificate.subject;
    ensure!(
        certificate.tbs_certificate.issuer == *issuer_subject,
        IssuerMismatchSnafu {
            issuer: certificate.tbs_certificate.issuer.clone(),
            subject: issuer_subject.clone(),
        }
    );

    let algorithm =
        SignatureAlgorithm::try_from(&certificate.signature_algorithm).context(AlgorithmSnafu)?;
    let tbs = certificate
        .tbs_certificate
        .to_der()
        .context(EncodeSignedContentSnafu)?;
    let signature = certificate
        .signature
        .as_bytes()
        .context(UnalignedSignatureSnafu)?;

    verify_signature(
        &issuer.tbs_certificate.subject_public_key_info,
        algorithm,
        &tbs,
        signature,
    )
}

/// Verifies the self-signature of a certificate signing request, which proves
/// possession of the private key belonging to the requested public key.
pub fn verify_certificate_request(request: &CertReq) -> Result<()> {
    let algorithm = SignatureAlgorithm::try_from(&request.algorithm).context(AlgorithmSnafu)?;
    let info = request.info.to_der().context(EncodeSignedContentSnafu)?;
    let signature = request
        .signature
        .as_bytes()
        .context(UnalignedSignatureSnafu)?;

    verify_signature(&request.info.public_key, algorithm, &info, signature)
}
