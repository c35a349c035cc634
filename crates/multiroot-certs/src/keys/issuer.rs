use rand_core::OsRng;
use rsa::{
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey},
};
use signature::hazmat::PrehashSigner;
use snafu::{ResultExt, Snafu};
use tracing::instrument;
use x509_cert::{
    der::{Document, pem::LineEnding},
    spki::{EncodePublicKey, SubjectPublicKeyInfoOwned},
};
use zeroize::Zeroizing;

use crate::{
    keys::{CertificateKeypair, ecdsa, rsa as rsa_keys},
    sign::{EcdsaCurve, KeyFamily, SignatureAlgorithm},
};

const PKCS8_LABEL: &str = "PRIVATE KEY";
const PKCS1_LABEL: &str = "RSA PRIVATE KEY";
const SEC1_LABEL: &str = "EC PRIVATE KEY";

#[derive(Debug, Snafu)]
pub enum IssuerKeyError {
    #[snafu(display("failed to read the PEM label of the private key"))]
    ReadPemLabel { source: x509_cert::der::pem::Error },

    #[snafu(display("unsupported private key PEM label {label:?}"))]
    UnsupportedPemLabel { label: String },

    #[snafu(display("failed to deserialize RSA private key from PKCS1 PEM"))]
    DeserializePkcs1 { source: rsa::pkcs1::Error },

    #[snafu(display("failed to deserialize EC private key on P-256, P-384 or P-521 from SEC1 PEM"))]
    DeserializeSec1 { source: p256::elliptic_curve::Error },

    #[snafu(display(
        "failed to deserialize PKCS8 private key as either RSA ({rsa_error}) or ECDSA on P-256, P-384 or P-521"
    ))]
    DeserializePkcs8 {
        source: p256::pkcs8::Error,
        rsa_error: rsa::pkcs8::Error,
    },

    #[snafu(display("failed to restore the ECDSA P-521 signing key"))]
    RestoreP521 { source: signature::Error },

    #[snafu(display("failed to serialize private key as PKCS8 PEM"))]
    SerializePkcs8 { source: p256::pkcs8::Error },

    #[snafu(display("failed to sign with RSA key"))]
    SignRsa { source: rsa::Error },

    #[snafu(display("failed to sign with ECDSA key"))]
    SignEcdsa { source: signature::Error },

    #[snafu(display("signature algorithm {algorithm} cannot be used with a {family} key"))]
    AlgorithmFamilyMismatch {
        algorithm: SignatureAlgorithm,
        family: KeyFamily,
    },
}

/// The private key of a signing engine, either RSA or ECDSA on one of the
/// curves of [`EcdsaCurve`].
///
/// Unlike the typed key pairs in [`crate::keys`], the algorithm is only known
/// at runtime, which allows a single engine type to serve CAs of both key
/// families side by side.
#[derive(Clone)]
pub enum IssuerKey {
    Rsa(RsaPrivateKey),
    EcdsaP256(p256::ecdsa::SigningKey),
    EcdsaP384(p384::ecdsa::SigningKey),
    EcdsaP521(p521::ecdsa::SigningKey),
}

// The derived implementation would print key material.
impl std::fmt::Debug for IssuerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IssuerKey")
            .field(&self.family())
            .field(&self.curve())
            .finish()
    }
}

/// The public half of an [`IssuerKey`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssuerPublicKey {
    Rsa(RsaPublicKey),
    EcdsaP256(p256::ecdsa::VerifyingKey),
    EcdsaP384(p384::ecdsa::VerifyingKey),
    EcdsaP521(p521::PublicKey),
}

impl EncodePublicKey for IssuerPublicKey {
    fn to_public_key_der(&self) -> x509_cert::spki::Result<Document> {
        match self {
            Self::Rsa(key) => key.to_public_key_der(),
            Self::EcdsaP256(key) => key.to_public_key_der(),
            Self::EcdsaP384(key) => key.to_public_key_der(),
            Self::EcdsaP521(key) => key.to_public_key_der(),
        }
    }
}

impl IssuerKey {
    /// Loads a private key from PEM. Supported encodings are PKCS#8
    /// (`PRIVATE KEY`), PKCS#1 (`RSA PRIVATE KEY`) and SEC1 (`EC PRIVATE KEY`).
    #[instrument(name = "load_issuer_key_from_pem", skip_all)]
    pub fn from_pem(input: &str) -> Result<Self, IssuerKeyError> {
        let label =
            x509_cert::der::pem::decode_label(input.as_bytes()).context(ReadPemLabelSnafu)?;

        match label {
            PKCS1_LABEL => {
                let key = RsaPrivateKey::from_pkcs1_pem(input).context(DeserializePkcs1Snafu)?;
                Ok(Self::Rsa(key))
            }
            SEC1_LABEL => Self::from_sec1_pem(input),
            PKCS8_LABEL => match RsaPrivateKey::from_pkcs8_pem(input) {
                Ok(key) => Ok(Self::Rsa(key)),
                Err(rsa_error) => Self::from_ecdsa_pkcs8_pem(input, rsa_error),
            },
            label => UnsupportedPemLabelSnafu { label }.fail(),
        }
    }

    // Smaller curves go first. Their scalars are too short to be mistaken
    // for one of a larger curve, the other way round a short scalar would be
    // zero padded.
    fn from_sec1_pem(input: &str) -> Result<Self, IssuerKeyError> {
        if let Ok(secret_key) = p256::SecretKey::from_sec1_pem(input) {
            return Ok(Self::EcdsaP256(secret_key.into()));
        }
        if let Ok(secret_key) = p384::SecretKey::from_sec1_pem(input) {
            return Ok(Self::EcdsaP384(secret_key.into()));
        }

        let secret_key = p521::SecretKey::from_sec1_pem(input).context(DeserializeSec1Snafu)?;
        Self::from_p521_secret_key(&secret_key)
    }

    // PKCS#8 names the curve, so at most one attempt can succeed.
    fn from_ecdsa_pkcs8_pem(
        input: &str,
        rsa_error: rsa::pkcs8::Error,
    ) -> Result<Self, IssuerKeyError> {
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_pem(input) {
            return Ok(Self::EcdsaP256(key));
        }
        if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_pem(input) {
            return Ok(Self::EcdsaP384(key));
        }

        let secret_key = p521::SecretKey::from_pkcs8_pem(input)
            .context(DeserializePkcs8Snafu { rsa_error })?;
        Self::from_p521_secret_key(&secret_key)
    }

    fn from_p521_secret_key(secret_key: &p521::SecretKey) -> Result<Self, IssuerKeyError> {
        let key = p521::ecdsa::SigningKey::from_bytes(&secret_key.to_bytes())
            .context(RestoreP521Snafu)?;
        Ok(Self::EcdsaP521(key))
    }

    /// Serializes the private key as PKCS#8 PEM.
    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>, IssuerKeyError> {
        match self {
            Self::Rsa(key) => key.to_pkcs8_pem(LineEnding::LF),
            Self::EcdsaP256(key) => key.to_pkcs8_pem(LineEnding::LF),
            Self::EcdsaP384(key) => key.to_pkcs8_pem(LineEnding::LF),
            Self::EcdsaP521(key) => {
                p521::SecretKey::from(key.as_nonzero_scalar()).to_pkcs8_pem(LineEnding::LF)
            }
        }
        .context(SerializePkcs8Snafu)
    }

    pub fn family(&self) -> KeyFamily {
        match self {
            Self::Rsa(_) => KeyFamily::Rsa,
            Self::EcdsaP256(_) | Self::EcdsaP384(_) | Self::EcdsaP521(_) => KeyFamily::Ecdsa,
        }
    }

    /// The curve of an ECDSA key, `None` for RSA.
    pub fn curve(&self) -> Option<EcdsaCurve> {
        match self {
            Self::Rsa(_) => None,
            Self::EcdsaP256(_) => Some(EcdsaCurve::P256),
            Self::EcdsaP384(_) => Some(EcdsaCurve::P384),
            Self::EcdsaP521(_) => Some(EcdsaCurve::P521),
        }
    }

    /// The signature algorithm used when nothing else is configured. ECDSA
    /// keys pick the digest matching their curve.
    pub fn default_signature_algorithm(&self) -> SignatureAlgorithm {
        match self.curve() {
            Some(curve) => curve.default_signature_algorithm(),
            None => self.family().default_signature_algorithm(),
        }
    }

    pub fn public_key(&self) -> IssuerPublicKey {
        match self {
            Self::Rsa(key) => IssuerPublicKey::Rsa(key.to_public_key()),
            Self::EcdsaP256(key) => IssuerPublicKey::EcdsaP256(*key.verifying_key()),
            Self::EcdsaP384(key) => IssuerPublicKey::EcdsaP384(*key.verifying_key()),
            Self::EcdsaP521(key) => IssuerPublicKey::EcdsaP521(p521::PublicKey::from_secret_scalar(
                key.as_nonzero_scalar(),
            )),
        }
    }

    /// Returns the SubjectPublicKeyInfo of the public half of this key.
    pub fn subject_public_key_info(
        &self,
    ) -> Result<SubjectPublicKeyInfoOwned, x509_cert::spki::Error> {
        SubjectPublicKeyInfoOwned::from_key(self.public_key())
    }

    /// Signs `message` using the given signature `algorithm`. The message is
    /// hashed with the digest belonging to the algorithm first.
    ///
    /// For ECDSA the DER-encoded signature is returned, for RSA the raw
    /// PKCS#1 v1.5 signature.
    pub fn sign(
        &self,
        algorithm: SignatureAlgorithm,
        message: &[u8],
    ) -> Result<Vec<u8>, IssuerKeyError> {
        snafu::ensure!(
            algorithm.family() == self.family(),
            AlgorithmFamilyMismatchSnafu {
                algorithm,
                family: self.family(),
            }
        );

        let digest = match self.curve() {
            Some(curve) => curve.widen_prehash(algorithm.digest(message)),
            None => algorithm.digest(message),
        };

        match self {
            Self::Rsa(key) => {
                let scheme = match algorithm {
                    SignatureAlgorithm::Sha384WithRsa => Pkcs1v15Sign::new::<sha2::Sha384>(),
                    SignatureAlgorithm::Sha512WithRsa => Pkcs1v15Sign::new::<sha2::Sha512>(),
                    _ => Pkcs1v15Sign::new::<sha2::Sha256>(),
                };

                key.sign_with_rng(&mut OsRng, scheme, &digest)
                    .context(SignRsaSnafu)
            }
            Self::EcdsaP256(key) => {
                let signature: p256::ecdsa::Signature =
                    key.sign_prehash(&digest).context(SignEcdsaSnafu)?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
            Self::EcdsaP384(key) => {
                let signature: p384::ecdsa::Signature =
                    key.sign_prehash(&digest).context(SignEcdsaSnafu)?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
            Self::EcdsaP521(key) => {
                let signature: p521::ecdsa::Signature =
                    key.sign_prehash(&digest).context(SignEcdsaSnafu)?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
        }
    }
}

impl From<rsa_keys::SigningKey> for IssuerKey {
    fn from(key_pair: rsa_keys::SigningKey) -> Self {
        Self::Rsa(key_pair.private_key().clone())
    }
}

impl From<ecdsa::SigningKey> for IssuerKey {
    fn from(key_pair: ecdsa::SigningKey) -> Self {
        Self::EcdsaP256(key_pair.signing_key().clone())
    }
}
