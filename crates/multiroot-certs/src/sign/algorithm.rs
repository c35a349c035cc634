use const_oid::{
    ObjectIdentifier,
    db::rfc5912::{
        ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, ECDSA_WITH_SHA_512, ID_EC_PUBLIC_KEY,
        RSA_ENCRYPTION, SECP_256_R_1, SECP_384_R_1, SECP_521_R_1, SHA_256_WITH_RSA_ENCRYPTION,
        SHA_384_WITH_RSA_ENCRYPTION, SHA_512_WITH_RSA_ENCRYPTION,
    },
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{Display, EnumIter, EnumString};
use x509_cert::{
    der::{Any, asn1::AnyRef},
    spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned},
};

#[derive(Debug, Snafu)]
pub enum AlgorithmError {
    #[snafu(display("unsupported signature algorithm {oid}"))]
    UnsupportedSignatureAlgorithm { oid: ObjectIdentifier },

    #[snafu(display("unsupported public key algorithm {oid}"))]
    UnsupportedKeyAlgorithm { oid: ObjectIdentifier },

    #[snafu(display("EC public key does not name its curve"))]
    MissingCurve,

    #[snafu(display("failed to decode the named curve of the EC public key"))]
    DecodeCurve { source: x509_cert::der::Error },

    #[snafu(display("unsupported elliptic curve {oid}"))]
    UnsupportedCurve { oid: ObjectIdentifier },
}

/// The family of a private or public key. Signature algorithms can only be
/// used with keys of their own family.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
#[strum(serialize_all = "UPPERCASE")]
pub enum KeyFamily {
    Rsa,
    Ecdsa,
}

impl KeyFamily {
    /// Determines the family of the key contained in `spki`.
    pub fn of_public_key(spki: &SubjectPublicKeyInfoOwned) -> Result<Self, AlgorithmError> {
        match spki.algorithm.oid {
            RSA_ENCRYPTION => Ok(Self::Rsa),
            ID_EC_PUBLIC_KEY => Ok(Self::Ecdsa),
            oid => UnsupportedKeyAlgorithmSnafu { oid }.fail(),
        }
    }

    /// The signature algorithm used when neither the profile nor the engine
    /// configure one explicitly.
    pub fn default_signature_algorithm(&self) -> SignatureAlgorithm {
        match self {
            Self::Rsa => SignatureAlgorithm::Sha256WithRsa,
            Self::Ecdsa => SignatureAlgorithm::EcdsaWithSha256,
        }
    }
}

/// The NIST curves ECDSA keys may use, named like in FIPS 186.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum EcdsaCurve {
    #[strum(serialize = "P-256")]
    P256,

    #[strum(serialize = "P-384")]
    P384,

    #[strum(serialize = "P-521")]
    P521,
}

impl EcdsaCurve {
    /// Reads the named curve from the parameters of an `id-ecPublicKey`.
    pub fn of_public_key(spki: &SubjectPublicKeyInfoOwned) -> Result<Self, AlgorithmError> {
        let oid = spki
            .algorithm
            .parameters
            .as_ref()
            .context(MissingCurveSnafu)?
            .decode_as::<ObjectIdentifier>()
            .context(DecodeCurveSnafu)?;

        match oid {
            SECP_256_R_1 => Ok(Self::P256),
            SECP_384_R_1 => Ok(Self::P384),
            SECP_521_R_1 => Ok(Self::P521),
            oid => UnsupportedCurveSnafu { oid }.fail(),
        }
    }

    /// Size of a scalar in octets.
    pub fn field_size(&self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
            Self::P521 => 66,
        }
    }

    /// Left pads a digest shorter than the field with zeros. The integer value
    /// stays the same, which keeps short digests such as SHA-256 on P-521
    /// within the lower bound the prehash signers enforce.
    pub fn widen_prehash(&self, digest: Vec<u8>) -> Vec<u8> {
        let field_size = self.field_size();
        if digest.len() >= field_size {
            return digest;
        }

        let mut widened = vec![0; field_size - digest.len()];
        widened.extend_from_slice(&digest);
        widened
    }

    /// The digest strength follows the curve size, P-521 pairs with SHA-512.
    pub fn default_signature_algorithm(&self) -> SignatureAlgorithm {
        match self {
            Self::P256 => SignatureAlgorithm::EcdsaWithSha256,
            Self::P384 => SignatureAlgorithm::EcdsaWithSha384,
            Self::P521 => SignatureAlgorithm::EcdsaWithSha512,
        }
    }
}

/// Signature algorithms supported for issuing certificates.
///
/// The textual representation (used in configuration files) is the kebab-case
/// variant name, e.g. `sha256-with-rsa` or `ecdsa-with-sha384`.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SignatureAlgorithm {
    Sha256WithRsa,
    Sha384WithRsa,
    Sha512WithRsa,
    EcdsaWithSha256,
    EcdsaWithSha384,
    EcdsaWithSha512,
}

impl SignatureAlgorithm {
    pub fn family(&self) -> KeyFamily {
        match self {
            Self::Sha256WithRsa | Self::Sha384WithRsa | Self::Sha512WithRsa => KeyFamily::Rsa,
            Self::EcdsaWithSha256 | Self::EcdsaWithSha384 | Self::EcdsaWithSha512 => {
                KeyFamily::Ecdsa
            }
        }
    }

    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            Self::Sha256WithRsa => SHA_256_WITH_RSA_ENCRYPTION,
            Self::Sha384WithRsa => SHA_384_WITH_RSA_ENCRYPTION,
            Self::Sha512WithRsa => SHA_512_WITH_RSA_ENCRYPTION,
            Self::EcdsaWithSha256 => ECDSA_WITH_SHA_256,
            Self::EcdsaWithSha384 => ECDSA_WITH_SHA_384,
            Self::EcdsaWithSha512 => ECDSA_WITH_SHA_512,
        }
    }

    /// Returns the X.509 `AlgorithmIdentifier`. RSA algorithms carry an
    /// explicit NULL parameter (RFC 4055), ECDSA algorithms none (RFC 5758).
    pub fn algorithm_identifier(&self) -> AlgorithmIdentifierOwned {
        let parameters = match self.family() {
            KeyFamily::Rsa => Some(Any::from(AnyRef::NULL)),
            KeyFamily::Ecdsa => None,
        };

        AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters,
        }
    }

    /// Hashes `message` with the digest of this algorithm.
    pub fn digest(&self, message: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256WithRsa | Self::EcdsaWithSha256 => Sha256::digest(message).to_vec(),
            Self::Sha384WithRsa | Self::EcdsaWithSha384 => Sha384::digest(message).to_vec(),
            Self::Sha512WithRsa | Self::EcdsaWithSha512 => Sha512::digest(message).to_vec(),
        }
    }
}

impl TryFrom<&AlgorithmIdentifierOwned> for SignatureAlgorithm {
    type Error = AlgorithmError;

    fn try_from(identifier: &AlgorithmIdentifierOwned) -> Result<Self, Self::Error> {
        match identifier.oid {
            SHA_256_WITH_RSA_ENCRYPTION => Ok(Self::Sha256WithRsa),
            SHA_384_WITH_RSA_ENCRYPTION => Ok(Self::Sha384WithRsa),
            SHA_512_WITH_RSA_ENCRYPTION => Ok(Self::Sha512WithRsa),
            ECDSA_WITH_SHA_256 => Ok(Self::EcdsaWithSha256),
            ECDSA_WITH_SHA_384 => Ok(Self::EcdsaWithSha384),
            ECDSA_WITH_SHA_512 => Ok(Self::EcdsaWithSha512),
            oid => UnsupportedSignatureAlgorithmSnafu { oid }.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use strum::IntoEnumIterator;

    use super::*;

    #[rstest]
    #[case("sha256-with-rsa", SignatureAlgorithm::Sha256WithRsa)]
    #[case("sha512-with-rsa", SignatureAlgorithm::Sha512WithRsa)]
    #[case("ecdsa-with-sha384", SignatureAlgorithm::EcdsaWithSha384)]
    #[case("ecdsa-with-sha512", SignatureAlgorithm::EcdsaWithSha512)]
    fn parse_algorithm_names(#[case] input: &str, #[case] expected: SignatureAlgorithm) {
        assert_eq!(input.parse::<SignatureAlgorithm>().unwrap(), expected);
        assert_eq!(expected.to_string(), input);

        let deserialized: SignatureAlgorithm = serde_yaml::from_str(input).unwrap();
        assert_eq!(deserialized, expected);
    }

    #[test]
    fn identifier_round_trips_through_oid() {
        for algorithm in SignatureAlgorithm::iter() {
            let identifier = algorithm.algorithm_identifier();
            assert_eq!(
                SignatureAlgorithm::try_from(&identifier).unwrap(),
                algorithm
            );
        }
    }

    #[rstest]
    #[case(SignatureAlgorithm::Sha256WithRsa, 32)]
    #[case(SignatureAlgorithm::Sha384WithRsa, 48)]
    #[case(SignatureAlgorithm::Sha512WithRsa, 64)]
    #[case(SignatureAlgorithm::EcdsaWithSha256, 32)]
    #[case(SignatureAlgorithm::EcdsaWithSha384, 48)]
    #[case(SignatureAlgorithm::EcdsaWithSha512, 64)]
    fn digest_length(#[case] algorithm: SignatureAlgorithm, #[case] length: usize) {
        assert_eq!(algorithm.digest(b"multiroot").len(), length);
    }

    #[test]
    fn defaults_match_family() {
        for family in [KeyFamily::Rsa, KeyFamily::Ecdsa] {
            assert_eq!(family.default_signature_algorithm().family(), family);
        }
    }

    #[rstest]
    #[case(SECP_256_R_1, EcdsaCurve::P256, SignatureAlgorithm::EcdsaWithSha256)]
    #[case(SECP_384_R_1, EcdsaCurve::P384, SignatureAlgorithm::EcdsaWithSha384)]
    #[case(SECP_521_R_1, EcdsaCurve::P521, SignatureAlgorithm::EcdsaWithSha512)]
    fn curve_from_public_key_parameters(
        #[case] oid: ObjectIdentifier,
        #[case] curve: EcdsaCurve,
        #[case] default: SignatureAlgorithm,
    ) {
        let spki = SubjectPublicKeyInfoOwned {
            algorithm: AlgorithmIdentifierOwned {
                oid: ID_EC_PUBLIC_KEY,
                parameters: Some(Any::from(oid)),
            },
            subject_public_key: x509_cert::der::asn1::BitString::from_bytes(&[4]).unwrap(),
        };

        assert_eq!(EcdsaCurve::of_public_key(&spki).unwrap(), curve);
        assert_eq!(curve.default_signature_algorithm(), default);
    }

    #[test]
    fn widen_short_prehash() {
        let digest = SignatureAlgorithm::EcdsaWithSha256.digest(b"multiroot");

        let widened = EcdsaCurve::P521.widen_prehash(digest.clone());
        assert_eq!(widened.len(), 66);
        assert!(widened[..34].iter().all(|octet| *octet == 0));
        assert_eq!(widened[34..], digest[..]);

        assert_eq!(EcdsaCurve::P256.widen_prehash(digest.clone()), digest);
    }

    #[test]
    fn curve_requires_parameters() {
        let spki = SubjectPublicKeyInfoOwned {
            algorithm: AlgorithmIdentifierOwned {
                oid: ID_EC_PUBLIC_KEY,
                parameters: None,
            },
            subject_public_key: x509_cert::der::asn1::BitString::from_bytes(&[4]).unwrap(),
        };

        assert!(matches!(
            EcdsaCurve::of_public_key(&spki),
            Err(AlgorithmError::MissingCurve)
        ));
    }
}
