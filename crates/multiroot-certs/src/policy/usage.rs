use const_oid::{
    ObjectIdentifier,
    db::rfc5280::{
        ANY_EXTENDED_KEY_USAGE, ID_KP_CLIENT_AUTH, ID_KP_CODE_SIGNING, ID_KP_EMAIL_PROTECTION,
        ID_KP_OCSP_SIGNING, ID_KP_SERVER_AUTH, ID_KP_TIME_STAMPING,
    },
};
use strum::{Display, EnumIter, EnumString};
use x509_cert::ext::pkix::KeyUsages;

// RFC 3280 purposes which were dropped from later profiles but are still
// requested by IPsec deployments.
const ID_KP_IPSEC_END_SYSTEM: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.5");
const ID_KP_IPSEC_TUNNEL: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.6");
const ID_KP_IPSEC_USER: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.7");

/// Microsoft Server Gated Cryptography, `1.3.6.1.4.1.311.10.3.3`.
const MICROSOFT_SGC: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.10.3.3");

/// Netscape Server Gated Cryptography, `2.16.840.1.113730.4.1`.
const NETSCAPE_SGC: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.113730.4.1");

/// A usage token as written in signing profiles.
///
/// Tokens are case-sensitive. Some capabilities have more than one accepted
/// spelling (`signing` and `digital signature`), the [`Display`] output is
/// always the canonical one.
#[derive(Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, PartialEq)]
pub enum Usage {
    #[strum(to_string = "digital signature", serialize = "signing")]
    DigitalSignature,

    #[strum(to_string = "content commitment")]
    ContentCommitment,

    #[strum(to_string = "key encipherment")]
    KeyEncipherment,

    #[strum(to_string = "key agreement")]
    KeyAgreement,

    #[strum(to_string = "data encipherment")]
    DataEncipherment,

    #[strum(to_string = "cert sign")]
    CertSign,

    #[strum(to_string = "crl sign")]
    CrlSign,

    #[strum(to_string = "encipher only")]
    EncipherOnly,

    #[strum(to_string = "decipher only")]
    DecipherOnly,

    #[strum(to_string = "any")]
    Any,

    #[strum(to_string = "server auth")]
    ServerAuth,

    #[strum(to_string = "client auth")]
    ClientAuth,

    #[strum(to_string = "code signing")]
    CodeSigning,

    #[strum(to_string = "email protection", serialize = "s/mime")]
    EmailProtection,

    #[strum(to_string = "ipsec end system")]
    IpsecEndSystem,

    #[strum(to_string = "ipsec tunnel")]
    IpsecTunnel,

    #[strum(to_string = "ipsec user")]
    IpsecUser,

    #[strum(to_string = "timestamping")]
    Timestamping,

    #[strum(to_string = "ocsp signing")]
    OcspSigning,

    #[strum(to_string = "microsoft sgc")]
    MicrosoftSgc,

    #[strum(to_string = "netscape sgc")]
    NetscapeSgc,
}

/// The X.509 extension a [`Usage`] ends up in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageBit {
    /// A bit of the KeyUsage extension.
    KeyUsage(KeyUsages),

    /// A purpose of the ExtendedKeyUsage extension.
    ExtendedKeyUsage(ObjectIdentifier),
}

impl Usage {
    pub fn bit(&self) -> UsageBit {
        use UsageBit::{ExtendedKeyUsage as Eku, KeyUsage as Ku};

        match self {
            Self::DigitalSignature => Ku(KeyUsages::DigitalSignature),
            Self::ContentCommitment => Ku(KeyUsages::NonRepudiation),
            Self::KeyEncipherment => Ku(KeyUsages::KeyEncipherment),
            Self::KeyAgreement => Ku(KeyUsages::KeyAgreement),
            Self::DataEncipherment => Ku(KeyUsages::DataEncipherment),
            Self::CertSign => Ku(KeyUsages::KeyCertSign),
            Self::CrlSign => Ku(KeyUsages::CRLSign),
            Self::EncipherOnly => Ku(KeyUsages::EncipherOnly),
            Self::DecipherOnly => Ku(KeyUsages::DecipherOnly),
            Self::Any => Eku(ANY_EXTENDED_KEY_USAGE),
            Self::ServerAuth => Eku(ID_KP_SERVER_AUTH),
            Self::ClientAuth => Eku(ID_KP_CLIENT_AUTH),
            Self::CodeSigning => Eku(ID_KP_CODE_SIGNING),
            Self::EmailProtection => Eku(ID_KP_EMAIL_PROTECTION),
            Self::IpsecEndSystem => Eku(ID_KP_IPSEC_END_SYSTEM),
            Self::IpsecTunnel => Eku(ID_KP_IPSEC_TUNNEL),
            Self::IpsecUser => Eku(ID_KP_IPSEC_USER),
            Self::Timestamping => Eku(ID_KP_TIME_STAMPING),
            Self::OcspSigning => Eku(ID_KP_OCSP_SIGNING),
            Self::MicrosoftSgc => Eku(MICROSOFT_SGC),
            Self::NetscapeSgc => Eku(NETSCAPE_SGC),
        }
    }
}

/// The resolved extension content of a set of usages.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsageBits {
    pub key_usages: Vec<KeyUsages>,
    pub extended_key_usages: Vec<ObjectIdentifier>,
}

impl FromIterator<Usage> for UsageBits {
    fn from_iter<T: IntoIterator<Item = Usage>>(iter: T) -> Self {
        let mut bits = Self::default();

        for usage in iter {
            match usage.bit() {
                UsageBit::KeyUsage(key_usage) => {
                    if !bits.key_usages.contains(&key_usage) {
                        bits.key_usages.push(key_usage);
                    }
                }
                UsageBit::ExtendedKeyUsage(oid) => {
                    if !bits.extended_key_usages.contains(&oid) {
                        bits.extended_key_usages.push(oid);
                    }
                }
            }
        }

        bits
    }
}
