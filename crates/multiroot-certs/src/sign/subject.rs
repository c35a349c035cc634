//! Subject names and subject alternative names of issued certificates.
use std::net::IpAddr;

use const_oid::{
    ObjectIdentifier,
    db::{
        rfc4519::{C, CN, L, O, OU, ST},
        rfc5280::ID_CE_SUBJECT_ALT_NAME,
    },
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use x509_cert::{
    attr::AttributeTypeAndValue,
    der::{
        Any, Decode, Encode, Tag,
        asn1::{Ia5String, OctetString, PrintableStringRef, SetOfVec},
    },
    ext::pkix::{SubjectAltName, name::GeneralName},
    name::{Name, RdnSequence, RelativeDistinguishedName},
    request::{CertReq, ExtensionReq},
};

#[derive(Debug, Snafu)]
pub enum SubjectError {
    #[snafu(display("failed to encode {value:?} as name attribute"))]
    EncodeAttribute {
        source: x509_cert::der::Error,
        value: String,
    },

    #[snafu(display("country {value:?} is not a printable string"))]
    InvalidCountry {
        source: x509_cert::der::Error,
        value: String,
    },

    #[snafu(display("host {host:?} is not a valid subject alternative name"))]
    InvalidHost {
        source: x509_cert::der::Error,
        host: String,
    },

    #[snafu(display("failed to decode the extension request of the CSR"))]
    DecodeExtensionRequest { source: x509_cert::der::Error },

    #[snafu(display("failed to decode the subject alternative names of the CSR"))]
    DecodeSubjectAltName { source: x509_cert::der::Error },
}

/// Replaces parts of the subject requested by a CSR.
///
/// Present parts replace the corresponding CSR part entirely. They are never
/// merged with what the CSR asked for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubjectOverride {
    /// Replaces the distinguished name of the CSR.
    pub name: Option<SubjectName>,

    /// Replaces the subject alternative names of the CSR.
    pub hosts: Option<Vec<String>>,
}

/// A distinguished name in the shape operators usually write it down: a
/// common name plus a list of location and organisation entries.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct SubjectName {
    #[serde(rename = "CN", default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<NameEntry>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct NameEntry {
    #[serde(rename = "C", default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,

    #[serde(rename = "ST", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(rename = "L", default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,

    #[serde(rename = "O", default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    #[serde(rename = "OU", default, skip_serializing_if = "Option::is_none")]
    pub organizational_unit: Option<String>,
}

impl SubjectName {
    pub fn with_common_name(common_name: impl Into<String>) -> Self {
        Self {
            common_name: Some(common_name.into()),
            names: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.common_name.is_none() && self.names.is_empty()
    }

    /// Encodes the name as X.509 distinguished name.
    ///
    /// RDNs are encoded most significant first (country before common name),
    /// so the RFC 4514 string representation starts with `CN=`.
    pub fn to_name(&self) -> Result<Name, SubjectError> {
        let mut rdns = Vec::new();

        for entry in &self.names {
            if let Some(country) = &entry.country {
                PrintableStringRef::new(country).context(InvalidCountrySnafu { value: country })?;
                rdns.push(rdn(C, Tag::PrintableString, country)?);
            }

            let attributes = [
                (ST, &entry.state),
                (L, &entry.locality),
                (O, &entry.organization),
                (OU, &entry.organizational_unit),
            ];

            for (oid, value) in attributes {
                if let Some(value) = value {
                    rdns.push(rdn(oid, Tag::Utf8String, value)?);
                }
            }
        }

        if let Some(common_name) = &self.common_name {
            rdns.push(rdn(CN, Tag::Utf8String, common_name)?);
        }

        Ok(RdnSequence(rdns))
    }
}

fn rdn(
    oid: ObjectIdentifier,
    tag: Tag,
    value: &str,
) -> Result<RelativeDistinguishedName, SubjectError> {
    let value_any = Any::new(tag, value.as_bytes()).context(EncodeAttributeSnafu { value })?;
    let attributes = SetOfVec::try_from(vec![AttributeTypeAndValue {
        oid,
        value: value_any,
    }])
    .context(EncodeAttributeSnafu { value })?;

    Ok(RelativeDistinguishedName(attributes))
}

/// Converts host strings into subject alternative names.
///
/// IP addresses become `iPAddress` entries, strings containing `@` are
/// treated as e-mail addresses, strings containing `://` as URIs and
/// everything else as DNS names.
pub fn hosts_to_general_names(hosts: &[String]) -> Result<Vec<GeneralName>, SubjectError> {
    hosts.iter().map(|host| host_to_general_name(host)).collect()
}

fn host_to_general_name(host: &str) -> Result<GeneralName, SubjectError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        let octets = match ip {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        let octets = OctetString::new(octets).context(InvalidHostSnafu { host })?;
        return Ok(GeneralName::IpAddress(octets));
    }

    let value = Ia5String::new(host).context(InvalidHostSnafu { host })?;
    let name = if host.contains("://") {
        GeneralName::UniformResourceIdentifier(value)
    } else if host.contains('@') {
        GeneralName::Rfc822Name(value)
    } else {
        GeneralName::DnsName(value)
    };

    Ok(name)
}

/// Returns the subject alternative names a CSR requests through its
/// extension request attribute, if any.
pub fn requested_alt_names(request: &CertReq) -> Result<Vec<GeneralName>, SubjectError> {
    let mut names = Vec::new();

    for attribute in request.info.attributes.iter() {
        if attribute.oid != <ExtensionReq as const_oid::AssociatedOid>::OID {
            continue;
        }

        for value in attribute.values.iter() {
            let value_der = value.to_der().context(DecodeExtensionRequestSnafu)?;
            let extensions =
                ExtensionReq::from_der(&value_der).context(DecodeExtensionRequestSnafu)?;

            for extension in extensions.0 {
                if extension.extn_id == ID_CE_SUBJECT_ALT_NAME {
                    let alt_names = SubjectAltName::from_der(extension.extn_value.as_bytes())
                        .context(DecodeSubjectAltNameSnafu)?;
                    names.extend(alt_names.0);
                }
            }
        }
    }

    Ok(names)
}
