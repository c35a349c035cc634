//! JSON wire types: the authenticated envelope, the sign request inside it
//! and the responses returned to callers.
use multiroot_certs::sign::{SubjectName, SubjectOverride};
use serde::{Deserialize, Serialize};

use crate::dispatch::ErrorKind;

/// Wraps a raw sign request together with the token authenticating it.
///
/// All byte fields are base64 encoded on the wire. `request` holds the
/// sign request exactly as it was authenticated, it is only parsed after
/// the envelope itself was parsed.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct AuthenticatedRequest {
    /// Seconds since the UNIX epoch. Salts the token when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// The address of the requester as seen by the transport.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_serde::optional"
    )]
    pub remote_address: Option<Vec<u8>>,

    #[serde(with = "base64_serde::required")]
    pub token: Vec<u8>,

    #[serde(with = "base64_serde::required")]
    pub request: Vec<u8>,
}

impl AuthenticatedRequest {
    /// Returns the remote address for logging, replacing invalid UTF-8.
    pub fn requester(&self) -> Option<String> {
        self.remote_address
            .as_deref()
            .map(|address| String::from_utf8_lossy(address).into_owned())
    }
}

/// Asks a signing engine to issue a certificate for a CSR.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct SignRequest {
    /// Replaces the subject alternative names requested by the CSR.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    /// The PEM encoded certificate signing request.
    #[serde(default, alias = "request")]
    pub certificate_request: String,

    /// Replaces the subject requested by the CSR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,

    /// The profile within the policy of the selected label. Empty selects the
    /// default profile.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profile: String,

    /// Selects the signing engine. Empty selects the default label.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct Subject {
    #[serde(flatten)]
    pub name: SubjectName,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,
}

impl SignRequest {
    /// Builds the override handed to the signing engine.
    ///
    /// A present `subject` replaces both the distinguished name and the SAN
    /// list. The SAN list then comes from the subject's hosts, the top-level
    /// hosts or is empty, never from the CSR. Without a subject, non-empty
    /// top-level hosts only replace the SAN list.
    pub fn subject_override(&self) -> Option<SubjectOverride> {
        match &self.subject {
            Some(subject) => Some(SubjectOverride {
                name: Some(subject.name.clone()),
                hosts: Some(
                    subject
                        .hosts
                        .clone()
                        .unwrap_or_else(|| self.hosts.clone()),
                ),
            }),
            None if !self.hosts.is_empty() => Some(SubjectOverride {
                name: None,
                hosts: Some(self.hosts.clone()),
            }),
            None => None,
        }
    }
}

/// Returned for each issued certificate.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct SignatureResponse {
    pub certificate: String,
}

/// Returned for each failed request. Only carries the classification and
/// the caller-safe message, never the internal error chain.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
}

mod base64_serde {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub mod required {
        use super::*;

        pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&STANDARD.encode(bytes))
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let encoded = String::deserialize(deserializer)?;
            STANDARD.decode(encoded).map_err(D::Error::custom)
        }
    }

    pub mod optional {
        use super::*;

        pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| STANDARD.decode(encoded).map_err(D::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use multiroot_certs::sign::NameEntry;

    use super::*;

    #[test]
    fn parse_envelope() {
        let input = indoc! {r#"
            {
                "timestamp": 1700000000,
                "remote_address": "MTAuMC4wLjE6NDQz",
                "token": "3q2+7w==",
                "request": "eyJsYWJlbCI6InByaW1hcnkifQ=="
            }
        "#};

        let envelope: AuthenticatedRequest = serde_json::from_str(input).unwrap();

        assert_eq!(envelope.timestamp, Some(1_700_000_000));
        assert_eq!(envelope.requester().as_deref(), Some("10.0.0.1:443"));
        assert_eq!(envelope.token, [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(envelope.request, br#"{"label":"primary"}"#);
    }

    #[test]
    fn reject_envelope_with_invalid_base64() {
        let input = r#"{"token": "not base64!", "request": ""}"#;

        assert!(serde_json::from_str::<AuthenticatedRequest>(input).is_err());
    }

    #[test]
    fn reject_envelope_without_token() {
        let input = r#"{"request": ""}"#;

        assert!(serde_json::from_str::<AuthenticatedRequest>(input).is_err());
    }

    #[test]
    fn parse_sign_request() {
        let input = indoc! {r#"
            {
                "hosts": ["example.com", "10.0.0.1"],
                "request": "-----BEGIN CERTIFICATE REQUEST-----",
                "subject": {
                    "CN": "example.com",
                    "names": [{"C": "DE", "O": "Example"}]
                },
                "profile": "server",
                "label": "primary"
            }
        "#};

        let request: SignRequest = serde_json::from_str(input).unwrap();

        assert_eq!(request.certificate_request, "-----BEGIN CERTIFICATE REQUEST-----");
        assert_eq!(request.profile, "server");
        assert_eq!(request.label, "primary");
        assert_eq!(
            request.subject,
            Some(Subject {
                name: SubjectName {
                    common_name: Some("example.com".to_owned()),
                    names: vec![NameEntry {
                        country: Some("DE".to_owned()),
                        organization: Some("Example".to_owned()),
                        ..Default::default()
                    }],
                },
                hosts: None,
            })
        );
    }

    #[test]
    fn empty_sign_request_uses_defaults() {
        let request: SignRequest = serde_json::from_str("{}").unwrap();

        assert_eq!(request, SignRequest::default());
        assert_eq!(request.subject_override(), None);
    }

    #[test]
    fn subject_replaces_hosts_entirely() {
        let request = SignRequest {
            hosts: vec!["ignored.example.com".to_owned()],
            subject: Some(Subject {
                name: SubjectName::with_common_name("override.example.com"),
                hosts: Some(vec!["override.example.com".to_owned()]),
            }),
            ..Default::default()
        };

        assert_eq!(
            request.subject_override(),
            Some(SubjectOverride {
                name: Some(SubjectName::with_common_name("override.example.com")),
                hosts: Some(vec!["override.example.com".to_owned()]),
            })
        );
    }

    #[test]
    fn subject_falls_back_to_request_hosts() {
        let request = SignRequest {
            hosts: vec!["example.com".to_owned()],
            subject: Some(Subject {
                name: SubjectName::with_common_name("example.com"),
                hosts: None,
            }),
            ..Default::default()
        };

        let subject_override = request.subject_override().unwrap();
        assert_eq!(subject_override.hosts, Some(vec!["example.com".to_owned()]));
    }

    #[test]
    fn subject_without_any_hosts_clears_alt_names() {
        let request = SignRequest {
            subject: Some(Subject {
                name: SubjectName::with_common_name("example.com"),
                hosts: None,
            }),
            ..Default::default()
        };

        let subject_override = request.subject_override().unwrap();
        assert_eq!(subject_override.hosts, Some(Vec::new()));
    }

    #[test]
    fn hosts_without_subject_keep_requested_name() {
        let request = SignRequest {
            hosts: vec!["example.com".to_owned()],
            ..Default::default()
        };

        assert_eq!(
            request.subject_override(),
            Some(SubjectOverride {
                name: None,
                hosts: Some(vec!["example.com".to_owned()]),
            })
        );
    }
}
