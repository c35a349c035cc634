//! Loads the YAML configuration and turns it into a [`Dispatcher`].
//!
//! ```yaml
//! default_label: primary
//! auth_keys:
//!   ca-auth:
//!     type: standard
//!     key: 0123456789abcdef0123456789abcdef
//!     max_skew: 5m
//! roots:
//!   primary:
//!     certificate: certs/primary.pem
//!     private_key: certs/primary-key.pem
//!     policy:
//!       default:
//!         usages: [digital signature, key encipherment, server auth]
//!         expiry: 90d
//!         auth_key: ca-auth
//! ```
//!
//! Relative paths are resolved against the directory of the configuration
//! file. Authentication keys are hex encoded, either inline, read from an
//! environment variable (`env:NAME`) or read from a file (`file:path`).
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    path::{Path, PathBuf},
    sync::Arc,
};

use multiroot_certs::{
    keys::{IssuerKey, IssuerKeyError},
    policy::{Policy, PolicyError},
    sign::{CreateEngineError, SignatureAlgorithm, SigningEngine},
};
use multiroot_shared::time::Duration;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info, instrument};
use x509_cert::Certificate;
use zeroize::Zeroizing;

use crate::{
    auth::{CreateProviderError, Provider, Standard},
    dispatch::{CreateDispatcherError, Dispatcher},
    stats::Stats,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Prefix of authentication keys read from an environment variable.
const ENV_KEY_PREFIX: &str = "env:";

/// Prefix of authentication keys read from a file.
const FILE_KEY_PREFIX: &str = "file:";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read configuration file {path:?}"))]
    ReadConfig {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse configuration file {path:?}"))]
    ParseConfig {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display(
        "failed to read authentication key {auth_key:?} from environment variable {name:?}"
    ))]
    ReadAuthKeyEnv {
        source: std::env::VarError,
        auth_key: String,
        name: String,
    },

    #[snafu(display("failed to read authentication key {auth_key:?} from file {path:?}"))]
    ReadAuthKeyFile {
        source: std::io::Error,
        auth_key: String,
        path: PathBuf,
    },

    #[snafu(display("failed to create authentication provider {auth_key:?}"))]
    CreateAuthProvider {
        source: CreateProviderError,
        auth_key: String,
    },

    #[snafu(display("the configuration does not contain any roots"))]
    NoRoots,

    #[snafu(display("no default label is configured and there is more than one root"))]
    AmbiguousDefaultLabel,

    #[snafu(display("the policy of label {label:?} is invalid"))]
    InvalidPolicy { source: PolicyError, label: String },

    #[snafu(display("failed to read certificate {path:?} of label {label:?}"))]
    ReadCertificate {
        source: std::io::Error,
        label: String,
        path: PathBuf,
    },

    #[snafu(display("failed to parse certificate {path:?} of label {label:?}"))]
    ParseCertificate {
        source: x509_cert::der::Error,
        label: String,
        path: PathBuf,
    },

    #[snafu(display(
        "certificate file {path:?} of label {label:?} does not contain a certificate"
    ))]
    NoCertificate { label: String, path: PathBuf },

    #[snafu(display("failed to read private key {path:?} of label {label:?}"))]
    ReadPrivateKey {
        source: std::io::Error,
        label: String,
        path: PathBuf,
    },

    #[snafu(display("failed to load private key {path:?} of label {label:?}"))]
    LoadPrivateKey {
        source: IssuerKeyError,
        label: String,
        path: PathBuf,
    },

    #[snafu(display("failed to create the signing engine of label {label:?}"))]
    CreateEngine {
        source: CreateEngineError,
        label: String,
    },

    #[snafu(display("failed to create the dispatcher"))]
    CreateDispatcher { source: CreateDispatcherError },
}

/// The top-level configuration file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The label used for requests which don't name one. Can be omitted if
    /// there is exactly one root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_label: Option<String>,

    /// Authentication keys by the name profiles reference them with.
    #[serde(default)]
    pub auth_keys: BTreeMap<String, AuthKeyConfig>,

    /// One CA identity and policy per label.
    pub roots: BTreeMap<String, RootConfig>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// HMAC-SHA256, see [`Standard`].
    #[default]
    Standard,
}

#[derive(Clone, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AuthKeyConfig {
    #[serde(rename = "type", default)]
    pub provider_type: ProviderType,

    /// The hex encoded key, or `env:NAME` or `file:path` pointing to it.
    pub key: String,

    /// Rejects requests whose timestamp is further away from now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_skew: Option<Duration>,
}

impl Debug for AuthKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthKeyConfig")
            .field("provider_type", &self.provider_type)
            .field("max_skew", &self.max_skew)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RootConfig {
    /// PEM file containing the CA certificate. Only the first certificate
    /// is used.
    pub certificate: PathBuf,

    /// PEM file containing the private key of the CA certificate.
    pub private_key: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_algorithm: Option<SignatureAlgorithm>,

    /// Serializes all private key operations of this root.
    #[serde(default)]
    pub serialize_signing: bool,

    pub policy: Policy,
}

impl Config {
    /// Reads and parses the configuration file.
    #[instrument(name = "read_config")]
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .context(ReadConfigSnafu { path })?;

        serde_yaml::from_str(&content).context(ParseConfigSnafu { path })
    }

    /// The explicitly configured default label, or the only label there is.
    pub fn resolve_default_label(&self) -> Result<String> {
        if let Some(default_label) = &self.default_label {
            return Ok(default_label.clone());
        }

        let mut labels = self.roots.keys();
        match (labels.next(), labels.next()) {
            (None, _) => NoRootsSnafu.fail(),
            (Some(label), None) => Ok(label.clone()),
            (Some(_), Some(_)) => AmbiguousDefaultLabelSnafu.fail(),
        }
    }

    /// Creates the authentication providers, validates all policies, loads
    /// all CA identities and finally builds the dispatcher. Relative paths
    /// are resolved against `base_dir`.
    #[instrument(name = "load_dispatcher", skip(self))]
    pub async fn into_dispatcher(self, base_dir: &Path) -> Result<Dispatcher> {
        let default_label = self.resolve_default_label()?;

        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        for (name, auth_key) in &self.auth_keys {
            let provider = auth_key.load_provider(name, base_dir).await?;
            providers.insert(name.clone(), Arc::new(provider));
        }

        for (label, root) in &self.roots {
            root.policy
                .validate()
                .context(InvalidPolicySnafu { label })?;
        }

        let mut engines = HashMap::new();
        for (label, root) in self.roots {
            let engine = root.load_engine(&label, base_dir).await?;
            engines.insert(label, engine);
        }

        let stats = Arc::new(Stats::new(engines.keys().cloned()));
        let dispatcher = Dispatcher::builder()
            .default_label(default_label)
            .engines(engines)
            .providers(providers)
            .stats(stats)
            .build()
            .context(CreateDispatcherSnafu)?;

        info!(
            labels = ?dispatcher.labels().collect::<Vec<_>>(),
            default_label = dispatcher.default_label(),
            "loaded signing engines"
        );
        Ok(dispatcher)
    }
}

impl AuthKeyConfig {
    async fn load_provider(&self, name: &str, base_dir: &Path) -> Result<Standard> {
        let key = if let Some(variable) = self.key.strip_prefix(ENV_KEY_PREFIX) {
            Zeroizing::new(std::env::var(variable).context(ReadAuthKeyEnvSnafu {
                auth_key: name,
                name: variable,
            })?)
        } else if let Some(path) = self.key.strip_prefix(FILE_KEY_PREFIX) {
            let path = base_dir.join(path);
            Zeroizing::new(
                tokio::fs::read_to_string(&path)
                    .await
                    .context(ReadAuthKeyFileSnafu {
                        auth_key: name,
                        path: &path,
                    })?,
            )
        } else {
            Zeroizing::new(self.key.clone())
        };

        let provider = match self.provider_type {
            ProviderType::Standard => Standard::from_hex(&key)
                .context(CreateAuthProviderSnafu { auth_key: name })?
                .with_max_skew(self.max_skew),
        };

        debug!(auth_key = name, ?provider, "created authentication provider");
        Ok(provider)
    }
}

impl RootConfig {
    async fn load_engine(self, label: &str, base_dir: &Path) -> Result<SigningEngine> {
        let certificate_path = base_dir.join(&self.certificate);
        let certificate_pem = tokio::fs::read(&certificate_path)
            .await
            .context(ReadCertificateSnafu {
                label,
                path: &certificate_path,
            })?;
        let certificate = Certificate::load_pem_chain(&certificate_pem)
            .context(ParseCertificateSnafu {
                label,
                path: &certificate_path,
            })?
            .into_iter()
            .next()
            .context(NoCertificateSnafu {
                label,
                path: &certificate_path,
            })?;

        let key_path = base_dir.join(&self.private_key);
        let key_pem = Zeroizing::new(tokio::fs::read_to_string(&key_path).await.context(
            ReadPrivateKeySnafu {
                label,
                path: &key_path,
            },
        )?);
        let key = IssuerKey::from_pem(&key_pem).context(LoadPrivateKeySnafu {
            label,
            path: &key_path,
        })?;

        SigningEngine::builder()
            .certificate(certificate)
            .key(key)
            .policy(self.policy)
            .maybe_default_signature_algorithm(self.signature_algorithm)
            .serialize_signing(self.serialize_signing)
            .build()
            .context(CreateEngineSnafu { label })
    }
}

/// Reads the configuration file at `path` and builds the dispatcher from it.
pub async fn load_dispatcher(path: &Path) -> Result<Dispatcher> {
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    Config::from_file(path)
        .await?
        .into_dispatcher(base_dir)
        .await
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use multiroot_certs::ca::CertificateAuthority;
    use rstest::rstest;

    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    /// Writes a fresh ECDSA CA to `dir` as `ca.pem` and `ca-key.pem`.
    fn write_ca(dir: &Path) {
        let ca = CertificateAuthority::builder_with_ecdsa()
            .subject("CN=Config Test CA")
            .build()
            .unwrap();

        std::fs::write(
            dir.join("ca.pem"),
            ca.certificate_pair().certificate_pem().unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.join("ca-key.pem"),
            ca.certificate_pair().private_key_pem().unwrap().as_bytes(),
        )
        .unwrap();
    }

    fn write_config(dir: &Path, config: &str) -> PathBuf {
        let path = dir.join("multirootca.yaml");
        std::fs::write(&path, config).unwrap();
        path
    }

    #[test]
    fn parse_config() {
        let input = indoc! {"
            default_label: primary
            auth_keys:
              ca-auth:
                type: standard
                key: 0123456789abcdef0123456789abcdef
                max_skew: 5m
            roots:
              primary:
                certificate: ca.pem
                private_key: ca-key.pem
                signature_algorithm: ecdsa-with-sha384
                serialize_signing: true
                policy:
                  default:
                    usages: [digital signature, server auth]
                    expiry: 90d
                    auth_key: ca-auth
                  profiles:
                    intermediate:
                      usages: [cert sign, crl sign]
                      expiry: 5y
                      ca_constraint:
                        is_ca: true
                        max_path_len: 0
                      auth_key: ca-auth
        "};

        let config: Config = serde_yaml::from_str(input).unwrap();

        assert_eq!(config.default_label.as_deref(), Some("primary"));
        assert_eq!(
            config.auth_keys["ca-auth"].max_skew,
            Some(Duration::from_minutes_unchecked(5))
        );

        let root = &config.roots["primary"];
        assert_eq!(root.certificate, PathBuf::from("ca.pem"));
        assert_eq!(root.signature_algorithm, Some(SignatureAlgorithm::EcdsaWithSha384));
        assert!(root.serialize_signing);
        assert!(root.policy.profiles["intermediate"].is_ca());
        assert_eq!(root.policy.default.auth_key.as_deref(), Some("ca-auth"));
    }

    #[test]
    fn reject_unknown_fields() {
        let input = indoc! {"
            roots: {}
            listen: 0.0.0.0:8888
        "};

        assert!(serde_yaml::from_str::<Config>(input).is_err());
    }

    #[test]
    fn debug_hides_auth_key() {
        let auth_key = AuthKeyConfig {
            provider_type: ProviderType::Standard,
            key: KEY.to_owned(),
            max_skew: None,
        };

        assert!(!format!("{auth_key:?}").contains(KEY));
    }

    #[rstest]
    #[case::explicit(Some("b"), &["a", "b"], Some("b"))]
    #[case::single_root(None, &["a"], Some("a"))]
    #[case::ambiguous(None, &["a", "b"], None)]
    #[case::no_roots(None, &[], None)]
    fn default_label(
        #[case] configured_default_label: Option<&str>,
        #[case] labels: &[&str],
        #[case] expected: Option<&str>,
    ) {
        let root = RootConfig {
            certificate: PathBuf::from("ca.pem"),
            private_key: PathBuf::from("ca-key.pem"),
            signature_algorithm: None,
            serialize_signing: false,
            policy: Policy::new(multiroot_certs::policy::SigningProfile::new(
                ["server auth"],
                Duration::from_days_unchecked(1),
            )),
        };
        let config = Config {
            default_label: configured_default_label.map(ToOwned::to_owned),
            auth_keys: BTreeMap::new(),
            roots: labels
                .iter()
                .map(|label| ((*label).to_owned(), root.clone()))
                .collect(),
        };

        assert_eq!(config.resolve_default_label().ok().as_deref(), expected);
    }

    #[tokio::test]
    async fn load_dispatcher_from_file() {
        let dir = tempfile::tempdir().unwrap();
        write_ca(dir.path());
        std::fs::write(dir.path().join("auth.key"), format!("{KEY}\n")).unwrap();
        let path = write_config(dir.path(), indoc! {"
            auth_keys:
              ca-auth:
                key: file:auth.key
            roots:
              primary:
                certificate: ca.pem
                private_key: ca-key.pem
                policy:
                  default:
                    usages: [digital signature, server auth]
                    expiry: 90d
                    auth_key: ca-auth
        "});

        let dispatcher = load_dispatcher(&path).await.unwrap();

        assert_eq!(dispatcher.default_label(), "primary");
        let engine = dispatcher.engine("primary").unwrap();
        assert_eq!(engine.subject().to_string(), "CN=Config Test CA");
    }

    #[tokio::test]
    async fn reject_unknown_auth_key_reference() {
        let dir = tempfile::tempdir().unwrap();
        write_ca(dir.path());
        let path = write_config(dir.path(), indoc! {"
            roots:
              primary:
                certificate: ca.pem
                private_key: ca-key.pem
                policy:
                  default:
                    usages: [server auth]
                    expiry: 90d
                    auth_key: missing
        "});

        let err = load_dispatcher(&path).await.unwrap_err();

        assert!(
            matches!(
                err,
                Error::CreateDispatcher {
                    source: CreateDispatcherError::UnknownAuthKey { .. }
                }
            ),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn reject_invalid_policy_before_loading_keys() {
        let dir = tempfile::tempdir().unwrap();
        // No CA files on disk, policy validation has to fail first.
        let path = write_config(dir.path(), indoc! {"
            roots:
              primary:
                certificate: ca.pem
                private_key: ca-key.pem
                policy:
                  default:
                    usages: [server auth, teleportation]
                    expiry: 90d
        "});

        let err = load_dispatcher(&path).await.unwrap_err();

        assert!(
            matches!(&err, Error::InvalidPolicy { label, .. } if label == "primary"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn reject_missing_certificate_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), indoc! {"
            roots:
              primary:
                certificate: missing.pem
                private_key: ca-key.pem
                policy:
                  default:
                    usages: [server auth]
                    expiry: 90d
        "});

        let err = load_dispatcher(&path).await.unwrap_err();

        assert!(matches!(err, Error::ReadCertificate { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn reject_incompatible_signature_algorithm() {
        let dir = tempfile::tempdir().unwrap();
        write_ca(dir.path());
        let path = write_config(dir.path(), indoc! {"
            roots:
              primary:
                certificate: ca.pem
                private_key: ca-key.pem
                signature_algorithm: sha256-with-rsa
                policy:
                  default:
                    usages: [server auth]
                    expiry: 90d
        "});

        let err = load_dispatcher(&path).await.unwrap_err();

        assert!(
            matches!(
                err,
                Error::CreateEngine {
                    source: CreateEngineError::IncompatibleDefaultAlgorithm { .. },
                    ..
                }
            ),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn reject_unknown_default_label() {
        let dir = tempfile::tempdir().unwrap();
        write_ca(dir.path());
        let path = write_config(dir.path(), indoc! {"
            default_label: secondary
            roots:
              primary:
                certificate: ca.pem
                private_key: ca-key.pem
                policy:
                  default:
                    usages: [server auth]
                    expiry: 90d
        "});

        let err = load_dispatcher(&path).await.unwrap_err();

        assert!(
            matches!(
                err,
                Error::CreateDispatcher {
                    source: CreateDispatcherError::UnknownDefaultLabel { .. }
                }
            ),
            "{err:?}"
        );
    }
}
