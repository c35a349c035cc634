//! Signing policies describe what a signing engine is allowed to issue.
//!
//! A [`Policy`] consists of a default [`SigningProfile`] and any number of
//! named profiles. Policies are usually deserialized from the configuration
//! file and validated once using [`Policy::validate`]. A signing engine
//! refuses to be constructed with an invalid policy.
//!
//! ```
//! use multiroot_certs::policy::{Policy, SigningProfile};
//! use multiroot_shared::time::Duration;
//!
//! let policy = Policy::new(SigningProfile::new(
//!     ["digital signature", "server auth"],
//!     Duration::from_days_unchecked(90),
//! ))
//! .with_profile(
//!     "intermediate",
//!     SigningProfile::new(["cert sign", "crl sign"], Duration::from_days_unchecked(1825))
//!         .with_ca(Some(0)),
//! );
//!
//! policy.validate().unwrap();
//! ```
use std::collections::BTreeMap;

use multiroot_shared::time::Duration;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

use crate::sign::SignatureAlgorithm;

mod usage;
pub use usage::*;

/// The name under which the default profile is reported in errors and logs.
pub const DEFAULT_PROFILE_NAME: &str = "default";

/// The default clock skew allowance subtracted from the issuance time.
pub const DEFAULT_BACKDATE: Duration = Duration::from_minutes_unchecked(5);

pub type Result<T, E = PolicyError> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Snafu)]
pub enum PolicyError {
    #[snafu(display("profile {profile:?} does not list any usages"))]
    NoUsages { profile: String },

    #[snafu(display("profile {profile:?} contains unknown usage {token:?}"))]
    UnknownUsage {
        source: strum::ParseError,
        profile: String,
        token: String,
    },

    #[snafu(display("profile {profile:?} must have a positive expiry"))]
    NonPositiveExpiry { profile: String },

    #[snafu(display("profile {profile:?} sets a path length constraint but is not a CA"))]
    PathLenWithoutCa { profile: String },
}

/// The CA capability of certificates issued with a profile. It ends up in
/// the BasicConstraints extension.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CaConstraint {
    #[serde(default)]
    pub is_ca: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_path_len: Option<u8>,
}

/// Describes the kind of certificate which is issued.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SigningProfile {
    /// Usage tokens such as `digital signature` or `server auth`.
    pub usages: Vec<String>,

    /// How long issued certificates are valid, starting at their NotBefore.
    pub expiry: Duration,

    /// How far NotBefore is set into the past to tolerate clock drift.
    #[serde(default = "default_backdate")]
    pub backdate: Duration,

    #[serde(default)]
    pub ca_constraint: CaConstraint,

    /// The name of the authentication key requests for this profile need to
    /// be authenticated with. Profiles without one can't be used by the
    /// dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,

    /// Overrides the signature algorithm of the signing engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_algorithm: Option<SignatureAlgorithm>,
}

fn default_backdate() -> Duration {
    DEFAULT_BACKDATE
}

impl SigningProfile {
    pub fn new<I>(usages: I, expiry: Duration) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            usages: usages.into_iter().map(Into::into).collect(),
            expiry,
            backdate: DEFAULT_BACKDATE,
            ca_constraint: CaConstraint::default(),
            auth_key: None,
            signature_algorithm: None,
        }
    }

    pub fn with_backdate(mut self, backdate: Duration) -> Self {
        self.backdate = backdate;
        self
    }

    /// Marks certificates issued with this profile as CAs.
    pub fn with_ca(mut self, max_path_len: Option<u8>) -> Self {
        self.ca_constraint = CaConstraint {
            is_ca: true,
            max_path_len,
        };
        self
    }

    pub fn with_auth_key(mut self, auth_key: impl Into<String>) -> Self {
        self.auth_key = Some(auth_key.into());
        self
    }

    pub fn with_signature_algorithm(mut self, algorithm: SignatureAlgorithm) -> Self {
        self.signature_algorithm = Some(algorithm);
        self
    }

    pub fn is_ca(&self) -> bool {
        self.ca_constraint.is_ca
    }

    /// Parses the usage tokens of this profile. `name` is only used for
    /// error reporting.
    pub fn parse_usages(&self, name: &str) -> Result<Vec<Usage>> {
        ensure!(!self.usages.is_empty(), NoUsagesSnafu { profile: name });

        self.usages
            .iter()
            .map(|token| {
                token.parse::<Usage>().context(UnknownUsageSnafu {
                    profile: name,
                    token,
                })
            })
            .collect()
    }

    /// Validates a single profile, see [`Policy::validate`].
    pub fn validate(&self, name: &str) -> Result<()> {
        self.parse_usages(name)?;

        ensure!(!self.expiry.is_zero(), NonPositiveExpirySnafu { profile: name });
        ensure!(
            self.ca_constraint.is_ca || self.ca_constraint.max_path_len.is_none(),
            PathLenWithoutCaSnafu { profile: name }
        );

        Ok(())
    }
}

/// A default profile plus named profiles.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub default: SigningProfile,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub profiles: BTreeMap<String, SigningProfile>,
}

impl Policy {
    pub fn new(default: SigningProfile) -> Self {
        Self {
            default,
            profiles: BTreeMap::new(),
        }
    }

    pub fn with_profile(mut self, name: impl Into<String>, profile: SigningProfile) -> Self {
        self.profiles.insert(name.into(), profile);
        self
    }

    /// Checks the default and every named profile: each needs at least one
    /// usage, all usages must be known tokens and the expiry must be
    /// positive.
    pub fn validate(&self) -> Result<()> {
        for (name, profile) in self.iter() {
            profile.validate(name)?;
        }

        Ok(())
    }

    /// Resolves a profile name. An empty or absent name selects the default
    /// profile. Returns [`None`] if a named profile doesn't exist.
    pub fn profile(&self, name: Option<&str>) -> Option<&SigningProfile> {
        match name {
            None | Some("") => Some(&self.default),
            Some(name) => self.profiles.get(name),
        }
    }

    /// Iterates over all profiles, starting with the default one which is
    /// reported as [`DEFAULT_PROFILE_NAME`].
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SigningProfile)> {
        std::iter::once((DEFAULT_PROFILE_NAME, &self.default)).chain(
            self.profiles
                .iter()
                .map(|(name, profile)| (name.as_str(), profile)),
        )
    }
}
