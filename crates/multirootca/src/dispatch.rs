//! The issuance dispatcher, the single entry point for authenticated sign
//! requests.
//!
//! For each envelope the [`Dispatcher`] resolves the label to a
//! [`SigningEngine`], the profile within that engine's policy and the
//! authentication provider of the profile. Only requests which pass
//! authentication reach the engine. Every failure is classified as an
//! [`ErrorKind`] before it leaves the dispatcher.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use bon::Builder;
use multiroot_certs::{
    policy::DEFAULT_PROFILE_NAME,
    sign::{self, IssuedCertificate, SignErrorKind, SigningEngine},
};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use strum::Display;
use tracing::{Span, field::Empty, info, instrument, warn};

use crate::{
    auth::{Provider, VerifyError},
    request::{AuthenticatedRequest, ErrorBody, ErrorResponse, SignRequest},
    stats::Stats,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The classification of a failed request, as seen by callers.
#[derive(Clone, Copy, Debug, Deserialize, Display, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// The envelope or the sign request inside it can't be parsed.
    Malformed,

    /// No signing engine is configured for the label.
    UnknownLabel,

    /// The profile has no authentication provider or the token is invalid.
    Unauthorized,

    /// The request was rejected because of its content.
    BadRequest,

    /// The service itself is broken. This is the only kind which is not the
    /// fault of the caller.
    Internal,
}

impl ErrorKind {
    /// The HTTP status code a transport should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Malformed | ErrorKind::UnknownLabel | ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse the authenticated request"))]
    ParseEnvelope { source: serde_json::Error },

    #[snafu(display("failed to parse the sign request"))]
    ParseSignRequest { source: serde_json::Error },

    #[snafu(display("request is for non-existent label {label:?}"))]
    UnknownLabel { label: String },

    #[snafu(display("profile {profile:?} does not exist in the policy of label {label:?}"))]
    UnknownProfile { label: String, profile: String },

    #[snafu(display("received unauthenticated request for profile {profile:?}"))]
    NoAuthProvider { profile: String },

    #[snafu(display("authentication key {auth_key:?} is not configured"))]
    MissingAuthProvider { auth_key: String },

    #[snafu(display("received authenticated request with invalid token"))]
    InvalidToken { source: VerifyError },

    #[snafu(display("empty request"))]
    EmptyRequest,

    #[snafu(display("signature failed"))]
    Sign { source: sign::Error },

    #[snafu(display("failed to parse the issued certificate"))]
    ParseIssuedCertificate { source: x509_cert::der::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ParseEnvelope { .. } | Error::ParseSignRequest { .. } => ErrorKind::Malformed,
            Error::UnknownLabel { .. } => ErrorKind::UnknownLabel,
            Error::NoAuthProvider { .. } | Error::InvalidToken { .. } => ErrorKind::Unauthorized,
            Error::EmptyRequest => ErrorKind::BadRequest,
            Error::Sign { source } => match source.kind() {
                SignErrorKind::BadRequest | SignErrorKind::Signing => ErrorKind::BadRequest,
                SignErrorKind::InvalidCertificate | SignErrorKind::Internal => ErrorKind::Internal,
            },
            Error::UnknownProfile { .. }
            | Error::MissingAuthProvider { .. }
            | Error::ParseIssuedCertificate { .. } => ErrorKind::Internal,
        }
    }

    /// The short message which is safe to hand out to untrusted callers.
    ///
    /// A missing provider and an invalid token are both [`ErrorKind::Unauthorized`],
    /// but only the log tells them apart.
    pub fn public_message(&self) -> &'static str {
        match self {
            Error::ParseEnvelope { .. } | Error::ParseSignRequest { .. } => "malformed request",
            Error::UnknownLabel { .. } => "bad request",
            Error::UnknownProfile { .. } | Error::MissingAuthProvider { .. } => "invalid profile",
            Error::NoAuthProvider { .. } => "authorisation required",
            Error::InvalidToken { .. } => "invalid token",
            Error::EmptyRequest => "invalid request",
            Error::Sign { source } => match source.kind() {
                SignErrorKind::BadRequest | SignErrorKind::Signing => "bad request",
                SignErrorKind::InvalidCertificate | SignErrorKind::Internal => "bad certificate",
            },
            Error::ParseIssuedCertificate { .. } => "bad certificate",
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let kind = self.kind();

        ErrorResponse {
            error: ErrorBody {
                kind,
                status: kind.status_code(),
                message: self.public_message().to_owned(),
            },
        }
    }
}

#[derive(Debug, Snafu)]
pub enum CreateDispatcherError {
    #[snafu(display("the default label {label:?} has no signing engine"))]
    UnknownDefaultLabel { label: String },

    #[snafu(display(
        "profile {profile:?} of label {label:?} references unknown authentication key {auth_key:?}"
    ))]
    UnknownAuthKey {
        label: String,
        profile: String,
        auth_key: String,
    },
}

/// Routes authenticated sign requests to signing engines.
///
/// The dispatcher is immutable once built and can be shared between any
/// number of concurrent requests.
#[derive(Debug)]
pub struct Dispatcher {
    default_label: String,
    engines: HashMap<String, SigningEngine>,
    providers: HashMap<String, Arc<dyn Provider>>,
    stats: Arc<Stats>,
}

/// Builds a [`Dispatcher`]. The default label and all authentication key
/// references of all policies are checked in [`DispatcherBuilder::build`].
#[derive(Builder)]
#[builder(start_fn = start_builder, finish_fn = finish_builder)]
pub struct DispatcherBuilder {
    /// The label used for requests which don't name one.
    #[builder(into)]
    default_label: String,

    /// One signing engine per label.
    engines: HashMap<String, SigningEngine>,

    /// Authentication providers by the name profiles reference them with.
    #[builder(default)]
    providers: HashMap<String, Arc<dyn Provider>>,

    /// The counters to record requests in. Defaults to a fresh registry with
    /// all labels of `engines`.
    stats: Option<Arc<Stats>>,
}

impl<S> DispatcherBuilderBuilder<S>
where
    S: dispatcher_builder_builder::IsComplete,
{
    /// Convenience function to avoid calling `builder().finish_builder().build()`
    pub fn build(self) -> Result<Dispatcher, CreateDispatcherError> {
        self.finish_builder().build()
    }
}

impl DispatcherBuilder {
    #[instrument(
        name = "build_dispatcher",
        skip(self),
        fields(default_label = %self.default_label),
    )]
    pub fn build(self) -> Result<Dispatcher, CreateDispatcherError> {
        ensure!(
            self.engines.contains_key(&self.default_label),
            UnknownDefaultLabelSnafu {
                label: &self.default_label
            }
        );

        // Sorted, so that the first error is stable across runs.
        let engines: BTreeMap<_, _> = self.engines.iter().collect();
        for (label, engine) in engines {
            for (profile, signing_profile) in engine.policy().iter() {
                if let Some(auth_key) = &signing_profile.auth_key {
                    ensure!(
                        self.providers.contains_key(auth_key),
                        UnknownAuthKeySnafu {
                            label,
                            profile,
                            auth_key
                        }
                    );
                }
            }
        }

        let stats = self
            .stats
            .unwrap_or_else(|| Arc::new(Stats::new(self.engines.keys().cloned())));

        Ok(Dispatcher {
            default_label: self.default_label,
            engines: self.engines,
            providers: self.providers,
            stats,
        })
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilderBuilder {
        DispatcherBuilder::start_builder()
    }

    pub fn default_label(&self) -> &str {
        &self.default_label
    }

    pub fn engine(&self, label: &str) -> Option<&SigningEngine> {
        self.engines.get(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Dispatches a JSON encoded [`AuthenticatedRequest`].
    #[instrument(
        name = "dispatch_sign_request",
        skip_all,
        fields(requester = Empty, label = Empty, profile = Empty),
    )]
    pub fn dispatch(&self, envelope: &[u8]) -> Result<IssuedCertificate> {
        self.stats.increment_requests();

        let result = serde_json::from_slice(envelope)
            .context(ParseEnvelopeSnafu)
            .and_then(|envelope| self.dispatch_envelope(&envelope));

        self.record_failure(result)
    }

    /// Dispatches an already decoded [`AuthenticatedRequest`].
    #[instrument(
        name = "dispatch_sign_request",
        skip_all,
        fields(requester = Empty, label = Empty, profile = Empty),
    )]
    pub fn dispatch_authenticated(
        &self,
        envelope: &AuthenticatedRequest,
    ) -> Result<IssuedCertificate> {
        self.stats.increment_requests();

        let result = self.dispatch_envelope(envelope);
        self.record_failure(result)
    }

    fn dispatch_envelope(&self, envelope: &AuthenticatedRequest) -> Result<IssuedCertificate> {
        let span = Span::current();
        let requester = envelope.requester();
        if let Some(requester) = &requester {
            span.record("requester", requester.as_str());
        }

        let sign_request: SignRequest =
            serde_json::from_slice(&envelope.request).context(ParseSignRequestSnafu)?;

        let label = match sign_request.label.as_str() {
            "" => self.default_label.as_str(),
            label => label,
        };
        let profile_name = match sign_request.profile.as_str() {
            "" => DEFAULT_PROFILE_NAME,
            profile => profile,
        };
        span.record("label", label).record("profile", profile_name);

        self.stats.increment_label_requests(label);
        let engine = self
            .engines
            .get(label)
            .context(UnknownLabelSnafu { label })?;

        let profile = engine
            .policy()
            .profile(Some(sign_request.profile.as_str()))
            .context(UnknownProfileSnafu {
                label,
                profile: profile_name,
            })?;

        let auth_key = profile.auth_key.as_deref().context(NoAuthProviderSnafu {
            profile: profile_name,
        })?;
        let provider = self
            .providers
            .get(auth_key)
            .context(MissingAuthProviderSnafu { auth_key })?;
        provider.verify(envelope).context(InvalidTokenSnafu)?;

        ensure!(
            !sign_request.certificate_request.trim().is_empty(),
            EmptyRequestSnafu
        );

        let subject_override = sign_request.subject_override();
        let issued = engine
            .sign(
                sign_request.certificate_request.as_bytes(),
                profile,
                subject_override.as_ref(),
            )
            .context(SignSnafu)?;

        let certificate = issued.parse().context(ParseIssuedCertificateSnafu)?;
        info!(
            requester = requester.as_deref().unwrap_or_default(),
            label,
            profile = profile_name,
            serial = %certificate.tbs_certificate.serial_number,
            "signature"
        );

        Ok(issued)
    }

    fn record_failure(&self, result: Result<IssuedCertificate>) -> Result<IssuedCertificate> {
        if let Err(err) = &result {
            self.stats.increment_errors();

            let kind = err.kind();
            warn!(
                error = err as &dyn std::error::Error,
                %kind,
                status = kind.status_code(),
                public_message = err.public_message(),
                "failed to dispatch sign request"
            );
        }

        result
    }
}
