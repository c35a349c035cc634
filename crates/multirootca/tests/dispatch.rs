//! End-to-end dispatching: envelopes in, certificates or classified errors
//! out, across an ECDSA and an RSA root.
use std::{collections::HashMap, sync::Arc};

use multiroot_certs::{
    ca::CertificateAuthority,
    keys::{CertificateKeypair, ecdsa, rsa},
    policy::{Policy, SigningProfile},
    sign::{SignatureAlgorithm, SigningEngine, SubjectName, verify::verify_signed_by},
};
use multiroot_shared::time::Duration;
use multirootca::{
    auth::{Provider, Standard},
    dispatch::{Dispatcher, ErrorKind},
    request::{AuthenticatedRequest, SignRequest, Subject},
};
use p521::ecdsa::signature::Signer as _;
use rstest::{fixture, rstest};
use x509_cert::{
    Certificate,
    builder::{Builder, RequestBuilder},
    der::{Decode, Encode, EncodePem, asn1::BitString, oid::AssociatedOid, pem::LineEnding},
    ext::pkix::{SubjectAltName, name::GeneralName},
    request::{CertReq, CertReqInfo, Version},
    spki::SubjectPublicKeyInfoOwned,
};

const TEST_RSA_KEY_SIZE: usize = 2048;
const PRIMARY_KEY: &[u8] = b"primary secret";
const SECONDARY_KEY: &[u8] = b"secondary secret";

struct Fixture {
    dispatcher: Dispatcher,
    primary: Standard,
    secondary: Standard,
}

fn policy(auth_key: &str) -> Policy {
    Policy::new(
        SigningProfile::new(
            ["digital signature", "key encipherment", "server auth"],
            Duration::from_days_unchecked(30),
        )
        .with_auth_key(auth_key),
    )
    .with_profile(
        "client",
        SigningProfile::new(["digital signature", "client auth"], Duration::from_days_unchecked(7))
            .with_auth_key(auth_key),
    )
    .with_profile(
        "open",
        SigningProfile::new(["digital signature"], Duration::from_days_unchecked(1)),
    )
}

#[fixture]
fn setup() -> Fixture {
    let primary_ca = CertificateAuthority::builder_with_ecdsa()
        .subject("CN=Primary Root")
        .build()
        .unwrap();
    let secondary_ca = CertificateAuthority::builder_with_rsa()
        .subject("CN=Secondary Root")
        .signing_key_pair(rsa::SigningKey::with_key_size(TEST_RSA_KEY_SIZE).unwrap())
        .build()
        .unwrap();

    let engines = HashMap::from([
        (
            "primary".to_owned(),
            SigningEngine::from_certificate_authority(primary_ca, policy("primary-key")).unwrap(),
        ),
        (
            "secondary".to_owned(),
            SigningEngine::from_certificate_authority(secondary_ca, policy("secondary-key"))
                .unwrap(),
        ),
    ]);

    let primary = Standard::new(PRIMARY_KEY).unwrap();
    let secondary = Standard::new(SECONDARY_KEY).unwrap();
    let providers: HashMap<String, Arc<dyn Provider>> = HashMap::from([
        (
            "primary-key".to_owned(),
            Arc::new(primary.clone()) as Arc<dyn Provider>,
        ),
        (
            "secondary-key".to_owned(),
            Arc::new(secondary.clone()) as Arc<dyn Provider>,
        ),
    ]);

    let dispatcher = Dispatcher::builder()
        .default_label("primary")
        .engines(engines)
        .providers(providers)
        .build()
        .unwrap();

    Fixture {
        dispatcher,
        primary,
        secondary,
    }
}

fn ecdsa_csr(subject: &str) -> String {
    let key = ecdsa::SigningKey::new().unwrap();
    RequestBuilder::new(subject.parse().unwrap(), key.signing_key())
        .unwrap()
        .build::<p256::ecdsa::DerSignature>()
        .unwrap()
        .to_pem(LineEnding::LF)
        .unwrap()
}

fn rsa_csr(subject: &str) -> String {
    RequestKey::Rsa(TEST_RSA_KEY_SIZE).csr(subject)
}

#[derive(Clone, Copy, Debug)]
enum RequestKey {
    Rsa(usize),
    P256,
    P384,
    P521,
}

impl RequestKey {
    /// Creates a PEM-encoded CSR signed by a fresh key of this type.
    fn csr(self, subject: &str) -> String {
        let subject = subject.parse().unwrap();

        match self {
            Self::Rsa(key_size) => {
                let key = rsa::SigningKey::with_key_size(key_size).unwrap();
                RequestBuilder::new(subject, key.signing_key())
                    .unwrap()
                    .build::<::rsa::pkcs1v15::Signature>()
                    .unwrap()
                    .to_pem(LineEnding::LF)
                    .unwrap()
            }
            Self::P256 => {
                let key = p256::ecdsa::SigningKey::random(&mut rand_core::OsRng);
                RequestBuilder::new(subject, &key)
                    .unwrap()
                    .build::<p256::ecdsa::DerSignature>()
                    .unwrap()
                    .to_pem(LineEnding::LF)
                    .unwrap()
            }
            Self::P384 => {
                let key = p384::ecdsa::SigningKey::random(&mut rand_core::OsRng);
                RequestBuilder::new(subject, &key)
                    .unwrap()
                    .build::<p384::ecdsa::DerSignature>()
                    .unwrap()
                    .to_pem(LineEnding::LF)
                    .unwrap()
            }
            Self::P521 => {
                let key = p521::ecdsa::SigningKey::random(&mut rand_core::OsRng);
                let public_key = p521::PublicKey::from_secret_scalar(key.as_nonzero_scalar());
                let info = CertReqInfo {
                    version: Version::V1,
                    subject,
                    public_key: SubjectPublicKeyInfoOwned::from_key(public_key).unwrap(),
                    attributes: Default::default(),
                };
                let signature: p521::ecdsa::Signature = key.sign(&info.to_der().unwrap());

                CertReq {
                    info,
                    algorithm: SignatureAlgorithm::EcdsaWithSha512.algorithm_identifier(),
                    signature: BitString::from_bytes(signature.to_der().as_bytes()).unwrap(),
                }
                .to_pem(LineEnding::LF)
                .unwrap()
            }
        }
    }
}

fn sign_request(label: &str, profile: &str, csr: String) -> SignRequest {
    SignRequest {
        certificate_request: csr,
        label: label.to_owned(),
        profile: profile.to_owned(),
        ..Default::default()
    }
}

fn envelope(provider: &Standard, request: &SignRequest) -> AuthenticatedRequest {
    provider.authenticate(serde_json::to_vec(request).unwrap(), None)
}

fn dns_names(certificate: &Certificate) -> Vec<String> {
    certificate
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .filter(|extension| extension.extn_id == SubjectAltName::OID)
        .flat_map(|extension| SubjectAltName::from_der(extension.extn_value.as_bytes()).unwrap().0)
        .filter_map(|name| match name {
            GeneralName::DnsName(name) => Some(name.to_string()),
            _ => None,
        })
        .collect()
}

#[rstest]
fn sign_with_rsa_root(setup: Fixture) {
    let request = sign_request("secondary", "", rsa_csr("CN=example.com"));

    let issued = setup
        .dispatcher
        .dispatch_authenticated(&envelope(&setup.secondary, &request))
        .unwrap();
    let certificate = issued.parse().unwrap();

    let engine = setup.dispatcher.engine("secondary").unwrap();
    assert_eq!(certificate.tbs_certificate.subject.to_string(), "CN=example.com");
    assert_eq!(certificate.tbs_certificate.issuer, *engine.subject());
    verify_signed_by(&certificate, engine.certificate()).unwrap();
}

#[rstest]
fn sign_request_of_every_key_type(
    setup: Fixture,
    #[values(
        RequestKey::Rsa(2048),
        RequestKey::Rsa(3072),
        RequestKey::Rsa(4096),
        RequestKey::P256,
        RequestKey::P384,
        RequestKey::P521
    )]
    request_key: RequestKey,
    #[values("primary", "secondary")] label: &str,
) {
    let request = sign_request(label, "", request_key.csr("CN=example.com"));
    let provider = match label {
        "primary" => &setup.primary,
        _ => &setup.secondary,
    };

    let issued = setup
        .dispatcher
        .dispatch_authenticated(&envelope(provider, &request))
        .unwrap();
    let certificate = issued.parse().unwrap();

    let engine = setup.dispatcher.engine(label).unwrap();
    assert_eq!(certificate.tbs_certificate.subject.to_string(), "CN=example.com");
    verify_signed_by(&certificate, engine.certificate()).unwrap();
    assert_eq!(setup.dispatcher.stats().snapshot().errors, 0);
}

#[rstest]
fn empty_label_selects_default_label(setup: Fixture) {
    let request = sign_request("", "client", ecdsa_csr("CN=client.example"));

    let issued = setup
        .dispatcher
        .dispatch_authenticated(&envelope(&setup.primary, &request))
        .unwrap();

    let primary = setup.dispatcher.engine("primary").unwrap();
    verify_signed_by(&issued.parse().unwrap(), primary.certificate()).unwrap();
    assert_eq!(
        setup.dispatcher.stats().snapshot().label_requests["primary"],
        1
    );
}

#[rstest]
fn dispatch_json_envelope(setup: Fixture) {
    let request = sign_request("primary", "", ecdsa_csr("CN=json.example"));
    let bytes = serde_json::to_vec(&envelope(&setup.primary, &request)).unwrap();

    let issued = setup.dispatcher.dispatch(&bytes).unwrap();

    assert_eq!(
        issued.parse().unwrap().tbs_certificate.subject.to_string(),
        "CN=json.example"
    );
}

#[rstest]
fn subject_override_replaces_name_and_hosts(setup: Fixture) {
    let mut request = sign_request("primary", "", ecdsa_csr("CN=requested.example"));
    request.hosts = vec!["ignored.example".to_owned()];
    request.subject = Some(Subject {
        name: SubjectName::with_common_name("override.example"),
        hosts: Some(vec![
            "override.example".to_owned(),
            "www.override.example".to_owned(),
        ]),
    });

    let issued = setup
        .dispatcher
        .dispatch_authenticated(&envelope(&setup.primary, &request))
        .unwrap();
    let certificate = issued.parse().unwrap();

    assert_eq!(
        certificate.tbs_certificate.subject.to_string(),
        "CN=override.example"
    );
    assert_eq!(dns_names(&certificate), [
        "override.example",
        "www.override.example"
    ]);
}

#[rstest]
fn hosts_replace_requested_alt_names(setup: Fixture) {
    let mut request = sign_request("primary", "", ecdsa_csr("CN=requested.example"));
    request.hosts = vec!["hosts.example".to_owned()];

    let issued = setup
        .dispatcher
        .dispatch_authenticated(&envelope(&setup.primary, &request))
        .unwrap();
    let certificate = issued.parse().unwrap();

    assert_eq!(
        certificate.tbs_certificate.subject.to_string(),
        "CN=requested.example"
    );
    assert_eq!(dns_names(&certificate), ["hosts.example"]);
}

#[rstest]
fn serial_numbers_are_unique(setup: Fixture) {
    let request = sign_request("primary", "", ecdsa_csr("CN=twice.example"));
    let envelope = envelope(&setup.primary, &request);

    let first = setup.dispatcher.dispatch_authenticated(&envelope).unwrap();
    let second = setup.dispatcher.dispatch_authenticated(&envelope).unwrap();
    let (first, second) = (first.parse().unwrap(), second.parse().unwrap());

    assert_ne!(
        first.tbs_certificate.serial_number,
        second.tbs_certificate.serial_number
    );

    let primary = setup.dispatcher.engine("primary").unwrap();
    verify_signed_by(&first, primary.certificate()).unwrap();
    verify_signed_by(&second, primary.certificate()).unwrap();
}

#[rstest]
#[case::token_of_other_key("primary", "", true, ErrorKind::Unauthorized)]
#[case::unknown_label("tertiary", "", false, ErrorKind::UnknownLabel)]
#[case::profile_without_auth_key("primary", "open", false, ErrorKind::Unauthorized)]
#[case::unknown_profile("primary", "missing", false, ErrorKind::Internal)]
fn rejected_requests(
    setup: Fixture,
    #[case] label: &str,
    #[case] profile: &str,
    #[case] use_other_key: bool,
    #[case] expected: ErrorKind,
) {
    let request = sign_request(label, profile, ecdsa_csr("CN=rejected.example"));
    let provider = if use_other_key {
        &setup.secondary
    } else {
        &setup.primary
    };

    let err = setup
        .dispatcher
        .dispatch_authenticated(&envelope(provider, &request))
        .unwrap_err();

    assert_eq!(err.kind(), expected);
}

#[rstest]
fn tampered_request_is_unauthorized(setup: Fixture) {
    let request = sign_request("primary", "", ecdsa_csr("CN=tampered.example"));
    let mut envelope = envelope(&setup.primary, &request);

    let tampered = sign_request("primary", "client", ecdsa_csr("CN=tampered.example"));
    envelope.request = serde_json::to_vec(&tampered).unwrap();

    let err = setup
        .dispatcher
        .dispatch_authenticated(&envelope)
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert_eq!(err.public_message(), "invalid token");
}

#[rstest]
fn empty_certificate_request_is_bad_request(setup: Fixture) {
    let request = sign_request("primary", "", String::new());

    let err = setup
        .dispatcher
        .dispatch_authenticated(&envelope(&setup.primary, &request))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert_eq!(err.public_message(), "invalid request");
}

#[rstest]
fn garbage_certificate_request_is_bad_request(setup: Fixture) {
    let request = sign_request("primary", "", "not a CSR".to_owned());

    let err = setup
        .dispatcher
        .dispatch_authenticated(&envelope(&setup.primary, &request))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[rstest]
#[case::not_json(b"not json".as_slice())]
#[case::missing_token(br#"{"request":"e30="}"#.as_slice())]
fn malformed_envelope(setup: Fixture, #[case] bytes: &[u8]) {
    let err = setup.dispatcher.dispatch(bytes).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Malformed);
    assert_eq!(err.to_response().error.status, 400);
}

#[rstest]
fn malformed_sign_request(setup: Fixture) {
    let envelope = setup.primary.authenticate(b"not json".to_vec(), None);

    let err = setup
        .dispatcher
        .dispatch_authenticated(&envelope)
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Malformed);
}

#[rstest]
fn stats_count_requests_and_errors(setup: Fixture) {
    let good = sign_request("primary", "", ecdsa_csr("CN=stats.example"));
    let unknown = sign_request("tertiary", "", ecdsa_csr("CN=stats.example"));

    for request in [&good, &good, &good, &unknown] {
        let _ = setup
            .dispatcher
            .dispatch_authenticated(&envelope(&setup.primary, request));
    }

    let snapshot = setup.dispatcher.stats().snapshot();
    assert_eq!(snapshot.total_requests, 4);
    assert_eq!(snapshot.errors, 1);
    assert_eq!(snapshot.error_percent, 25.0);
    assert_eq!(snapshot.label_requests["primary"], 3);
    assert_eq!(snapshot.label_requests["secondary"], 0);
    assert_eq!(snapshot.unknown_label_requests, 1);
}

#[rstest]
fn unknown_auth_key_is_rejected_at_build_time() {
    let ca = CertificateAuthority::builder_with_ecdsa().build().unwrap();
    let engine = SigningEngine::from_certificate_authority(ca, policy("nobody")).unwrap();

    let result = Dispatcher::builder()
        .default_label("primary")
        .engines(HashMap::from([("primary".to_owned(), engine)]))
        .build();

    assert!(result.is_err());
}
