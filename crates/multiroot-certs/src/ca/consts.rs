use const_format::concatcp;
use multiroot_shared::time::Duration;

/// The default CA validity time span of five years (43800 hours).
pub const DEFAULT_CA_VALIDITY: Duration = Duration::from_hours_unchecked(43800);

/// The common name of root CAs created without an explicit subject.
pub const ROOT_CA_COMMON_NAME: &str = "Multiroot Internal Root CA";

/// The root CA subject name containing only the common name.
pub const ROOT_CA_SUBJECT: &str = concatcp!("CN=", ROOT_CA_COMMON_NAME);
