use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use multiroot_certs::{
    CertificatePairError, PrivateKeyType,
    ca::{CertificateAuthority, CreateCertificateAuthorityError},
    keys::{ecdsa, rsa},
};
use multiroot_shared::time::Duration;
use multiroot_telemetry::tracing::{TelemetryOptions, Tracing};
use multirootca::{
    auth::{self, CreateProviderError, Standard},
    config,
    dispatch::ErrorKind,
    request::SignatureResponse,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Reads from stdin instead of a file.
const STDIN_PATH: &str = "-";

const CA_CERTIFICATE_FILE: &str = "ca.pem";
const CA_PRIVATE_KEY_FILE: &str = "ca-key.pem";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize tracing"))]
    InitTracing {
        source: multiroot_telemetry::tracing::Error,
    },

    #[snafu(display("failed to read {path:?}"))]
    ReadInput {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to load the configuration"))]
    LoadConfig { source: config::Error },

    #[snafu(display("the sign request was rejected ({kind}): {message}"))]
    Dispatch {
        kind: ErrorKind,
        message: &'static str,
    },

    #[snafu(display("failed to serialize the output as JSON"))]
    SerializeJson { source: serde_json::Error },

    #[snafu(display("failed to write to stdout"))]
    WriteStdout { source: std::io::Error },

    #[snafu(display("failed to write to stderr"))]
    WriteStderr { source: std::io::Error },

    #[snafu(display("failed to create RSA certificate authority"))]
    CreateRsaCertificateAuthority {
        source: CreateCertificateAuthorityError<rsa::Error>,
    },

    #[snafu(display("failed to create ECDSA certificate authority"))]
    CreateEcdsaCertificateAuthority {
        source: CreateCertificateAuthorityError<ecdsa::Error>,
    },

    #[snafu(display("failed to encode the certificate authority"))]
    EncodeCertificateAuthority { source: CertificatePairError },

    #[snafu(display("failed to create output directory {path:?}"))]
    CreateOutputDir {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write {path:?}"))]
    WriteOutput {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to create authentication provider"))]
    CreateAuthProvider { source: CreateProviderError },

    #[snafu(display("failed to read the system clock"))]
    ReadClock,
}

#[derive(Debug, Parser)]
#[command(
    name = "multirootca",
    author,
    version,
    about = "Issues certificates from several independent CA identities"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    telemetry: TelemetryOptions,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dispatch one authenticated sign request and print the response as JSON.
    Sign(SignArguments),

    /// Create a self-signed root CA certificate and private key.
    GenCa(GenCaArguments),

    /// Wrap a sign request into an authenticated request.
    Token(TokenArguments),
}

#[derive(Debug, Args)]
struct SignArguments {
    /// The configuration FILE describing roots, policies and auth keys.
    #[arg(long, short, env = "MULTIROOTCA_CONFIG", value_name = "FILE")]
    config: PathBuf,

    /// The FILE containing the JSON authenticated request, `-` for stdin.
    #[arg(long, short, value_name = "FILE", default_value = STDIN_PATH)]
    envelope: PathBuf,

    /// Print the request and error counters as JSON to stderr afterwards.
    #[arg(long)]
    stats: bool,
}

#[derive(Debug, Args)]
struct GenCaArguments {
    /// The subject of the CA certificate, e.g. `CN=Example Root CA,O=Example`.
    #[arg(long)]
    subject: Option<String>,

    /// The type of the generated private key.
    #[arg(long, default_value_t = PrivateKeyType::Ecdsa)]
    key_type: PrivateKeyType,

    /// How long the CA certificate is valid, e.g. `1825d`.
    #[arg(long)]
    validity: Option<Duration>,

    /// How many intermediate CAs may follow the root, unlimited if unset.
    #[arg(long)]
    max_path_len: Option<u8>,

    /// The DIRECTORY the certificate and private key are written to.
    #[arg(long, value_name = "DIRECTORY", default_value = ".")]
    out_dir: PathBuf,
}

#[derive(Debug, Args)]
struct TokenArguments {
    /// The hex encoded authentication key.
    #[arg(long, env = "MULTIROOTCA_AUTH_KEY", hide_env_values = true)]
    key: String,

    /// The FILE containing the JSON sign request, `-` for stdin.
    #[arg(long, value_name = "FILE", default_value = STDIN_PATH)]
    request: PathBuf,

    /// Salt the token with the current time.
    #[arg(long)]
    timestamp: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    let _tracing_guard = Tracing::pre_configured(env!("CARGO_PKG_NAME"), cli.telemetry)
        .init()
        .context(InitTracingSnafu)?;

    match cli.command {
        Command::Sign(arguments) => sign(&arguments).await,
        Command::GenCa(arguments) => generate_ca(&arguments).await,
        Command::Token(arguments) => token(arguments).await,
    }
}

async fn sign(arguments: &SignArguments) -> Result<(), Error> {
    let dispatcher = config::load_dispatcher(&arguments.config)
        .await
        .context(LoadConfigSnafu)?;
    let envelope = read_input(&arguments.envelope).await?;

    let result = dispatcher.dispatch(&envelope);
    let snapshot = dispatcher.stats().snapshot();
    debug!(stats = ?snapshot, "dispatched sign request");
    if arguments.stats {
        write_all(tokio::io::stderr(), &to_json(&snapshot)?)
            .await
            .context(WriteStderrSnafu)?;
    }

    match result {
        Ok(issued) => write_stdout(&SignatureResponse {
            certificate: issued.into_pem(),
        })
        .await,
        Err(err) => {
            write_stdout(&err.to_response()).await?;
            DispatchSnafu {
                kind: err.kind(),
                message: err.public_message(),
            }
            .fail()
        }
    }
}

async fn generate_ca(arguments: &GenCaArguments) -> Result<(), Error> {
    let subject = arguments.subject.as_deref();

    let (certificate_pem, key_pem) = match arguments.key_type {
        PrivateKeyType::Rsa => {
            let ca = CertificateAuthority::builder_with_rsa()
                .maybe_subject(subject)
                .maybe_validity(arguments.validity)
                .maybe_max_path_len(arguments.max_path_len)
                .build()
                .context(CreateRsaCertificateAuthoritySnafu)?;
            let pair = ca.certificate_pair();

            (
                pair.certificate_pem()
                    .context(EncodeCertificateAuthoritySnafu)?,
                pair.private_key_pem()
                    .context(EncodeCertificateAuthoritySnafu)?,
            )
        }
        PrivateKeyType::Ecdsa => {
            let ca = CertificateAuthority::builder_with_ecdsa()
                .maybe_subject(subject)
                .maybe_validity(arguments.validity)
                .maybe_max_path_len(arguments.max_path_len)
                .build()
                .context(CreateEcdsaCertificateAuthoritySnafu)?;
            let pair = ca.certificate_pair();

            (
                pair.certificate_pem()
                    .context(EncodeCertificateAuthoritySnafu)?,
                pair.private_key_pem()
                    .context(EncodeCertificateAuthoritySnafu)?,
            )
        }
    };

    let out_dir = &arguments.out_dir;
    tokio::fs::create_dir_all(out_dir)
        .await
        .context(CreateOutputDirSnafu { path: out_dir })?;

    let certificate_path = out_dir.join(CA_CERTIFICATE_FILE);
    write_file(&certificate_path, certificate_pem.as_bytes(), false).await?;

    let key_path = out_dir.join(CA_PRIVATE_KEY_FILE);
    write_file(&key_path, key_pem.as_bytes(), true).await?;

    info!(
        certificate = %certificate_path.display(),
        private_key = %key_path.display(),
        key_type = %arguments.key_type,
        "created certificate authority"
    );
    Ok(())
}

async fn token(arguments: TokenArguments) -> Result<(), Error> {
    let key = Zeroizing::new(arguments.key);
    let provider = Standard::from_hex(&key).context(CreateAuthProviderSnafu)?;
    let request = read_input(&arguments.request).await?;

    let timestamp = if arguments.timestamp {
        Some(auth::unix_timestamp().context(ReadClockSnafu)?)
    } else {
        None
    };

    write_stdout(&provider.authenticate(request, timestamp)).await
}

async fn read_input(path: &Path) -> Result<Vec<u8>, Error> {
    if path == Path::new(STDIN_PATH) {
        let mut input = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut input)
            .await
            .context(ReadInputSnafu { path })?;
        return Ok(input);
    }

    tokio::fs::read(path).await.context(ReadInputSnafu { path })
}

async fn write_stdout<T: serde::Serialize>(value: &T) -> Result<(), Error> {
    write_all(tokio::io::stdout(), &to_json(value)?)
        .await
        .context(WriteStdoutSnafu)
}

/// Pretty printed JSON followed by a newline.
fn to_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let mut output = serde_json::to_vec_pretty(value).context(SerializeJsonSnafu)?;
    output.push(b'\n');
    Ok(output)
}

async fn write_all<W>(mut writer: W, output: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(output).await?;
    writer.flush().await
}

/// Writes `content` to `path`, readable only by the owner if `private`.
async fn write_file(path: &Path, content: &[u8], private: bool) -> Result<(), Error> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options
        .open(path)
        .await
        .context(WriteOutputSnafu { path })?;
    file.write_all(content)
        .await
        .context(WriteOutputSnafu { path })?;
    file.flush().await.context(WriteOutputSnafu { path })
}
