//! A certificate authority serving several independent CA identities, each
//! one selected by a label and governed by its own signing policy.
//!
//! The [`Dispatcher`](dispatch::Dispatcher) is the entry point. It takes an
//! authenticated sign request, picks the signing engine and profile, checks
//! the request token and hands the CSR to the engine. How requests reach the
//! dispatcher is up to the caller, the `multirootca` binary reads them from
//! files or stdin.
//!
//! ```no_run
//! use std::path::Path;
//!
//! # async fn run() -> Result<(), multirootca::config::Error> {
//! let dispatcher = multirootca::config::load_dispatcher(Path::new("multirootca.yaml")).await?;
//! # let envelope = b"{}";
//! match dispatcher.dispatch(envelope) {
//!     Ok(issued) => println!("{issued}"),
//!     Err(err) => eprintln!("{}", err.public_message()),
//! }
//! # Ok(())
//! # }
//! ```
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod request;
pub mod stats;
