//! rbuild-lib: client library for a remote container image build service
//!
//! This crate provides everything the `rbuild` CLI drives:
//! - `archive`: deterministic tar archives of local build context files
//! - `client`: build submission, status, cancellation, output streaming and
//!   build-context upload
//! - `library`: library references and image transfer
//! - `endpoints`: frontend discovery of the build and library services
//! - `definition`: build spec resolution and `%files` source extraction
//! - `sign`: signing images with OpenPGP or Ed25519 keys
//! - `app`: the multi-architecture build orchestrator

pub mod app;
pub mod arch;
pub mod archive;
pub mod client;
pub mod consts;
pub mod definition;
pub mod endpoints;
pub mod library;
pub mod sign;
pub mod util;
