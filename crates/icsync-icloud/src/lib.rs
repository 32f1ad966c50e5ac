//! iCloud authentication and photos query layer
//!
//! Talks to the reverse-engineered private iCloud API:
//!
//! - [`auth`] - the typed login state machine (signin, MFA, trust, setup)
//! - [`mfa`] - MFA method definitions and the local HTTP intake server
//! - [`records`] - raw CloudKit-style wire types and the record parser
//! - [`client`] - paginated record queries, downloads and delete mutations
//! - [`remote`] - the [`RemoteLibrary`](icsync_core::ports::RemoteLibrary)
//!   implementation stitching auth and client together
//!
//! The API may shift under us at any time; every parse failure surfaces as
//! `UnexpectedResponse` rather than touching local state.

pub mod auth;
pub mod client;
pub mod mfa;
pub mod records;
pub mod remote;

pub use auth::{AuthState, ICloudAuth};
pub use client::PhotosClient;
pub use mfa::{MfaInput, MfaMethod, MfaServer};
pub use remote::ICloudRemote;

/// A fresh cookie store, shared between the auth machine and the photos
/// client so session cookies flow from setup into every query.
pub fn new_cookie_jar() -> std::sync::Arc<reqwest::cookie::Jar> {
    std::sync::Arc::new(reqwest::cookie::Jar::default())
}
