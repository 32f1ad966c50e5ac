//! Integration tests for the iCloud auth and query layers
//!
//! All HTTP surfaces are mocked with wiremock; no test talks to Apple.

mod common;
mod test_auth;
mod test_query;
