//! Integration tests for kube-envtest
//!
//! # Test Organization
//!
//! - `namespace`: namespaces created through the environment are unique and
//!   real objects on the API server
//!
//! - `lifecycle`: a full run with CRDs, an indexer and a reconciler, checking
//!   that the test body sees warm caches and a working controller
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod helpers;
mod lifecycle;
mod namespace;
