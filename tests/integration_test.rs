// tests/integration_test.rs

//! Integration tests for the AHA fabric.
//!
//! These tests run real listeners and sessions end-to-end: registration,
//! liveness, pools, mirrors, provisioning, and the HTTP API.

mod integration;
