//! AuthGate - login-gated reverse proxy for a supervised backend process.
//!
//! The gateway authenticates browser sessions against a fixed credential set,
//! keeps one backend process alive on a local address, and forwards
//! authenticated traffic to it. Backend failures are translated into a small
//! set of generic gateway error responses.
//!
//! # Request path
//!
//! - `/login`, `/logout`: handled by [`auth::AuthGateway`].
//! - everything else: session checked, then handed to
//!   [`forwarder::Forwarder`], which asks
//!   [`supervisor::ProcessSupervisor`] for a ready backend first.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod forwarder;
pub mod gateway_service;
pub mod logging_layer;
pub mod login_page;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod timeout;
