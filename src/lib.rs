//! samlvpn - OpenVPN login through a browser-based SAML flow
//!
//! This crate drives a SAML-capable OpenVPN client. It sends the user's
//! browser to the VPN gateway's SAML login, catches the SAML response on a
//! local HTTP listener, and hands it to OpenVPN through a short-lived
//! credentials file.
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `auth`: Authorization URL, browser launch and the callback listener
//! - `credentials`: The temporary `--auth-user-pass` file
//! - `openvpn`: OpenVPN config parsing and process supervision
//! - `session`: Attempts, retries and cleanup
//! - `platform`: OS-specific file and process handling
//! - `signal`: Ctrl+C handling
//!
//! # Usage
//!
//! ```bash
//! samlvpn init
//! $EDITOR samlvpn.toml
//! samlvpn connect
//! ```

pub mod auth;
pub mod config;
pub mod credentials;
pub mod openvpn;
pub mod platform;
pub mod session;
pub mod signal;

pub use config::Config;
pub use session::{Session, SessionError, SessionReport};
