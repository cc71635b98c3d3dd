//! OpenVPN integration
//!
//! samlvpn never speaks the VPN protocol itself. It reads the gateway
//! endpoint out of the OpenVPN client config and then runs a SAML-capable
//! OpenVPN binary with the credentials obtained from the browser.
//!
//! # Usage
//!
//! ```bash
//! openvpn --config client.ovpn --auth-user-pass ~/.cache/samlvpn-credentials
//! ```

pub mod config;
pub mod supervisor;

pub use config::{parse_openvpn_config, Endpoint, ParseError};
pub use supervisor::{
    ProcessOutcome, ProcessSupervisor, RunningClient, SupervisorError, AUTH_FAILED_MARKER,
};
