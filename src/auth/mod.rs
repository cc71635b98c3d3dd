//! SAML login through the user's browser
//!
//! The browser is pointed at the VPN gateway's SAML endpoint. Once the
//! identity provider is done, the browser posts the SAML response back to a
//! local listener, which hands it over as a [`Credential`].

pub mod authorization;
pub mod browser;
pub mod callback;

use std::fmt;

pub use authorization::{authorization_url, UrlError};
pub use browser::{Browser, BrowserError, CommandBrowser};
pub use callback::{CallbackError, CallbackListener};

/// Username OpenVPN expects alongside a SAML response
pub const SAML_USERNAME: &str = "N/A";

/// Username and secret handed to OpenVPN
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub secret: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// Contents for an OpenVPN `--auth-user-pass` file
    pub fn to_auth_user_pass(&self) -> String {
        format!("{}\n{}\n", self.username, self.secret)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}
