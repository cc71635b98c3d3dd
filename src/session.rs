//! The login-and-connect session
//!
//! One session runs a bounded number of attempts. Each attempt:
//!
//! 1. Binds a fresh callback listener and opens the authorization URL
//! 2. Waits for the SAML callback (a timeout here ends the session)
//! 3. Writes the credentials file and runs OpenVPN with it
//! 4. Deletes the credentials file once OpenVPN is gone
//!
//! If OpenVPN reports AUTH_FAILED the next attempt starts from step 1, until
//! `auth-failed-retries` is used up.
//!
//! # Error Handling
//!
//! Configuration problems are reported before any attempt starts, all in
//! one go. Every other error ends the session; the credentials file and the
//! OpenVPN process never outlive it.

use crate::auth::{
    authorization_url, Browser, CallbackError, CallbackListener, CommandBrowser, UrlError,
};
use crate::config::{Config, ConfigError};
use crate::credentials::{CredentialError, CredentialStore};
use crate::openvpn::{Endpoint, ProcessOutcome, ProcessSupervisor, SupervisorError};
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid configuration:{}", format_config_errors(.0))]
    Config(Vec<ConfigError>),
    #[error("Cannot build authorization URL: {0}")]
    Url(#[from] UrlError),
    #[error("Callback listener error: {0}")]
    Callback(#[from] CallbackError),
    #[error("No SAML callback received within {timeout:?} on attempt {attempt}")]
    CallbackTimeout { attempt: u32, timeout: Duration },
    #[error("OpenVPN reported AUTH_FAILED on all {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("OpenVPN launch failed: {0}")]
    Launch(#[from] SupervisorError),
    #[error("Credentials file error: {0}")]
    Credential(#[from] CredentialError),
    #[error("Interrupted")]
    Interrupted,
}

fn format_config_errors(errors: &[ConfigError]) -> String {
    errors.iter().map(|e| format!("\n  - {}", e)).collect()
}

/// Where the session is in the login/connect cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingCallback,
    CredentialReady,
    Launching,
    Running,
    AttemptFailed,
    Retrying,
    Succeeded,
    Exhausted,
    Done,
}

struct StateMachine {
    current: SessionState,
}

impl StateMachine {
    fn to(&mut self, next: SessionState) {
        debug!("Session state: {:?} -> {:?}", self.current, next);
        self.current = next;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    AuthFailed,
    Failed,
}

/// A finished attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptState {
    pub number: u32,
    pub outcome: AttemptOutcome,
}

/// Result of a session that got OpenVPN to run to completion
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub attempts: u32,
    pub status: ExitStatus,
    pub elapsed: Duration,
}

impl SessionReport {
    /// OpenVPN's exit code, 1 if it was killed by a signal
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(1)
    }
}

pub struct Session {
    config: Config,
    endpoint: Endpoint,
    browser: Box<dyn Browser>,
    supervisor: ProcessSupervisor,
    store: CredentialStore,
    state: StateMachine,
    history: Vec<AttemptState>,
}

impl Session {
    /// Validate the configuration and prepare a session
    ///
    /// Nothing is bound or spawned here. The settings, the OpenVPN config
    /// and the authorization URL are all checked, and every problem found
    /// is reported together.
    pub fn new(config: Config) -> Result<Self, SessionError> {
        let mut errors = config.validate();

        // A missing file has already been reported by validate()
        let mut endpoint = None;
        if config.openvpn_config_file.exists() {
            match Endpoint::from_file(&config.openvpn_config_file) {
                Ok(parsed) => {
                    if let Err(e) = authorization_url(&parsed, config.server_address) {
                        errors.push(e.into());
                    }
                    endpoint = Some(parsed);
                }
                Err(e) => errors.push(e.into()),
            }
        }

        let endpoint = match endpoint {
            Some(endpoint) if errors.is_empty() => endpoint,
            _ => return Err(SessionError::Config(errors)),
        };

        let browser = Box::new(CommandBrowser::new(
            config.browser_command.clone(),
            config.run_command,
        ));
        Ok(Self::with_browser(config, endpoint, browser))
    }

    pub fn with_browser(config: Config, endpoint: Endpoint, browser: Box<dyn Browser>) -> Self {
        let supervisor = ProcessSupervisor::new(
            config.openvpn_binary.clone(),
            config.openvpn_config_file.clone(),
        );
        let store = CredentialStore::new(
            config.temp_credentials_file_path.clone(),
            config.temp_credentials_permissions,
        );

        Self {
            config,
            endpoint,
            browser,
            supervisor,
            store,
            state: StateMachine {
                current: SessionState::Idle,
            },
            history: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.state.current
    }

    /// Attempts finished so far, oldest first
    pub fn attempts(&self) -> &[AttemptState] {
        &self.history
    }

    /// The authorization URL for the configured listener address
    pub fn preview_url(&self) -> Result<Url, SessionError> {
        Ok(authorization_url(&self.endpoint, self.config.server_address)?)
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.auth_failed_retries.saturating_add(1)
    }

    /// Run attempts until OpenVPN exits normally or the session fails
    pub async fn run(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionReport, SessionError> {
        let started = Instant::now();
        let max_attempts = self.max_attempts();
        info!(
            "Connecting to {} (up to {} attempts)",
            self.endpoint, max_attempts
        );

        for number in 1..=max_attempts {
            let result = self.run_attempt(number, shutdown).await;
            let outcome = match &result {
                Ok(ProcessOutcome::Exited(_)) => AttemptOutcome::Succeeded,
                Ok(ProcessOutcome::AuthFailed) => AttemptOutcome::AuthFailed,
                Ok(ProcessOutcome::Interrupted) | Err(_) => AttemptOutcome::Failed,
            };
            self.history.push(AttemptState { number, outcome });
            debug!("Attempt {}/{} finished: {:?}", number, max_attempts, outcome);

            match result? {
                ProcessOutcome::Exited(status) => {
                    self.state.to(SessionState::Succeeded);
                    info!("OpenVPN exited with {}", status);
                    self.state.to(SessionState::Done);
                    return Ok(SessionReport {
                        attempts: number,
                        status,
                        elapsed: started.elapsed(),
                    });
                }
                ProcessOutcome::AuthFailed => {
                    self.state.to(SessionState::AttemptFailed);
                    if number < max_attempts {
                        warn!(
                            "Authentication failed on attempt {}/{}, retrying",
                            number, max_attempts
                        );
                        self.state.to(SessionState::Retrying);
                    }
                }
                ProcessOutcome::Interrupted => return Err(SessionError::Interrupted),
            }
        }

        self.state.to(SessionState::Exhausted);
        Err(SessionError::RetriesExhausted {
            attempts: max_attempts,
        })
    }

    async fn run_attempt(
        &mut self,
        number: u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ProcessOutcome, SessionError> {
        self.state.to(SessionState::AwaitingCallback);

        let listener =
            CallbackListener::bind(self.config.server_address, self.config.redirect_url.clone())
                .await?;
        let url = authorization_url(&self.endpoint, listener.local_addr())?;

        if let Err(e) = self.browser.open(&url) {
            warn!("{}", e);
            println!("Open this URL in your browser to log in:\n{}", url);
        }

        let timeout = self.config.server_timeout();
        let credential = match listener.wait(timeout, shutdown).await {
            Ok(credential) => credential,
            Err(CallbackError::Timeout(timeout)) => {
                self.state.to(SessionState::Exhausted);
                return Err(SessionError::CallbackTimeout {
                    attempt: number,
                    timeout,
                });
            }
            Err(CallbackError::Interrupted) => return Err(SessionError::Interrupted),
            Err(e) => return Err(e.into()),
        };
        self.state.to(SessionState::CredentialReady);

        let file = self.store.save(credential)?;
        self.state.to(SessionState::Launching);
        let result = match self.supervisor.spawn(file.path()) {
            Ok(client) => {
                self.state.to(SessionState::Running);
                client.supervise(shutdown).await
            }
            Err(e) => Err(e),
        };

        let released = file.release();
        if let (Err(_), Err(e)) = (&result, &released) {
            warn!("{}", e);
        }
        let outcome = result?;
        released?;

        Ok(outcome)
    }
}
