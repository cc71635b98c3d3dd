//! Opening the authorization URL in a browser

use crate::config::URL_MARKER;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Browser command is empty")]
    EmptyCommand,
    #[error("Browser command has no %s placeholder")]
    MissingMarker,
    #[error("Failed to start browser command {program}: {source}")]
    SpawnError {
        program: String,
        source: std::io::Error,
    },
}

/// Something that can show the authorization URL to the user
pub trait Browser: Send + Sync {
    fn open(&self, url: &Url) -> Result<(), BrowserError>;
}

/// Runs (or prints) the configured browser command
pub struct CommandBrowser {
    template: Vec<String>,
    run_command: bool,
}

impl CommandBrowser {
    pub fn new(template: Vec<String>, run_command: bool) -> Self {
        Self {
            template,
            run_command,
        }
    }

    /// The browser command with the placeholder replaced by `url`
    pub fn command_line(&self, url: &Url) -> Result<Vec<String>, BrowserError> {
        if self.template.is_empty() {
            return Err(BrowserError::EmptyCommand);
        }
        if !self.template.iter().any(|arg| arg == URL_MARKER) {
            return Err(BrowserError::MissingMarker);
        }

        Ok(self
            .template
            .iter()
            .map(|arg| {
                if arg == URL_MARKER {
                    url.to_string()
                } else {
                    arg.clone()
                }
            })
            .collect())
    }
}

impl Browser for CommandBrowser {
    fn open(&self, url: &Url) -> Result<(), BrowserError> {
        let command_line = self.command_line(url)?;

        if !self.run_command {
            info!("Run the following command to log in:");
            println!("{}", shell_join(&command_line));
            return Ok(());
        }

        let program = &command_line[0];
        debug!("Running browser command: {}", program);
        let mut child = Command::new(program)
            .args(&command_line[1..])
            .spawn()
            .map_err(|source| BrowserError::SpawnError {
                program: program.clone(),
                source,
            })?;

        // Some browsers only return once their window closes, so the exit
        // status is only reported, never waited on.
        let program = program.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!("{} exited", program),
                Ok(status) => warn!("Browser command {} exited with {}", program, status),
                Err(e) => warn!("Failed to wait for browser command {}: {}", program, e),
            }
        });

        Ok(())
    }
}

/// Join arguments into a line that can be pasted into a POSIX shell
pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
