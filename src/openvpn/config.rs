//! OpenVPN client config scanning
//!
//! Only the directives needed to build the authorization URL are read:
//!
//! | Directive | Example | Description |
//! |-----------|---------|-------------|
//! | `remote` | `remote vpn.example.com 443` | Gateway host and port |
//! | `proto` | `proto udp` | Transport protocol |
//!
//! Everything else in the file is ignored.

use std::fmt;
use std::io::BufRead;
use std::path::Path;
use thiserror::Error;

/// Protocol OpenVPN uses when the config has no `proto` line
pub const DEFAULT_PROTOCOL: &str = "udp";

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to read OpenVPN config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("remote line {line} does not include host and port")]
    MalformedRemote { line: usize },
    #[error("remote line {line} has invalid port: {value}")]
    InvalidPort { line: usize, value: String },
    #[error("OpenVPN config has no remote directive")]
    MissingRemote,
}

/// The VPN gateway as described by the OpenVPN config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: String,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.host, self.port, self.protocol)
    }
}

impl Endpoint {
    pub fn from_file(path: &Path) -> Result<Self, ParseError> {
        let file = std::fs::File::open(path)?;
        parse_openvpn_config(std::io::BufReader::new(file))
    }
}

/// Scan OpenVPN config text for the gateway endpoint
///
/// A `remote` line must carry exactly a host and a port. Later directives
/// override earlier ones.
pub fn parse_openvpn_config<R: BufRead>(reader: R) -> Result<Endpoint, ParseError> {
    let mut remote: Option<(String, u16)> = None;
    let mut protocol: Option<String> = None;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = index + 1;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }

        match parts[0] {
            "remote" => {
                if parts.len() != 3 {
                    return Err(ParseError::MalformedRemote { line: line_no });
                }
                let port = parts[2].parse().map_err(|_| ParseError::InvalidPort {
                    line: line_no,
                    value: parts[2].to_string(),
                })?;
                remote = Some((parts[1].to_string(), port));
            }
            "proto" => protocol = Some(parts[1].to_string()),
            _ => {}
        }
    }

    let (host, port) = remote.ok_or(ParseError::MissingRemote)?;

    Ok(Endpoint {
        host,
        port,
        protocol: protocol.unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
    })
}
