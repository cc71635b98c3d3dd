//! Authorization URL construction

use crate::openvpn::Endpoint;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum UrlError {
    #[error("Endpoint host is empty")]
    EmptyHost,
    #[error("Endpoint port must not be 0")]
    ZeroPort,
    #[error("Invalid authorization URL for {host}: {source}")]
    Invalid { host: String, source: url::ParseError },
}

/// Build the URL the browser opens to start the SAML login
///
/// The gateway redirects to the identity provider and the resulting SAML
/// response is posted to `callback`. A wildcard bind address is swapped for
/// loopback, since that's where the browser can reach the listener.
pub fn authorization_url(endpoint: &Endpoint, callback: SocketAddr) -> Result<Url, UrlError> {
    if endpoint.host.trim().is_empty() {
        return Err(UrlError::EmptyHost);
    }
    if endpoint.port == 0 {
        return Err(UrlError::ZeroPort);
    }

    let invalid = |source| UrlError::Invalid {
        host: endpoint.host.clone(),
        source,
    };

    // IPv6 literals need brackets in a URL
    let host = match endpoint.host.parse::<Ipv6Addr>() {
        Ok(ip) => format!("[{}]", ip),
        Err(_) => endpoint.host.clone(),
    };

    let callback_url = Url::parse(&format!("http://{}/", reachable(callback))).map_err(invalid)?;
    let mut url = Url::parse(&format!("https://{}:{}/", host, endpoint.port)).map_err(invalid)?;

    url.query_pairs_mut()
        .append_pair("protocol", &endpoint.protocol)
        .append_pair("callback", callback_url.as_str());

    Ok(url)
}

fn reachable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => (Ipv4Addr::LOCALHOST, addr.port()).into(),
        IpAddr::V6(ip) if ip.is_unspecified() => (Ipv6Addr::LOCALHOST, addr.port()).into(),
        _ => addr,
    }
}
