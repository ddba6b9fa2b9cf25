use std::{borrow::Cow, net::SocketAddr};

/// Normalize a bind/listen address.
///
/// The shorthand `":PORT"` means "bind on all interfaces". Tokio's bind APIs
/// do not accept it, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts. Brackets are stripped
/// from IPv6 literals.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let addr = addr.trim();
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        (host, tail.strip_prefix(':')?)
    } else {
        let (host, port) = addr.rsplit_once(':')?;
        if host.contains(':') {
            // Unbracketed IPv6 literal with a port is ambiguous.
            return None;
        }
        (host, port)
    };
    if host.is_empty() || port.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host, port))
}

/// A parsed tunnel server address: `host[:port]` or `scheme://host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    /// Transport named by the URL scheme, if any.
    pub transport: Option<String>,
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    /// `host:port` with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

pub fn parse_server_addr(raw: &str, default_port: u16) -> anyhow::Result<ServerAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        anyhow::bail!("empty server address");
    }

    let (transport, rest) = match raw.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.trim().to_ascii_lowercase()), rest),
        None => (None, raw),
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        anyhow::bail!("server address {raw:?} has no host");
    }
    if rest.contains('/') {
        anyhow::bail!("server address {raw:?} must not contain a path");
    }

    if let Some((host, port)) = split_host_port(rest) {
        return Ok(ServerAddr {
            transport,
            host: host.to_string(),
            port,
        });
    }

    // No (valid) port: accept a bare host or a bracketed/bare IPv6 literal.
    let host = rest.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || (host.contains(':') && host.parse::<std::net::Ipv6Addr>().is_err()) {
        anyhow::bail!("server address {raw:?} is not host[:port]");
    }
    Ok(ServerAddr {
        transport,
        host: host.to_string(),
        port: default_port,
    })
}

pub async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve {addr:?}"))
}
