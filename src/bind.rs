//! Socket binding cascade.
//!
//! The server always targets one fixed port. What varies from host to host is
//! which address it may bind: the wildcard address can be refused by
//! privilege or firewall policy, a specific LAN address may or may not be
//! available, and loopback is the last resort. [`bind`] walks an ordered list
//! of strategies and reports which reachability scope it ended up with.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::Serialize;
use tokio::net::TcpListener;

/// How far a bound listener can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReachabilityScope {
    /// Every interface (wildcard address).
    All,
    /// One specific non-loopback address.
    SpecificAddress,
    /// Only this machine.
    LoopbackOnly,
}

impl fmt::Display for ReachabilityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all interfaces"),
            Self::SpecificAddress => write!(f, "specific address"),
            Self::LoopbackOnly => write!(f, "loopback only"),
        }
    }
}

/// One entry of the cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindStrategy {
    pub description: String,
    pub addr: SocketAddr,
    pub scope: ReachabilityScope,
}

/// A listener produced by a successful strategy.
#[derive(Debug)]
pub struct BoundListener {
    pub listener: TcpListener,
    pub addr: SocketAddr,
    pub scope: ReachabilityScope,
}

/// A failed strategy and the OS error it produced.
#[derive(Debug, Clone)]
pub struct BindAttempt {
    pub description: String,
    pub error: String,
}

/// Every strategy failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("could not bind port {port} after {} attempt(s)", attempts.len())]
pub struct BindError {
    pub port: u16,
    pub attempts: Vec<BindAttempt>,
}

impl BindError {
    /// Human-readable report listing each attempt plus remediation hints.
    pub fn diagnostic(&self) -> String {
        let mut out = format!("Failed to bind port {}. Attempts:\n", self.port);
        for attempt in &self.attempts {
            out.push_str(&format!("  - {}: {}\n", attempt.description, attempt.error));
        }
        out.push_str(&remediation_hints(self.port));
        out
    }
}

/// Suggestions shown to the operator when binding fails or is degraded.
pub fn remediation_hints(port: u16) -> String {
    format!(
        "Hints:\n\
         \x20 * run with elevated privileges or register a URL reservation for port {port}\n\
         \x20 * allow inbound TCP {port} through the firewall\n\
         \x20 * check whether another process already listens on port {port}\n"
    )
}

/// Build the ordered cascade for `port`: wildcard, each LAN address, loopback.
pub fn strategies(port: u16, local_addrs: &[Ipv4Addr]) -> Vec<BindStrategy> {
    let mut list = vec![BindStrategy {
        description: format!("all interfaces (0.0.0.0:{port})"),
        addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        scope: ReachabilityScope::All,
    }];
    list.extend(local_addrs.iter().map(|ip| BindStrategy {
        description: format!("local address ({ip}:{port})"),
        addr: SocketAddr::new(IpAddr::V4(*ip), port),
        scope: ReachabilityScope::SpecificAddress,
    }));
    list.push(BindStrategy {
        description: format!("loopback (127.0.0.1:{port})"),
        addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        scope: ReachabilityScope::LoopbackOnly,
    });
    list
}

/// Bind `port` using the full cascade, discovering LAN addresses first.
pub async fn bind(port: u16) -> Result<BoundListener, BindError> {
    let locals = local_ipv4_addrs().await;
    tracing::debug!(?locals, "discovered local IPv4 addresses");
    bind_with(strategies(port, &locals), port).await
}

/// Try each strategy in order until one binds.
///
/// A failed `TcpListener::bind` closes its socket before returning, so no
/// half-open listener survives into the next attempt.
pub async fn bind_with(
    strategies: Vec<BindStrategy>,
    port: u16,
) -> Result<BoundListener, BindError> {
    let mut attempts = Vec::with_capacity(strategies.len());
    for strategy in strategies {
        tracing::info!(strategy = %strategy.description, "trying bind strategy");
        match TcpListener::bind(strategy.addr).await {
            Ok(listener) => {
                let addr = listener.local_addr().unwrap_or(strategy.addr);
                tracing::info!(%addr, scope = %strategy.scope, "bound listener");
                return Ok(BoundListener {
                    listener,
                    addr,
                    scope: strategy.scope,
                });
            }
            Err(e) => {
                tracing::warn!(strategy = %strategy.description, error = %e, "bind strategy failed");
                attempts.push(BindAttempt {
                    description: strategy.description,
                    error: e.to_string(),
                });
            }
        }
    }
    Err(BindError { port, attempts })
}

/// Non-loopback IPv4 addresses of this machine.
///
/// Unions two independent sources (hostname resolution and interface
/// enumeration) because either one alone misses addresses on some hosts.
pub async fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let resolved = hostname_ipv4_addrs().await;
    let enumerated = interface_ipv4_addrs();
    for ip in resolved.into_iter().chain(enumerated) {
        if is_usable_lan_addr(&ip) && seen.insert(ip) {
            out.push(ip);
        }
    }
    out
}

fn is_usable_lan_addr(ip: &Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified() && !ip.is_link_local() && !ip.is_broadcast()
}

async fn hostname_ipv4_addrs() -> Vec<Ipv4Addr> {
    let Some(host) = hostname::get().ok().and_then(|h| h.into_string().ok()) else {
        return Vec::new();
    };
    // Bound to a local so the lookup future is dropped before `host`.
    let resolved = match tokio::net::lookup_host((host.as_str(), 0)).await {
        Ok(addrs) => addrs
            .filter_map(|a| match a.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect(),
        Err(e) => {
            tracing::debug!(%host, error = %e, "hostname resolution failed");
            Vec::new()
        }
    };
    resolved
}

#[cfg(unix)]
fn interface_ipv4_addrs() -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: on success getifaddrs hands us a linked list that stays valid
    // until the matching freeifaddrs below.
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        tracing::debug!(error = %std::io::Error::last_os_error(), "getifaddrs failed");
        return out;
    }
    let mut cur = ifap;
    while !cur.is_null() {
        // SAFETY: `cur` is a non-null node of the list returned above.
        let ifa = unsafe { &*cur };
        if !ifa.ifa_addr.is_null() {
            // SAFETY: ifa_addr is non-null and points at a sockaddr; we only
            // reinterpret it as sockaddr_in after checking the family.
            unsafe {
                if (*ifa.ifa_addr).sa_family as i32 == libc::AF_INET {
                    let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    out.push(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
                }
            }
        }
        cur = ifa.ifa_next;
    }
    // SAFETY: ifap came from getifaddrs and is freed exactly once.
    unsafe { libc::freeifaddrs(ifap) };
    out
}

#[cfg(not(unix))]
fn interface_ipv4_addrs() -> Vec<Ipv4Addr> {
    Vec::new()
}
