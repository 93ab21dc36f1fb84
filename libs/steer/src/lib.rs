//! Packet-steering backends.
//!
//! A backend marks an IP address so that traffic towards it egresses through
//! a specific network interface, for at most a bounded lifetime. On Linux
//! this is a host route with kernel-side expiry, on BSD/macOS a `pf` table
//! entry plus an interface-scoped host route with a userspace timer.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod ledger;

#[cfg(target_os = "linux")]
mod routes;

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod pf;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

pub use ledger::Ledger;

/// The shortest lifetime a mark may have.
pub const MIN_TTL: Duration = Duration::from_secs(30);
/// The longest lifetime a mark may have.
pub const MAX_TTL: Duration = Duration::from_secs(3600);

/// Marks IP addresses for egress through a specific interface.
#[async_trait::async_trait]
pub trait Steering: Send + Sync + 'static {
    /// Steers traffic for `ip` through `iface` for the next `ttl`.
    ///
    /// Re-marking an already marked address only ever extends its lifetime.
    async fn mark_ip(&self, iface: &str, ip: IpAddr, ttl: Duration) -> Result<()>;

    /// Removes all state this backend installed on the host. Idempotent.
    async fn cleanup_all(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidInput {
    #[error("'{0}' is not a valid interface name")]
    Interface(String),
    #[error("'{0}' is not an IP address")]
    Ip(String),
}

/// Picks the backend for the current host.
///
/// Falls back to a no-op backend when the platform has no steering support
/// or the platform backend fails to initialise.
pub fn probe() -> Arc<dyn Steering> {
    platform_backend()
}

#[cfg(target_os = "linux")]
fn platform_backend() -> Arc<dyn Steering> {
    match routes::Routes::new() {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            tracing::warn!("Failed to initialise route backend, steering is disabled: {e:#}");

            Arc::new(Disabled)
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn platform_backend() -> Arc<dyn Steering> {
    Arc::new(pf::Pf::new())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
fn platform_backend() -> Arc<dyn Steering> {
    Arc::new(Disabled)
}

/// Backend that accepts every mark and does nothing.
pub struct Disabled;

#[async_trait::async_trait]
impl Steering for Disabled {
    async fn mark_ip(&self, iface: &str, ip: IpAddr, ttl: Duration) -> Result<()> {
        validate_interface(iface)?;

        tracing::debug!(%iface, %ip, ?ttl, "Steering is disabled, ignoring mark");

        Ok(())
    }

    async fn cleanup_all(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Checks that `iface` is a plausible interface name before it gets anywhere
/// near the host's routing machinery.
pub fn validate_interface(iface: &str) -> Result<(), InvalidInput> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-');

    if iface.is_empty() || iface.len() > 32 || !iface.chars().all(valid_char) {
        return Err(InvalidInput::Interface(iface.to_owned()));
    }

    Ok(())
}

/// Parses an IP address from operator input.
///
/// Tolerates brackets around v6 addresses and strips zone identifiers;
/// v4-mapped v6 addresses collapse to their v4 form.
pub fn parse_ip(raw: &str) -> Result<IpAddr, InvalidInput> {
    let trimmed = raw
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split('%')
        .next()
        .unwrap_or_default();

    let ip = trimmed
        .parse::<IpAddr>()
        .map_err(|_| InvalidInput::Ip(raw.to_owned()))?;

    Ok(normalize_ip(ip))
}

pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.clamp(MIN_TTL, MAX_TTL)
}
