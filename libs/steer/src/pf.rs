//! BSD/macOS backend: `pf` table entries plus interface-scoped host routes.
//!
//! Marks are two host-state writes per IP: membership in a per-interface
//! `pf` table (`outway_<iface>`) and a host route pinning the IP to the
//! interface. The kernel has no route expiry here, so every mark schedules a
//! cancellable per-IP timer that tears both down again.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, bail};
use parking_lot::Mutex;
use tokio::process::Command;

use crate::Ledger;

const TABLE_PREFIX: &str = "outway_";

type Key = (String, IpAddr);

pub struct Pf {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    ledger: Ledger<Key>,
    timers: HashMap<Key, tokio::task::JoinHandle<()>>,
    /// Routes known to be installed, so re-marks within TTL skip `route add`.
    routes_installed: HashMap<IpAddr, Instant>,
    /// Tables we have written to, for cleanup.
    tables: HashSet<String>,
}

impl Default for Pf {
    fn default() -> Self {
        Self::new()
    }
}

impl Pf {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }
}

#[async_trait::async_trait]
impl crate::Steering for Pf {
    async fn mark_ip(&self, iface: &str, ip: IpAddr, ttl: Duration) -> Result<()> {
        crate::validate_interface(iface)?;
        let ip = crate::normalize_ip(ip);
        let ttl = crate::clamp_ttl(ttl);

        let table = format!("{TABLE_PREFIX}{iface}");
        let key = (iface.to_owned(), ip);
        let now = Instant::now();

        // Decide under the lock, shell out after releasing it.
        let route_needed = {
            let mut state = self.state.lock();

            let Some(expiry) = state.ledger.refresh(key.clone(), ttl, now) else {
                tracing::trace!(%ip, %iface, ?ttl, "Existing mark outlives request, skipping");

                return Ok(());
            };

            if let Some(timer) = state.timers.remove(&key) {
                timer.abort();
            }

            state.tables.insert(table.clone());

            let route_needed = state
                .routes_installed
                .get(&ip)
                .is_none_or(|installed_until| *installed_until <= now);
            state.routes_installed.insert(ip, expiry);

            route_needed
        };

        let result = async {
            run("pfctl", &["-t", &table, "-T", "add", &ip.to_string()])
                .await
                .context("Failed to add pf table entry")?;

            if route_needed {
                add_host_route(iface, ip)
                    .await
                    .context("Failed to add host route")?;
            }

            anyhow::Ok(())
        }
        .await;

        if let Err(e) = result {
            let mut state = self.state.lock();
            state.ledger.forget(&key);
            state.routes_installed.remove(&ip);

            return Err(e);
        }

        let timer = tokio::spawn(expire_after(self.state.clone(), key.clone(), table, ttl));

        if let Some(superseded) = self.state.lock().timers.insert(key, timer) {
            superseded.abort();
        }

        tracing::debug!(%ip, %iface, ttl_s = ttl.as_secs(), "Marked IP in pf table");

        Ok(())
    }

    async fn cleanup_all(&self) -> Result<()> {
        let (keys, tables) = {
            let mut state = self.state.lock();

            for (_, timer) in state.timers.drain() {
                timer.abort();
            }
            state.routes_installed.clear();

            (state.ledger.drain(), std::mem::take(&mut state.tables))
        };

        for table in tables {
            if let Err(e) = run("pfctl", &["-t", &table, "-T", "flush"]).await {
                tracing::debug!(%table, "Failed to flush pf table: {e:#}");
            }
            if let Err(e) = run("pfctl", &["-t", &table, "-T", "kill"]).await {
                tracing::debug!(%table, "Failed to remove pf table: {e:#}");
            }
        }

        for (iface, ip) in keys {
            if let Err(e) = delete_host_route(ip).await {
                tracing::debug!(%ip, %iface, "Failed to remove host route: {e:#}");
            }
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "pf"
    }
}

/// Tears one mark down again once its lifetime is over.
async fn expire_after(state: Arc<Mutex<State>>, key: Key, table: String, ttl: Duration) {
    tokio::time::sleep(ttl).await;

    let (iface, ip) = &key;

    if let Err(e) = run("pfctl", &["-t", &table, "-T", "delete", &ip.to_string()]).await {
        tracing::debug!(%ip, %iface, "Failed to remove pf table entry: {e:#}");
    }

    if let Err(e) = delete_host_route(*ip).await {
        tracing::debug!(%ip, %iface, "Failed to remove host route: {e:#}");
    }

    let mut state = state.lock();
    state.ledger.forget(&key);
    state.timers.remove(&key);
    state.routes_installed.remove(ip);

    tracing::debug!(%ip, %iface, "Mark expired");
}

async fn add_host_route(iface: &str, ip: IpAddr) -> Result<()> {
    let ip = ip.to_string();

    let mut args = vec!["add"];
    if ip.contains(':') {
        args.push("-inet6");
    }
    args.push("-host");
    args.push(&ip);
    args.push("-interface");
    args.push(iface);

    match run("route", &args).await {
        Ok(()) => Ok(()),
        // An existing route towards the right interface does the job just as well.
        Err(e) if format!("{e:#}").contains("exists") => Ok(()),
        Err(e) => Err(e),
    }
}

async fn delete_host_route(ip: IpAddr) -> Result<()> {
    let ip = ip.to_string();

    let mut args = vec!["delete"];
    if ip.contains(':') {
        args.push("-inet6");
    }
    args.push("-host");
    args.push(&ip);

    match run("route", &args).await {
        Ok(()) => Ok(()),
        Err(e) if format!("{e:#}").contains("not in table") => Ok(()),
        Err(e) => Err(e),
    }
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to spawn `{program}`"))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);

    bail!(
        "`{program} {}` failed: {}",
        args.join(" "),
        stderr.trim()
    );
}
