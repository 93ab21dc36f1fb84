//! Linux backend: per-IP host routes with kernel-side expiry.
//!
//! Each mark installs `<ip>/32 dev <iface> proto 186 scope link` with an
//! `RTA_EXPIRES` lifetime, so the kernel reaps the route on its own and the
//! backend needs no timers. Routes are tagged with a private routing
//! protocol number so cleanup can never touch foreign routes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use futures::TryStreamExt as _;
use logging::err_with_src;
use netlink_packet_route::route::{RouteAttribute, RouteMessage, RouteProtocol, RouteScope};
use parking_lot::Mutex;
use rtnetlink::{Error::NetlinkError, Handle, RouteMessageBuilder};

use crate::Ledger;

/// Routing protocol number stamped on every route we install.
///
/// Picked from the unassigned rtnetlink range; `ip route` renders it
/// numerically.
const PROTO_OUTWAY: u8 = 186;

pub struct Routes {
    handle: Handle,
    connection_task: tokio::task::JoinHandle<()>,
    ledger: Mutex<Ledger<IpAddr>>,
}

impl Drop for Routes {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

impl Routes {
    pub fn new() -> Result<Self> {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("Failed to create netlink socket")?;

        let connection_task = tokio::spawn(connection);

        Ok(Self {
            handle,
            connection_task,
            ledger: Mutex::new(Ledger::default()),
        })
    }

    async fn interface_index(&self, iface: &str) -> Result<u32> {
        let index = self
            .handle
            .link()
            .get()
            .match_name(iface.to_owned())
            .execute()
            .try_next()
            .await
            .with_context(|| format!("Failed to query interface '{iface}'"))?
            .with_context(|| format!("No such interface '{iface}'"))?
            .header
            .index;

        Ok(index)
    }
}

#[async_trait::async_trait]
impl crate::Steering for Routes {
    async fn mark_ip(&self, iface: &str, ip: IpAddr, ttl: Duration) -> Result<()> {
        crate::validate_interface(iface)?;
        let ip = crate::normalize_ip(ip);
        let ttl = crate::clamp_ttl(ttl);

        if self.ledger.lock().refresh(ip, ttl, Instant::now()).is_none() {
            tracing::trace!(%ip, %iface, ?ttl, "Existing route outlives mark, skipping refresh");

            return Ok(());
        }

        let index = self.interface_index(iface).await?;

        // Refreshing the expiry requires delete-then-add; a plain add on an
        // existing destination returns EEXIST without touching the lifetime.
        delete_route(&self.handle, route_message(ip, None, None)).await;

        let result = self
            .handle
            .route()
            .add(route_message(ip, Some(index), Some(ttl)))
            .execute()
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(%ip, %iface, ttl_s = ttl.as_secs(), "Installed expiring host route");

                Ok(())
            }
            Err(NetlinkError(e)) if e.raw_code() == -libc::EEXIST => Ok(()),
            Err(e) => {
                self.ledger.lock().forget(&ip);

                Err(anyhow::Error::new(e)
                    .context(format!("Failed to add route for {ip} via {iface}")))
            }
        }
    }

    async fn cleanup_all(&self) -> Result<()> {
        let ips = self.ledger.lock().drain();

        // The kernel reaps expired routes on its own; this only shortens the
        // tail for marks that are still live.
        for ip in ips {
            delete_route(&self.handle, route_message(ip, None, None)).await;
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "routes"
    }
}

fn route_message(ip: IpAddr, oif: Option<u32>, expires: Option<Duration>) -> RouteMessage {
    let mut message = match ip {
        IpAddr::V4(v4) => {
            let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
                .protocol(RouteProtocol::from(PROTO_OUTWAY))
                .scope(RouteScope::Link)
                .destination_prefix(v4, 32);

            if let Some(index) = oif {
                builder = builder.output_interface(index);
            }

            builder.build()
        }
        IpAddr::V6(v6) => {
            let mut builder = RouteMessageBuilder::<Ipv6Addr>::new()
                .protocol(RouteProtocol::from(PROTO_OUTWAY))
                .scope(RouteScope::Link)
                .destination_prefix(v6, 128);

            if let Some(index) = oif {
                builder = builder.output_interface(index);
            }

            builder.build()
        }
    };

    if let Some(ttl) = expires {
        message
            .attributes
            .push(RouteAttribute::Expires(ttl.as_secs() as u32));
    }

    message
}

async fn delete_route(handle: &Handle, message: RouteMessage) {
    let Err(err) = handle.route().del(message).execute().await else {
        return;
    };

    // Deleting a route that already expired is the normal case here.
    if matches!(&err, NetlinkError(e) if e.raw_code() == -libc::ENOENT) {
        return;
    }

    // "No such process" is another version of "route does not exist".
    if matches!(&err, NetlinkError(e) if e.raw_code() == -libc::ESRCH) {
        return;
    }

    tracing::warn!("Failed to remove route: {}", err_with_src(&err));
}
