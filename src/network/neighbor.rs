//! Static neighbor entries across the overlay veth pair
//!
//! The host learns the chained addresses at the overlay MAC on the parent
//! link, and the pod learns every host address at the parent MAC on the
//! overlay interface. Both sides then skip ARP/NDP for this traffic.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};

use crate::error::RouterError;
use crate::network::OverlayLink;
use crate::routing::{IpFamily, NeighborEntry, RouteManager};

/// Install both directions of static neighbors
pub async fn provision<P, H>(
    pod: &P,
    host: &H,
    overlay: &OverlayLink,
    chained: &[IpNetwork],
    host_addrs: &[IpAddr],
) -> Result<usize, RouterError>
where
    P: RouteManager,
    H: RouteManager,
{
    let mut count = 0;
    for net in chained {
        let entry = NeighborEntry::permanent(net.ip(), overlay.mac, overlay.parent_index);
        ensure_neighbor(host, &entry).await?;
        count += 1;
    }

    for ip in host_addrs {
        let entry = NeighborEntry::permanent(*ip, overlay.parent_mac, overlay.index);
        ensure_neighbor(pod, &entry).await?;
        count += 1;
    }

    info!("Installed {} static neighbor entries", count);
    Ok(count)
}

/// Add a permanent neighbor entry
///
/// The same MAC already present is success. A learned entry with another MAC
/// is replaced; a permanent one is left alone and reported.
pub async fn ensure_neighbor<R: RouteManager>(
    routes: &R,
    entry: &NeighborEntry,
) -> Result<(), RouterError> {
    let failed = |reason: String| RouterError::NeighborInstallFailed {
        ip: entry.ip.to_string(),
        link: entry.link_index,
        reason,
    };

    match routes.add_neighbor(entry).await {
        Ok(()) => {
            debug!("Added neighbor {} lladdr {} dev #{}", entry.ip, entry.mac, entry.link_index);
            return Ok(());
        }
        Err(e) if e.is_exist() => {}
        Err(e) => return Err(failed(e.to_string())),
    }

    let existing = routes
        .neighbors(IpFamily::of(&entry.ip))
        .await?
        .into_iter()
        .find(|n| n.ip == entry.ip && n.link_index == entry.link_index);

    match existing {
        Some(n) if n.mac == entry.mac && n.permanent => {
            debug!("Neighbor {} already present", entry.ip);
            Ok(())
        }
        Some(n) if n.permanent => Err(failed(format!(
            "permanent entry with lladdr {} already present",
            n.mac
        ))),
        other => {
            if let Some(n) = other {
                warn!("Replacing learned neighbor {} lladdr {} with {}", n.ip, n.mac, entry.mac);
            }
            routes
                .replace_neighbor(entry)
                .await
                .map_err(|e| failed(e.to_string()))
        }
    }
}
