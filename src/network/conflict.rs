//! Duplicate address detection before the pod is wired up
//!
//! Each round ARP-probes every IPv4 address on the pod interface, reads the
//! kernel's IPv6 duplicate address detection result, and scans the neighbor
//! table for a foreign MAC holding one of the addresses.

use std::collections::HashSet;
use std::net::IpAddr;

use tracing::{debug, warn};

use crate::config::IpConflict;
use crate::error::RouterError;
use crate::network::{AddressProber, FamilySet};
use crate::routing::{MacAddr, RouteManager};

pub async fn check_ip_conflict<R, A>(
    routes: &R,
    prober: &A,
    ips: &[IpAddr],
    probe: IpConflict,
) -> Result<(), RouterError>
where
    R: RouteManager,
    A: AddressProber,
{
    if ips.is_empty() {
        return Ok(());
    }

    let own: HashSet<MacAddr> = routes.links().await?.into_iter().filter_map(|l| l.mac).collect();
    let families = FamilySet {
        ipv4: ips.iter().any(|ip| ip.is_ipv4()),
        ipv6: ips.iter().any(|ip| ip.is_ipv6()),
    };

    for round in 0..probe.retries {
        // ARP probes already wait `interval` for answers
        if round > 0 && !families.ipv4 {
            tokio::time::sleep(probe.interval).await;
        }

        for ip in ips {
            let IpAddr::V4(v4) = ip else {
                continue;
            };
            if let Some(mac) = prober.probe(*v4, probe.interval).await? {
                if !own.contains(&mac) {
                    return Err(conflict(ip, mac.to_string()));
                }
            }
        }

        if families.ipv6 {
            let duplicate = routes
                .addresses()
                .await?
                .into_iter()
                .find(|a| a.dad_failed && ips.contains(&a.network.ip()));
            if let Some(addr) = duplicate {
                return Err(conflict(&addr.network.ip(), "another host".to_string()));
            }
        }

        for family in families.iter() {
            let learned = routes
                .neighbors(family)
                .await?
                .into_iter()
                .find(|n| ips.contains(&n.ip) && !own.contains(&n.mac));
            if let Some(n) = learned {
                return Err(conflict(&n.ip, n.mac.to_string()));
            }
        }
        debug!("No conflict for {:?} in round {}", ips, round + 1);
    }
    Ok(())
}

fn conflict(ip: &IpAddr, holder: String) -> RouterError {
    warn!("IP {} is answered by {}", ip, holder);
    RouterError::IpConflict {
        ip: ip.to_string(),
        mac: holder,
    }
}
