//! Subnet hijacking into the pod table
//!
//! Traffic sourced from the default-route interface, and traffic to the
//! service/overlay/additional subnets, looks up the pod table instead of
//! main.

use ipnetwork::IpNetwork;
use tracing::{debug, info};

use crate::error::RouterError;
use crate::network::FamilySet;
use crate::routing::rules::ensure_rule;
use crate::routing::{host_network, IpFamily, PolicyRule, RouteManager};

pub async fn hijack<'a, P: RouteManager>(
    pod: &P,
    table: u32,
    default_addrs: &[IpNetwork],
    subnets: impl IntoIterator<Item = &'a IpNetwork>,
    families: FamilySet,
) -> Result<usize, RouterError> {
    let mut count = 0;

    for net in default_addrs
        .iter()
        .filter(|n| families.contains(IpFamily::of(&n.ip())))
    {
        ensure_rule(pod, &PolicyRule::from_source(table, host_network(net.ip()))).await?;
        count += 1;
    }

    for subnet in subnets {
        if !families.contains(IpFamily::of(&subnet.ip())) {
            debug!("Skipping {}, family not active", subnet);
            continue;
        }
        ensure_rule(pod, &PolicyRule::to_destination(table, *subnet)).await?;
        count += 1;
    }

    info!("Hijacked {} rules into table {}", count, table);
    Ok(count)
}
