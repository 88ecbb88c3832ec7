//! Pod-side routes to the host through the overlay

use std::net::IpAddr;

use tracing::info;

use crate::error::RouterError;
use crate::routing::rules::ensure_route;
use crate::routing::table::OVERLAY_ROUTE_TABLE;
use crate::routing::{Route, RouteManager, RT_TABLE_MAIN};

/// Route every host address over the overlay interface in `table`
///
/// When the chained interface is the overlay itself the routes also go into
/// main, since nothing else steers traffic to table 100.
pub async fn install_host_routes<P: RouteManager>(
    pod: &P,
    table: u32,
    overlay_index: u32,
    host_addrs: &[IpAddr],
) -> Result<usize, RouterError> {
    let mut tables = vec![table];
    if table == OVERLAY_ROUTE_TABLE {
        tables.push(RT_TABLE_MAIN);
    }

    let mut count = 0;
    for table in tables {
        for ip in host_addrs {
            ensure_route(pod, &Route::to_host(table, *ip, overlay_index)).await?;
            count += 1;
        }
    }
    info!("Pod reaches {} host addresses over #{}", host_addrs.len(), overlay_index);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeKernel;

    #[tokio::test]
    async fn test_routes_in_pod_table() {
        let pod = FakeKernel::new();
        let host_addrs: Vec<IpAddr> = vec!["10.0.0.2".parse().unwrap(), "fd00::2".parse().unwrap()];

        install_host_routes(&pod, 11491, 3, &host_addrs).await.unwrap();
        let routes = pod.routes_in(11491);
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().all(|r| r.link_index == 3));
        assert!(pod.routes_in(RT_TABLE_MAIN).is_empty());
    }

    #[tokio::test]
    async fn test_overlay_table_also_main() {
        let pod = FakeKernel::new();
        let host_addrs: Vec<IpAddr> = vec!["10.0.0.2".parse().unwrap()];

        install_host_routes(&pod, OVERLAY_ROUTE_TABLE, 3, &host_addrs)
            .await
            .unwrap();
        assert_eq!(pod.routes_in(OVERLAY_ROUTE_TABLE).len(), 1);
        assert_eq!(pod.routes_in(RT_TABLE_MAIN).len(), 1);

        // idempotent
        install_host_routes(&pod, OVERLAY_ROUTE_TABLE, 3, &host_addrs)
            .await
            .unwrap();
        assert_eq!(pod.routes().len(), 2);
    }
}
