//! Deterministic MAC addresses derived from the pod IP

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::info;

use crate::error::RouterError;
use crate::routing::{MacAddr, RouteManager};

/// `prefix[0]:prefix[1]` followed by the four bytes of the first IPv4
/// address, or the last four bytes of an IPv6 address when there is none
pub fn derive_mac(prefix: [u8; 2], addrs: &[IpNetwork]) -> Option<MacAddr> {
    let tail = addrs
        .iter()
        .find_map(|net| match net.ip() {
            IpAddr::V4(v4) => Some(v4.octets()),
            IpAddr::V6(_) => None,
        })
        .or_else(|| {
            addrs.iter().find_map(|net| match net.ip() {
                IpAddr::V6(v6) => {
                    let o = v6.octets();
                    Some([o[12], o[13], o[14], o[15]])
                }
                IpAddr::V4(_) => None,
            })
        })?;

    Some(MacAddr([prefix[0], prefix[1], tail[0], tail[1], tail[2], tail[3]]))
}

/// Rewrite the MAC of `interface` from its own addresses
pub async fn rewrite_mac<R: RouteManager>(
    routes: &R,
    interface: &str,
    prefix: [u8; 2],
) -> Result<MacAddr, RouterError> {
    let failed = |reason: String| RouterError::MacRewriteFailed {
        interface: interface.to_string(),
        reason,
    };

    let link = routes
        .link_by_name(interface)
        .await?
        .ok_or_else(|| RouterError::InterfaceNotFound {
            interface: interface.to_string(),
        })?;

    let addrs: Vec<IpNetwork> = routes
        .addresses()
        .await?
        .into_iter()
        .filter(|a| a.link_index == link.index)
        .map(|a| a.network)
        .collect();

    let mac = derive_mac(prefix, &addrs).ok_or_else(|| failed("no address configured".to_string()))?;
    if link.mac == Some(mac) {
        return Ok(mac);
    }

    routes
        .set_link_address(link.index, mac)
        .await
        .map_err(|e| failed(e.to_string()))?;
    info!("Set mac address of {} to {}", interface, mac);
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeKernel;

    #[test]
    fn test_derive_from_ipv4() {
        let addrs: Vec<IpNetwork> = vec!["fd00::1:2/64".parse().unwrap(), "10.0.0.5/24".parse().unwrap()];
        let mac = derive_mac([0x0a, 0x1b], &addrs).unwrap();
        assert_eq!(mac.to_string(), "0a:1b:0a:00:00:05");
    }

    #[test]
    fn test_derive_from_ipv6() {
        let addrs: Vec<IpNetwork> = vec!["fd00::c0a8:102/64".parse().unwrap()];
        let mac = derive_mac([0x0a, 0x1b], &addrs).unwrap();
        assert_eq!(mac.to_string(), "0a:1b:c0:a8:01:02");
        assert!(derive_mac([0x0a, 0x1b], &[]).is_none());
    }

    #[tokio::test]
    async fn test_rewrite_mac() {
        let kernel = FakeKernel::new();
        kernel.add_link(4, "net1", Some([2, 2, 2, 2, 2, 2]), None);
        kernel.add_address(4, "10.0.0.5/24");

        let mac = rewrite_mac(&kernel, "net1", [0x0a, 0x1b]).await.unwrap();
        assert_eq!(kernel.link(4).unwrap().mac, Some(mac));
        assert_eq!(kernel.mutations(), 1);

        rewrite_mac(&kernel, "net1", [0x0a, 0x1b]).await.unwrap();
        assert_eq!(kernel.mutations(), 1);
    }

    #[test]
    fn test_rewrite_without_address_fails() {
        let kernel = FakeKernel::new();
        kernel.add_link(4, "net1", None, None);
        let result = tokio_test::block_on(rewrite_mac(&kernel, "net1", [0x0a, 0x1b]));
        assert!(matches!(result, Err(RouterError::MacRewriteFailed { .. })));
    }
}
