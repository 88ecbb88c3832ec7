//! Pod-side kernel parameters

use tracing::info;

use crate::config::RpFilter;
use crate::error::RouterError;
use crate::network::Namespace;
use crate::routing::LinkInfo;

const IPV6_SETTINGS: [(&str, &str); 3] = [
    ("net/ipv6/conf/all/disable_ipv6", "0"),
    ("net/ipv6/conf/default/disable_ipv6", "0"),
    ("net/ipv6/conf/all/forwarding", "1"),
];

/// Set `rp_filter` on `all` and on every link of the namespace
///
/// The kernel uses the larger of the `all` and per-link values, so both are
/// written.
pub fn apply_rp_filter<N: Namespace>(
    ns: &N,
    links: &[LinkInfo],
    rp_filter: RpFilter,
) -> Result<usize, RouterError> {
    if !rp_filter.enabled {
        return Ok(0);
    }

    let value = rp_filter.mode.as_sysctl();
    ns.write_sysctl("net/ipv4/conf/all/rp_filter", value)?;
    let mut count = 1;
    for link in links {
        ns.write_sysctl(&format!("net/ipv4/conf/{}/rp_filter", link.name), value)?;
        count += 1;
    }

    info!("Set rp_filter={} on {} entries", value, count);
    Ok(count)
}

/// Enable IPv6 and forwarding inside the namespace
pub fn enable_ipv6<N: Namespace>(ns: &N) -> Result<(), RouterError> {
    for (key, value) in IPV6_SETTINGS {
        ns.write_sysctl(key, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpFilterMode;
    use crate::testing::FakeNamespace;

    fn links() -> Vec<LinkInfo> {
        ["lo", "eth0", "net1"]
            .iter()
            .enumerate()
            .map(|(i, name)| LinkInfo {
                index: i as u32 + 1,
                name: name.to_string(),
                mac: None,
                parent_index: None,
            })
            .collect()
    }

    #[test]
    fn test_rp_filter_all_links() {
        let ns = FakeNamespace::new("/var/run/netns/pod");
        let rp = RpFilter {
            enabled: true,
            mode: RpFilterMode::Loose,
        };
        assert_eq!(apply_rp_filter(&ns, &links(), rp).unwrap(), 4);
        assert_eq!(ns.kernel.sysctl("net/ipv4/conf/all/rp_filter").as_deref(), Some("2"));
        assert_eq!(ns.kernel.sysctl("net/ipv4/conf/net1/rp_filter").as_deref(), Some("2"));
    }

    #[test]
    fn test_rp_filter_disabled_writes_nothing() {
        let ns = FakeNamespace::new("/var/run/netns/pod");
        let rp = RpFilter {
            enabled: false,
            mode: RpFilterMode::Strict,
        };
        assert_eq!(apply_rp_filter(&ns, &links(), rp).unwrap(), 0);
        assert!(ns.kernel.sysctls().is_empty());
    }

    #[test]
    fn test_enable_ipv6() {
        let ns = FakeNamespace::new("/var/run/netns/pod");
        enable_ipv6(&ns).unwrap();
        assert_eq!(ns.kernel.sysctl("net/ipv6/conf/all/forwarding").as_deref(), Some("1"));
        assert_eq!(
            ns.kernel.sysctl("net/ipv6/conf/default/disable_ipv6").as_deref(),
            Some("0")
        );
    }
}
