//! Idempotent rule and route installation
//!
//! Concurrent invocations for different pods race on the same host tables,
//! so "already exists" must be success. It only counts as success when the
//! entry found is the one we asked for; anything else is a conflict.

use tracing::{debug, warn};

use crate::error::RouterError;
use crate::routing::{IpFamily, PolicyRule, Route, RouteManager};

/// Add a policy rule; an identical rule already present is success
///
/// Without an explicit priority the kernel assigns a fresh one to every add
/// and never reports EEXIST, so the current rules are checked first.
pub async fn ensure_rule<R: RouteManager>(routes: &R, rule: &PolicyRule) -> Result<(), RouterError> {
    if routes.list_rules(rule.family).await?.contains(rule) {
        debug!("{} already exists", rule);
        return Ok(());
    }

    match routes.add_rule(rule).await {
        Ok(()) => {
            debug!("Added {}", rule);
            Ok(())
        }
        // lost a race with a concurrent invocation
        Err(e) if e.is_exist() => {
            debug!("{} already exists", rule);
            Ok(())
        }
        Err(e) => Err(RouterError::RuleOrRouteInstallFailed {
            what: rule.to_string(),
            source: e,
        }),
    }
}

/// Add a route; an existing route with the same forwarding path is success,
/// a different route for the same destination is a conflict
pub async fn ensure_route<R: RouteManager>(routes: &R, route: &Route) -> Result<(), RouterError> {
    validate_route(route)?;

    let err = match routes.add_route(route).await {
        Ok(()) => {
            debug!("Added route {}", route);
            return Ok(());
        }
        Err(e) if e.is_exist() => e,
        Err(e) => {
            return Err(RouterError::RuleOrRouteInstallFailed {
                what: format!("route {}", route),
                source: e,
            })
        }
    };

    let existing = routes
        .list_routes(route.family())
        .await?
        .into_iter()
        .filter(|r| r.table == route.table && r.destination == route.destination)
        .collect::<Vec<_>>();

    if existing.iter().any(|r| r.same_path(route)) {
        debug!("Route {} already exists", route);
        return Ok(());
    }

    match existing.first() {
        Some(other) => Err(RouterError::RouteConflict {
            route: route.to_string(),
            existing: other.to_string(),
        }),
        // EEXIST for an entry we cannot see, e.g. a different route type
        None => Err(RouterError::RuleOrRouteInstallFailed {
            what: format!("route {}", route),
            source: err,
        }),
    }
}

/// Delete a policy rule; a rule already gone is success
pub async fn remove_rule<R: RouteManager>(routes: &R, rule: &PolicyRule) -> Result<(), RouterError> {
    match routes.del_rule(rule).await {
        Ok(()) => {
            debug!("Deleted {}", rule);
            Ok(())
        }
        Err(e) if e.is_gone() => Ok(()),
        Err(e) => {
            warn!("Failed to delete {}: {}", rule, e);
            Err(RouterError::Netlink(e))
        }
    }
}

/// Delete a route; a route already gone is success
pub async fn remove_route<R: RouteManager>(routes: &R, route: &Route) -> Result<(), RouterError> {
    match routes.del_route(route).await {
        Ok(()) => {
            debug!("Deleted route {}", route);
            Ok(())
        }
        Err(e) if e.is_gone() => Ok(()),
        Err(e) => Err(RouterError::Netlink(e)),
    }
}

/// Reject routes whose gateway family differs from the destination's
pub fn validate_route(route: &Route) -> Result<(), RouterError> {
    match route.gateway {
        Some(gw) if IpFamily::of(&gw) != route.family() => {
            Err(RouterError::RuleOrRouteInstallFailed {
                what: format!("route {}", route),
                source: crate::error::NetlinkError::Request {
                    what: route.to_string(),
                    reason: "IP version mismatch between destination and gateway".to_string(),
                },
            })
        }
        _ => Ok(()),
    }
}
