//! Policy routing table allocation
//!
//! Table ids are never stored anywhere: both ADD and DEL recompute them from
//! the interface name. The overlay interface keeps the overlay table 100,
//! every other name hashes into `[base, 32767)`:
//!
//! ```text
//! table = base + fnv1a32(name) % (32767 - base)
//! ```
//!
//! `base` is at least 256, so the result can never be 0, 100 or one of the
//! kernel's default/main/local tables (253, 254, 255).

use tracing::debug;

use crate::error::RouterError;

/// Table the overlay's own interface routes through
pub const OVERLAY_ROUTE_TABLE: u32 = 100;

/// Upper bound (exclusive) of allocated tables
pub const RT_TABLE_MAX: u32 = 32767;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
const IFNAME_MAX: usize = 15;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

#[derive(Debug, Clone)]
pub struct TableAllocator {
    base: u32,
    overlay_interface: String,
}

impl TableAllocator {
    pub fn new(base: u32, overlay_interface: impl Into<String>) -> Self {
        Self {
            base,
            overlay_interface: overlay_interface.into(),
        }
    }

    /// Table owned by `interface`
    pub fn table_for(&self, interface: &str) -> Result<u32, RouterError> {
        if interface.is_empty()
            || interface.len() > IFNAME_MAX
            || !(256..RT_TABLE_MAX).contains(&self.base)
        {
            return Err(RouterError::TableAllocationFailed {
                interface: interface.to_string(),
            });
        }

        if interface == self.overlay_interface {
            return Ok(OVERLAY_ROUTE_TABLE);
        }

        let span = RT_TABLE_MAX - self.base;
        let table = self.base + fnv1a(interface.as_bytes()) % span;
        debug!(interface, table, "allocated policy routing table");
        Ok(table)
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(FNV_PRIME)
    })
}
