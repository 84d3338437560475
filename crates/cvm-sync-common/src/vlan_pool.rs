//! VLAN id allocator for a closed id range.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::error::{CvmError, CvmResult};

/// Lowest usable 802.1Q VLAN id.
pub const VLAN_ID_MIN: u16 = 1;

/// Highest usable 802.1Q VLAN id.
pub const VLAN_ID_MAX: u16 = 4094;

/// Fixed-range VLAN id pool.
///
/// Ids are handed out lowest-free-first unless the caller asks for a specific
/// free id (re-attaching a port that already carries a tag). An id is never
/// handed out twice until it has been released.
#[derive(Debug, Clone, Serialize)]
pub struct VlanIdPool {
    start: u16,
    end: u16,
    allocated: BTreeSet<u16>,
}

impl VlanIdPool {
    /// Creates a pool covering `[start, end]`.
    pub fn new(start: u16, end: u16) -> CvmResult<Self> {
        if start > end {
            return Err(CvmError::invalid_config(
                "vlan",
                format!("start {start} is greater than end {end}"),
            ));
        }
        if start < VLAN_ID_MIN || end > VLAN_ID_MAX {
            return Err(CvmError::invalid_config(
                "vlan",
                format!("range [{start}, {end}] outside [{VLAN_ID_MIN}, {VLAN_ID_MAX}]"),
            ));
        }

        Ok(Self {
            start,
            end,
            allocated: BTreeSet::new(),
        })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, id: u16) -> bool {
        (self.start..=self.end).contains(&id)
    }

    pub fn is_allocated(&self, id: u16) -> bool {
        self.allocated.contains(&id)
    }

    /// Allocated ids in ascending order.
    pub fn allocated(&self) -> impl Iterator<Item = u16> + '_ {
        self.allocated.iter().copied()
    }

    pub fn free_count(&self) -> usize {
        usize::from(self.end - self.start) + 1 - self.allocated.len()
    }

    /// Allocates an id.
    ///
    /// Returns `preferred` if it is in range and free, otherwise the lowest
    /// free id. Fails with `PoolExhausted` when every id is taken.
    pub fn allocate(&mut self, preferred: Option<u16>) -> CvmResult<u16> {
        if let Some(id) = preferred {
            if self.contains(id) && self.allocated.insert(id) {
                debug!(vlan_id = id, "Allocated preferred VLAN id");
                return Ok(id);
            }
        }

        let id = (self.start..=self.end)
            .find(|id| !self.allocated.contains(id))
            .ok_or(CvmError::PoolExhausted {
                start: self.start,
                end: self.end,
            })?;

        self.allocated.insert(id);
        debug!(vlan_id = id, "Allocated VLAN id");
        Ok(id)
    }

    /// Returns `id` to the pool. Releasing a free id is a no-op.
    ///
    /// Returns true if the id was allocated.
    pub fn release(&mut self, id: u16) -> bool {
        let released = self.allocated.remove(&id);
        if released {
            debug!(vlan_id = id, "Released VLAN id");
        }
        released
    }
}
