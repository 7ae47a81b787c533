//! NUMA capability and the node/CPU census.
//!
//! [`NumaBackend`] mirrors the handful of libnuma calls the query needs.
//! [`SysfsNuma`] answers them from the same kernel files libnuma reads.

mod bitmask;
mod sysfs;

use std::io;

use serde::Serialize;

pub use bitmask::{is_range_error, range_error, Bitmask};
pub use sysfs::SysfsNuma;

use crate::error::{Result, TopologyError};
use crate::layout::LogicalLayout;

pub trait NumaBackend {
    fn is_available(&self) -> bool;
    fn configured_node_count(&self) -> io::Result<u32>;
    /// Nodes the calling task may allocate from
    fn task_node_count(&self) -> io::Result<u32>;
    fn configured_cpu_count(&self) -> io::Result<u32>;
    /// CPUs the calling task may run on
    fn task_cpu_count(&self) -> io::Result<u32>;
    fn max_possible_node(&self) -> io::Result<u32>;
    fn is_task_node(&self, node: u32) -> io::Result<bool>;
    /// CPUs of `node`; `ERANGE` when the mask is too small for the node's list
    fn node_to_cpus(&self, node: u32) -> io::Result<Bitmask>;
}

/// Node and CPU counts, before any per-node probing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NumaInventory {
    pub total_nodes: u32,
    pub available_nodes: u32,
    pub total_threads: u32,
    pub available_threads: u32,
}

fn query(what: &str, count: io::Result<u32>) -> Result<u32> {
    let count = count.map_err(|e| TopologyError::numa(format!("failed to query {what}: {e}")))?;
    if count == 0 {
        return Err(TopologyError::numa(format!("{what} is zero")));
    }
    Ok(count)
}

/// Count configured and available nodes and CPUs, cross-checked against the layout
pub fn collect_inventory<N: NumaBackend + ?Sized>(
    numa: &N,
    layout: &LogicalLayout,
) -> Result<NumaInventory> {
    if !numa.is_available() {
        return Err(TopologyError::numa("NUMA subsystem unavailable"));
    }

    let total_nodes = query("configured node count", numa.configured_node_count())?;
    let available_nodes = query("task node count", numa.task_node_count())?;
    if available_nodes > total_nodes {
        return Err(TopologyError::numa(format!(
            "{available_nodes} available nodes exceed {total_nodes} configured"
        )));
    }

    let total_threads = query("configured CPU count", numa.configured_cpu_count())?;
    if total_threads != layout.total_threads {
        return Err(TopologyError::cross_validation(format!(
            "NUMA reports {total_threads} configured CPUs, CPUID reports {} threads",
            layout.total_threads
        )));
    }

    let available_threads = query("task CPU count", numa.task_cpu_count())?;
    if available_threads > total_threads {
        return Err(TopologyError::numa(format!(
            "{available_threads} available CPUs exceed {total_threads} configured"
        )));
    }

    let inventory = NumaInventory {
        total_nodes,
        available_nodes,
        total_threads,
        available_threads,
    };
    log::debug!("NUMA inventory: {:?}", inventory);
    Ok(inventory)
}
