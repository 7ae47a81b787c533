//! Affinity-based topology probing.
//!
//! The only way to learn which x2APIC id belongs to which OS CPU is to run on
//! that CPU and ask. For every node the task may use, the calling thread is
//! pinned to each of the node's CPUs in ascending order and leaf 0xB is read
//! while pinned.

use crate::affinity::{AffinityGuard, ThreadAffinity};
use crate::cpuid::{leaf, CpuidOracle};
use crate::error::{Result, TopologyError};
use crate::layout::LogicalLayout;
use crate::numa::{is_range_error, NumaBackend, NumaInventory};
use crate::system::{CpuThreadInfo, LocalCpuInfo, NumaNodeInfo};

/// Nodes and the flat thread list they index into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedTopology {
    pub nodes: Vec<NumaNodeInfo>,
    pub threads: Vec<CpuThreadInfo>,
}

/// Read the x2APIC id of the processor the thread currently runs on
fn current_hardware_id<O: CpuidOracle + ?Sized>(cpuid: &O) -> u32 {
    cpuid.identify(leaf::EXTENDED_TOPOLOGY, 0).edx
}

fn probe_node<O, A>(
    cpuid: &O,
    guard: &AffinityGuard<'_, A>,
    layout: &LogicalLayout,
    node: u32,
    cpus: &crate::numa::Bitmask,
) -> Result<(Vec<CpuThreadInfo>, bool)>
where
    O: CpuidOracle + ?Sized,
    A: ThreadAffinity + ?Sized,
{
    let mut observed = Vec::with_capacity(cpus.weight());
    for cpu in cpus.iter() {
        guard
            .pin_to(cpu)
            .map_err(|e| TopologyError::numa_node(node, format!("failed to pin thread to CPU {cpu}: {e}")))?;
        let hardware_id = current_hardware_id(cpuid);
        log::trace!("node {} cpu {} -> x2apic {:#x}", node, cpu, hardware_id);
        observed.push(CpuThreadInfo::new(cpu, hardware_id));
    }

    observed.sort_by_key(|t| t.hardware_id());
    if let Some(pair) = observed
        .windows(2)
        .find(|w| w[0].hardware_id() == w[1].hardware_id())
    {
        let (a, b) = (pair[0].os_id(), pair[1].os_id());
        return Err(TopologyError::DuplicateTopologyId {
            node,
            hardware_id: pair[0].hardware_id(),
            first_cpu: a.min(b),
            second_cpu: a.max(b),
        });
    }

    // sorted by hardware id, so equal core ids are adjacent
    let mut core_ids: Vec<u32> = observed
        .iter()
        .map(|t| t.hardware_id() >> layout.smt_id_bits)
        .collect();
    core_ids.dedup();

    let threads = observed.len();
    let uses_smt = threads > core_ids.len() || threads > layout.total_cores as usize;
    Ok((observed, uses_smt))
}

/// Probe every available node and cross-check the totals against the census
pub fn probe_nodes<O, N, A>(
    cpuid: &O,
    numa: &N,
    guard: &AffinityGuard<'_, A>,
    layout: &LogicalLayout,
    inventory: &NumaInventory,
) -> Result<ProbedTopology>
where
    O: CpuidOracle + ?Sized,
    N: NumaBackend + ?Sized,
    A: ThreadAffinity + ?Sized,
{
    let max_node = numa
        .max_possible_node()
        .map_err(|e| TopologyError::numa(format!("failed to query highest node: {e}")))?;

    let mut nodes = Vec::new();
    let mut threads = Vec::new();

    for node in 0..=max_node {
        let available = numa
            .is_task_node(node)
            .map_err(|e| TopologyError::numa_node(node, format!("failed to query availability: {e}")))?;
        if !available {
            continue;
        }

        let cpus = numa.node_to_cpus(node).map_err(|e| {
            if is_range_error(&e) {
                TopologyError::numa_node(node, "CPU bitmask too small for the node's CPU list")
            } else {
                TopologyError::numa_node(node, format!("failed to query CPUs: {e}"))
            }
        })?;
        let reachable = cpus.intersect(guard.original());
        if reachable.is_empty() {
            return Err(TopologyError::numa_node(
                node,
                format!("no usable CPUs (node CPUs: {cpus}, allowed: {})", guard.original()),
            ));
        }

        let (observed, uses_smt) = probe_node(cpuid, guard, layout, node, &reachable)?;
        log::debug!(
            "node {}: {} threads on CPUs {}, smt={}",
            node,
            observed.len(),
            reachable,
            uses_smt
        );

        let local = LocalCpuInfo::new(threads.len(), observed.len(), uses_smt);
        threads.extend(observed);
        nodes.push(NumaNodeInfo::new(node, local));
    }

    if threads.len() != inventory.available_threads as usize {
        return Err(TopologyError::cross_validation(format!(
            "probed {} threads across nodes, but {} CPUs are available",
            threads.len(),
            inventory.available_threads
        )));
    }
    if nodes.len() != inventory.available_nodes as usize {
        return Err(TopologyError::cross_validation(format!(
            "probed {} nodes, but {} are available",
            nodes.len(),
            inventory.available_nodes
        )));
    }

    Ok(ProbedTopology { nodes, threads })
}
