use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

use serde::Serialize;

use crate::affinity::{AffinityGuard, ThreadAffinity};
use crate::cache::{decode_caches, CacheDescriptor};
use crate::cpuid::CpuidOracle;
use crate::error::{Result, TopologyError};
use crate::layout::{decode_layout, LogicalLayout};
use crate::numa::{collect_inventory, NumaBackend};
use crate::probe::probe_nodes;
use crate::version::{decode_version, CpuVersion};

/// Machine-wide facts that do not depend on the NUMA node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalCpuInfo {
    version: CpuVersion,
    caches: Vec<CacheDescriptor>,
    layout: LogicalLayout,
}

impl GlobalCpuInfo {
    pub fn version(&self) -> &CpuVersion {
        &self.version
    }

    pub fn caches(&self) -> &[CacheDescriptor] {
        &self.caches
    }

    pub fn layout(&self) -> &LogicalLayout {
        &self.layout
    }

    pub fn total_threads(&self) -> u32 {
        self.layout.total_threads
    }

    pub fn total_cores(&self) -> u32 {
        self.layout.total_cores
    }

    pub fn smt_id_bits(&self) -> u32 {
        self.layout.smt_id_bits
    }

    pub fn core_id_bits(&self) -> u32 {
        self.layout.core_id_bits
    }

    pub fn package_id_bits(&self) -> u32 {
        self.layout.package_id_bits
    }

    pub fn threads_per_core(&self) -> u32 {
        self.layout.threads_per_core()
    }

    pub fn threads_per_package(&self) -> u32 {
        self.layout.threads_per_package()
    }
}

/// One hardware thread the process can run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuThreadInfo {
    os_id: u32,
    hardware_id: u32,
}

impl CpuThreadInfo {
    pub(crate) fn new(os_id: u32, hardware_id: u32) -> Self {
        Self { os_id, hardware_id }
    }

    /// Logical processor id used by the OS affinity calls
    pub fn os_id(&self) -> u32 {
        self.os_id
    }

    /// x2APIC id, unique across the machine
    pub fn hardware_id(&self) -> u32 {
        self.hardware_id
    }

    /// Low `smt_id_bits` of the hardware id
    pub fn smt_id(&self, layout: &LogicalLayout) -> u32 {
        self.hardware_id & low_mask(layout.smt_id_bits)
    }

    /// The `core_id_bits` above the SMT field.
    ///
    /// The id is read as three disjoint fields, SMT then core then package,
    /// matching `package_id_bits = 32 - smt_id_bits - core_id_bits`.
    /// `core_id_bits` is the raw leaf 0xB core-level shift, which hardware
    /// reports as a cumulative width including the SMT bits. On such ids
    /// this field and [`Self::package_id`] sit `smt_id_bits` higher than the
    /// x2APIC package boundary.
    pub fn core_id(&self, layout: &LogicalLayout) -> u32 {
        self.hardware_id.checked_shr(layout.smt_id_bits).unwrap_or(0) & low_mask(layout.core_id_bits)
    }

    /// Bits above both the SMT and core fields, see [`Self::core_id`]
    pub fn package_id(&self, layout: &LogicalLayout) -> u32 {
        layout
            .smt_id_bits
            .checked_add(layout.core_id_bits)
            .and_then(|shift| self.hardware_id.checked_shr(shift))
            .unwrap_or(0)
    }
}

fn low_mask(width: u32) -> u32 {
    1u32.checked_shl(width).map_or(u32::MAX, |v| v - 1)
}

/// Node-local slice of the flat thread list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LocalCpuInfo {
    first: usize,
    count: usize,
    uses_smt: bool,
}

impl LocalCpuInfo {
    pub(crate) fn new(first: usize, count: usize, uses_smt: bool) -> Self {
        Self {
            first,
            count,
            uses_smt,
        }
    }

    /// Indices into [`SystemInfo::threads`]
    pub fn range(&self) -> Range<usize> {
        self.first..self.first + self.count
    }

    pub fn thread_count(&self) -> usize {
        self.count
    }

    pub fn uses_smt(&self) -> bool {
        self.uses_smt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NumaNodeInfo {
    id: u32,
    cpu: LocalCpuInfo,
}

impl NumaNodeInfo {
    pub(crate) fn new(id: u32, cpu: LocalCpuInfo) -> Self {
        Self { id, cpu }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn cpu_info(&self) -> &LocalCpuInfo {
        &self.cpu
    }
}

/// Point-in-time topology snapshot
///
/// Valid for the affinity mask the process had when it was taken.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    cpu: GlobalCpuInfo,
    total_numa_nodes: u32,
    available_numa_nodes: u32,
    total_threads: u32,
    available_threads: u32,
    nodes: Vec<NumaNodeInfo>,
    threads: Vec<CpuThreadInfo>,
}

impl SystemInfo {
    pub fn cpu_info(&self) -> &GlobalCpuInfo {
        &self.cpu
    }

    pub fn total_numa_nodes(&self) -> u32 {
        self.total_numa_nodes
    }

    pub fn available_numa_nodes(&self) -> u32 {
        self.available_numa_nodes
    }

    pub fn total_threads(&self) -> u32 {
        self.total_threads
    }

    pub fn available_threads(&self) -> u32 {
        self.available_threads
    }

    pub fn numa_nodes(&self) -> &[NumaNodeInfo] {
        &self.nodes
    }

    /// Every probed thread, grouped by node
    pub fn threads(&self) -> &[CpuThreadInfo] {
        &self.threads
    }

    pub fn node(&self, id: u32) -> Option<&NumaNodeInfo> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_threads(&self, node: &NumaNodeInfo) -> &[CpuThreadInfo] {
        self.threads.get(node.cpu.range()).unwrap_or(&[])
    }

    /// Node whose thread list holds OS CPU `os_id`
    pub fn node_of_cpu(&self, os_id: u32) -> Option<&NumaNodeInfo> {
        self.nodes
            .iter()
            .find(|n| self.node_threads(n).iter().any(|t| t.os_id == os_id))
    }

    /// Re-check the snapshot invariants
    pub fn validate(&self) -> Result<()> {
        let layout = &self.cpu.layout;
        let fail = |reason: String| Err(TopologyError::cross_validation(reason));

        let id_bits = layout.smt_id_bits.checked_add(layout.core_id_bits);
        if id_bits.map_or(true, |bits| bits > 32 || layout.package_id_bits != 32 - bits) {
            return fail(format!("inconsistent id bit widths {layout:?}"));
        }
        if layout.smt_count == 0
            || layout.total_threads % layout.smt_count != 0
            || layout.total_cores != layout.total_threads / layout.smt_count
        {
            return fail(format!("inconsistent thread and core totals {layout:?}"));
        }
        if self.available_numa_nodes > self.total_numa_nodes {
            return fail(format!(
                "{} available nodes exceed {} total",
                self.available_numa_nodes, self.total_numa_nodes
            ));
        }
        if self.available_threads > self.total_threads {
            return fail(format!(
                "{} available threads exceed {} total",
                self.available_threads, self.total_threads
            ));
        }

        let mut next = 0;
        for node in &self.nodes {
            let range = node.cpu.range();
            if range.start != next || range.end > self.threads.len() {
                return fail(format!("node {} thread range {range:?} is not contiguous", node.id));
            }
            next = range.end;

            let mut seen = HashSet::new();
            if let Some(dup) = self.threads[range].iter().find(|t| !seen.insert(t.hardware_id)) {
                return fail(format!(
                    "node {} repeats hardware id {:#x}",
                    node.id, dup.hardware_id
                ));
            }
        }
        if next != self.available_threads as usize || next != self.threads.len() {
            return fail(format!(
                "node thread counts sum to {next}, expected {}",
                self.available_threads
            ));
        }
        Ok(())
    }
}

/// Run every decoder and the probe against the given capabilities
pub fn query_system<O, N, A>(cpuid: &O, numa: &N, affinity: &A, restore_affinity: bool) -> Result<SystemInfo>
where
    O: CpuidOracle + ?Sized,
    N: NumaBackend + ?Sized,
    A: ThreadAffinity + ?Sized,
{
    let version = decode_version(cpuid)?;
    // cache sharing is checked against the id widths, so layout comes first
    let layout = decode_layout(cpuid)?;
    let caches = decode_caches(cpuid, &layout)?;
    let cpu = GlobalCpuInfo {
        version,
        caches,
        layout,
    };

    let inventory = collect_inventory(numa, &layout)?;
    let probed = {
        let guard = AffinityGuard::new(affinity, restore_affinity)
            .map_err(|e| TopologyError::numa(format!("failed to read thread affinity: {e}")))?;
        probe_nodes(cpuid, numa, &guard, &layout, &inventory)?
    };

    let info = SystemInfo {
        cpu,
        total_numa_nodes: inventory.total_nodes,
        available_numa_nodes: inventory.available_nodes,
        total_threads: inventory.total_threads,
        available_threads: inventory.available_threads,
        nodes: probed.nodes,
        threads: probed.threads,
    };
    info.validate()?;
    Ok(info)
}

impl fmt::Display for SystemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cpu = &self.cpu;
        writeln!(f, "CPU: {}", cpu.version)?;
        writeln!(
            f,
            "  Threads: {}, Cores: {}, Id bits: SMT {} / core {} / package {}",
            cpu.total_threads(),
            cpu.total_cores(),
            cpu.smt_id_bits(),
            cpu.core_id_bits(),
            cpu.package_id_bits()
        )?;
        for cache in &cpu.caches {
            writeln!(f, "  {cache}")?;
        }

        writeln!(
            f,
            "NUMA nodes: {}/{} available, threads: {}/{} available",
            self.available_numa_nodes, self.total_numa_nodes, self.available_threads, self.total_threads
        )?;
        for node in &self.nodes {
            let smt = if node.cpu.uses_smt { ", SMT" } else { "" };
            writeln!(f, " Node {}: {} threads{}", node.id, node.cpu.count, smt)?;
            for thread in self.node_threads(node) {
                writeln!(
                    f,
                    "  CPU {:>3}: x2apic {:#06x} (package {}, core {}, smt {})",
                    thread.os_id,
                    thread.hardware_id,
                    thread.package_id(&cpu.layout),
                    thread.core_id(&cpu.layout),
                    thread.smt_id(&cpu.layout)
                )?;
            }
        }
        Ok(())
    }
}
