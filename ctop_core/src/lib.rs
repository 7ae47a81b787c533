//! CPU and NUMA topology discovery.
//!
//! A query decodes the processor identity, cache hierarchy and x2APIC id
//! layout from CPUID, counts NUMA nodes and CPUs, then pins the calling thread
//! to every usable CPU in turn to learn which hardware thread each OS CPU is.
//! The result is one [`SystemInfo`] snapshot, or the first error met.

mod affinity;
mod cache;
mod config;
mod cpuid;
mod error;
mod layout;
mod numa;
mod probe;
mod system;
mod version;

#[cfg(test)]
mod testing;

pub use affinity::{AffinityGuard, NativeAffinity, ThreadAffinity};
pub use cache::{decode_caches, CacheDescriptor, CacheScope, CacheType};
pub use config::{load_query_config, parse_query_config, QueryConfig};
pub use cpuid::{leaf, leaf_name, subleaves, CpuidOracle, NativeCpuid, Registers, Subleaves, MAX_SUBLEAVES};
pub use error::{Result, TopologyError};
pub use layout::{decode_layout, LogicalLayout, MAX_SMT_THREADS};
pub use numa::{collect_inventory, Bitmask, NumaBackend, NumaInventory, SysfsNuma};
pub use probe::{probe_nodes, ProbedTopology};
pub use system::{query_system, CpuThreadInfo, GlobalCpuInfo, LocalCpuInfo, NumaNodeInfo, SystemInfo};
pub use version::{decode_version, CpuVersion, ProcessorType, Vendor};

/// Query the running machine with the default sources
pub fn system_query() -> Result<SystemInfo> {
    system_query_with(&QueryConfig::default())
}

pub fn system_query_with(config: &QueryConfig) -> Result<SystemInfo> {
    config.validate()?;
    let numa = SysfsNuma::from_config(config);
    query_system(&NativeCpuid, &numa, &NativeAffinity, config.restore_affinity)
}
