use serde::Serialize;

use crate::cpuid::{bits, leaf, subleaves, CpuidOracle};
use crate::error::{Result, TopologyError};

// leaf 0xB
const SHIFT_OFFSET: u32 = 0; // EAX
const SHIFT_WIDTH: u32 = 5;
const COUNT_OFFSET: u32 = 0; // EBX
const COUNT_WIDTH: u32 = 16;
const LEVEL_TYPE_OFFSET: u32 = 8; // ECX
const LEVEL_TYPE_WIDTH: u32 = 8;

const LEVEL_SMT: u32 = 1;
const LEVEL_CORE: u32 = 2;

/// Widest SMT the decoder accepts
pub const MAX_SMT_THREADS: u32 = 2;

/// Address-bit layout of the x2APIC id and the thread/core totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogicalLayout {
    pub smt_id_bits: u32,
    pub core_id_bits: u32,
    pub package_id_bits: u32,
    /// Logical processors at the SMT level
    pub smt_count: u32,
    pub total_threads: u32,
    pub total_cores: u32,
}

impl LogicalLayout {
    /// Build a layout from raw level values, enforcing the decoder's limits
    pub fn new(smt_id_bits: u32, core_id_bits: u32, smt_count: u32, total_threads: u32) -> Result<Self> {
        let fail = |reason: String| TopologyError::topology(leaf::EXTENDED_TOPOLOGY, reason);

        if smt_count == 0 || total_threads == 0 {
            return Err(fail(format!(
                "zero logical processor count (SMT level {smt_count}, core level {total_threads})"
            )));
        }
        if smt_count > MAX_SMT_THREADS {
            return Err(fail(format!(
                "{smt_count} threads per core unsupported (at most {MAX_SMT_THREADS})"
            )));
        }
        if total_threads % smt_count != 0 {
            return Err(fail(format!(
                "{total_threads} threads not divisible by SMT count {smt_count}"
            )));
        }
        if smt_id_bits.checked_add(core_id_bits).map_or(true, |sum| sum > 32) {
            return Err(fail(format!(
                "SMT id bits ({smt_id_bits}) and core id bits ({core_id_bits}) exceed 32"
            )));
        }

        Ok(Self {
            smt_id_bits,
            core_id_bits,
            package_id_bits: 32 - smt_id_bits - core_id_bits,
            smt_count,
            total_threads,
            total_cores: total_threads / smt_count,
        })
    }

    /// Sharing ids a per-core resource reports
    pub fn threads_per_core(&self) -> u32 {
        1u64.checked_shl(self.smt_id_bits)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(u32::MAX)
    }

    /// Sharing ids a per-package resource reports
    pub fn threads_per_package(&self) -> u32 {
        // core_id_bits may be 32 when nothing is left for the package
        1u64.checked_shl(self.core_id_bits)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(u32::MAX)
    }

    pub fn uses_smt(&self) -> bool {
        self.smt_count > 1
    }
}

/// Walk leaf 0xB and derive the id bit widths and totals
pub fn decode_layout<O: CpuidOracle + ?Sized>(cpuid: &O) -> Result<LogicalLayout> {
    cpuid.require_leaf(leaf::EXTENDED_TOPOLOGY)?;

    let mut smt = Vec::new();
    let mut core = Vec::new();
    for entry in subleaves(cpuid, leaf::EXTENDED_TOPOLOGY, |r| {
        bits(r.ecx, LEVEL_TYPE_OFFSET, LEVEL_TYPE_WIDTH) == 0
    }) {
        let (subleaf, regs) = entry?;
        let shift = bits(regs.eax, SHIFT_OFFSET, SHIFT_WIDTH);
        let count = bits(regs.ebx, COUNT_OFFSET, COUNT_WIDTH);

        match bits(regs.ecx, LEVEL_TYPE_OFFSET, LEVEL_TYPE_WIDTH) {
            LEVEL_SMT => smt.push((shift, count)),
            LEVEL_CORE => core.push((shift, count)),
            other => {
                return Err(TopologyError::topology(
                    leaf::EXTENDED_TOPOLOGY,
                    format!("sub-leaf {subleaf} has unknown level type {other}"),
                ))
            }
        }
    }

    let (smt_id_bits, smt_count) = match smt.as_slice() {
        [level] => *level,
        levels => {
            return Err(TopologyError::topology(
                leaf::EXTENDED_TOPOLOGY,
                format!("expected exactly one SMT level, found {}", levels.len()),
            ))
        }
    };
    let (core_id_bits, total_threads) = match core.as_slice() {
        [level] => *level,
        levels => {
            return Err(TopologyError::topology(
                leaf::EXTENDED_TOPOLOGY,
                format!("expected exactly one core level, found {}", levels.len()),
            ))
        }
    };

    let layout = LogicalLayout::new(smt_id_bits, core_id_bits, smt_count, total_threads)?;
    log::debug!(
        "layout: {} threads, {} cores, id bits smt={} core={} package={}",
        layout.total_threads,
        layout.total_cores,
        layout.smt_id_bits,
        layout.core_id_bits,
        layout.package_id_bits
    );
    Ok(layout)
}
