//! Identification leaf oracle.
//!
//! Everything that decodes CPUID goes through [`CpuidOracle`], so the decoders
//! run unchanged against the real instruction or a scripted table.

use std::sync::atomic::{compiler_fence, Ordering};

use crate::error::{Result, TopologyError};

/// CPUID leaf indices used by the decoders
pub mod leaf {
    pub const BASIC_INFO: u32 = 0x0;
    pub const VERSION_INFO: u32 = 0x1;
    pub const CACHE_PARAMETERS: u32 = 0x4;
    pub const EXTENDED_TOPOLOGY: u32 = 0xB;
    pub const MAX_EXTENDED: u32 = 0x8000_0000;
    pub const EXTENDED_FEATURE_INFO: u32 = 0x8000_0001;
    pub const BRAND_STRING_1: u32 = 0x8000_0002;
    pub const BRAND_STRING_2: u32 = 0x8000_0003;
    pub const BRAND_STRING_3: u32 = 0x8000_0004;
}

/// Upper bound on sub-leaves walked before a missing terminator is reported
pub const MAX_SUBLEAVES: u32 = 64;

/// The four registers returned by one CPUID invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl Registers {
    pub const fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        Self { eax, ebx, ecx, edx }
    }
}

/// Source of CPUID results.
///
/// `identify` must be re-executed on every call: the prober relies on each
/// read reflecting the processor the calling thread is pinned to right now.
pub trait CpuidOracle {
    fn identify(&self, leaf: u32, subleaf: u32) -> Registers;

    /// Highest basic leaf, `None` when the instruction is unavailable
    fn max_supported_leaf(&self) -> Option<u32>;

    fn max_extended_leaf(&self) -> u32 {
        self.identify(leaf::MAX_EXTENDED, 0).eax
    }

    /// Fails unless `required` (basic or extended) can be queried
    fn require_leaf(&self, required: u32) -> Result<()> {
        let max = self
            .max_supported_leaf()
            .ok_or_else(|| TopologyError::unsupported(required, None))?;

        let reported = if required >= leaf::MAX_EXTENDED {
            self.max_extended_leaf()
        } else {
            max
        };
        if reported < required {
            return Err(TopologyError::unsupported(required, Some(reported)));
        }
        Ok(())
    }
}

impl<T: CpuidOracle + ?Sized> CpuidOracle for &T {
    fn identify(&self, leaf: u32, subleaf: u32) -> Registers {
        (**self).identify(leaf, subleaf)
    }

    fn max_supported_leaf(&self) -> Option<u32> {
        (**self).max_supported_leaf()
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        fn raw_cpuid(leaf: u32, subleaf: u32) -> Registers {
            #[allow(unused_unsafe)]
            let r = unsafe { std::arch::x86_64::__cpuid_count(leaf, subleaf) };
            Registers::new(r.eax, r.ebx, r.ecx, r.edx)
        }

        fn raw_max_leaf() -> Option<u32> {
            #[allow(unused_unsafe)]
            let (max, _) = unsafe { std::arch::x86_64::__get_cpuid_max(leaf::BASIC_INFO) };
            (max != 0).then_some(max)
        }
    } else if #[cfg(target_arch = "x86")] {
        fn raw_cpuid(leaf: u32, subleaf: u32) -> Registers {
            #[allow(unused_unsafe)]
            let r = unsafe { std::arch::x86::__cpuid_count(leaf, subleaf) };
            Registers::new(r.eax, r.ebx, r.ecx, r.edx)
        }

        fn raw_max_leaf() -> Option<u32> {
            if !std::arch::x86::has_cpuid() {
                return None;
            }
            #[allow(unused_unsafe)]
            let (max, _) = unsafe { std::arch::x86::__get_cpuid_max(leaf::BASIC_INFO) };
            (max != 0).then_some(max)
        }
    } else {
        fn raw_cpuid(_leaf: u32, _subleaf: u32) -> Registers {
            Registers::default()
        }

        fn raw_max_leaf() -> Option<u32> {
            None
        }
    }
}

/// The CPUID instruction of the processor the calling thread runs on
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCpuid;

impl CpuidOracle for NativeCpuid {
    fn identify(&self, leaf: u32, subleaf: u32) -> Registers {
        // keep the read ordered against the affinity syscalls around it
        compiler_fence(Ordering::SeqCst);
        let regs = raw_cpuid(leaf, subleaf);
        compiler_fence(Ordering::SeqCst);
        regs
    }

    fn max_supported_leaf(&self) -> Option<u32> {
        raw_max_leaf()
    }
}

/// Human-readable name of a leaf, for error context
pub fn leaf_name(index: u32) -> &'static str {
    match index {
        leaf::BASIC_INFO => "basic_info",
        leaf::VERSION_INFO => "version_info",
        0x2 => "cache_tlb_info",
        0x3 => "serial_number",
        leaf::CACHE_PARAMETERS => "cache_parameters",
        0x5 => "monitor_mwait_info",
        0x6 => "thermal_power_management_info",
        0x7 => "extended_feature_flags",
        leaf::EXTENDED_TOPOLOGY => "extended_topology",
        0xD => "processor_state_info",
        0x1F => "extended_topology_v2",
        leaf::MAX_EXTENDED => "max_extended_leaf",
        leaf::EXTENDED_FEATURE_INFO => "extended_feature_info",
        leaf::BRAND_STRING_1 => "brand_string_part_1",
        leaf::BRAND_STRING_2 => "brand_string_part_2",
        leaf::BRAND_STRING_3 => "brand_string_part_3",
        0x8000_0006 => "l2_cache_info",
        0x8000_0008 => "address_info",
        _ => "unknown",
    }
}

/// Walks the sub-leaves of an enumerable leaf, see [`subleaves`]
pub struct Subleaves<'a, O: ?Sized, F> {
    oracle: &'a O,
    leaf: u32,
    next: u32,
    is_terminator: F,
    done: bool,
}

/// Iterate `leaf` from sub-leaf 0 until `is_terminator` matches.
///
/// The terminating sub-leaf itself is not yielded. A leaf that never
/// terminates within [`MAX_SUBLEAVES`] yields one `MalformedTopology` error.
pub fn subleaves<O, F>(oracle: &O, leaf: u32, is_terminator: F) -> Subleaves<'_, O, F>
where
    O: CpuidOracle + ?Sized,
    F: FnMut(&Registers) -> bool,
{
    Subleaves {
        oracle,
        leaf,
        next: 0,
        is_terminator,
        done: false,
    }
}

impl<O, F> Iterator for Subleaves<'_, O, F>
where
    O: CpuidOracle + ?Sized,
    F: FnMut(&Registers) -> bool,
{
    type Item = Result<(u32, Registers)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.next >= MAX_SUBLEAVES {
            self.done = true;
            return Some(Err(TopologyError::topology(
                self.leaf,
                format!("no terminating sub-leaf within {MAX_SUBLEAVES} sub-leaves"),
            )));
        }

        let subleaf = self.next;
        let regs = self.oracle.identify(self.leaf, subleaf);
        if (self.is_terminator)(&regs) {
            self.done = true;
            return None;
        }
        self.next += 1;
        Some(Ok((subleaf, regs)))
    }
}

/// Extract `width` bits starting at `offset`
#[inline]
pub(crate) const fn bits(value: u32, offset: u32, width: u32) -> u32 {
    (value >> offset) & ((1u32 << width) - 1)
}
