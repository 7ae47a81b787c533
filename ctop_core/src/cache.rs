use std::fmt;

use serde::Serialize;

use crate::cpuid::{bits, leaf, subleaves, CpuidOracle};
use crate::error::{Result, TopologyError};
use crate::layout::LogicalLayout;

// leaf 4, EAX
const TYPE_OFFSET: u32 = 0;
const TYPE_WIDTH: u32 = 5;
const LEVEL_OFFSET: u32 = 5;
const LEVEL_WIDTH: u32 = 3;
const SELF_INIT_BIT: u32 = 8;
const FULLY_ASSOC_BIT: u32 = 9;
const SHARING_OFFSET: u32 = 14;
const SHARING_WIDTH: u32 = 12;

// leaf 4, EBX
const LINE_SIZE_OFFSET: u32 = 0;
const LINE_SIZE_WIDTH: u32 = 12;
const PARTITIONS_OFFSET: u32 = 12;
const PARTITIONS_WIDTH: u32 = 10;
const WAYS_OFFSET: u32 = 22;
const WAYS_WIDTH: u32 = 10;

// leaf 4, EDX
const WBINVD_BIT: u32 = 0;
const INCLUSIVE_BIT: u32 = 1;
const COMPLEX_INDEX_BIT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheType {
    Instruction,
    Data,
    Unified,
}

impl CacheType {
    fn from_bits(value: u32) -> Option<Self> {
        match value {
            1 => Some(CacheType::Data),
            2 => Some(CacheType::Instruction),
            3 => Some(CacheType::Unified),
            _ => None,
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheType::Instruction => write!(f, "Instruction"),
            CacheType::Data => write!(f, "Data"),
            CacheType::Unified => write!(f, "Unified"),
        }
    }
}

/// Which logical processors share a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheScope {
    Core,
    Package,
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheScope::Core => write!(f, "core"),
            CacheScope::Package => write!(f, "package"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheDescriptor {
    pub level: u32,
    pub cache_type: CacheType,
    pub scope: CacheScope,
    /// Total size in bytes
    pub size: u64,
    pub line_size: u32,
    pub line_partitions: u32,
    pub associativity: u32,
    pub sets: u32,
    pub self_initializing: bool,
    pub fully_associative: bool,
    pub inclusive: bool,
    pub direct_mapped: bool,
    /// WBINVD/INVD issued by a sharing thread also acts on lower-level caches
    pub invalidate_propagates: bool,
}

impl fmt::Display for CacheDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "L{} {}: {} KiB, {}-byte lines, {}-way, {} sets, per {}",
            self.level,
            self.cache_type,
            self.size / 1024,
            self.line_size,
            self.associativity,
            self.sets,
            self.scope
        )?;
        if self.inclusive {
            write!(f, ", inclusive")?;
        }
        Ok(())
    }
}

/// Decode one non-terminator sub-leaf of leaf 4
fn decode_descriptor(
    subleaf: u32,
    regs: &crate::cpuid::Registers,
    layout: &LogicalLayout,
) -> Result<CacheDescriptor> {
    let raw_type = bits(regs.eax, TYPE_OFFSET, TYPE_WIDTH);
    let cache_type = CacheType::from_bits(raw_type).ok_or(TopologyError::UnknownCacheType {
        subleaf,
        value: raw_type,
    })?;

    let sharing = (bits(regs.eax, SHARING_OFFSET, SHARING_WIDTH) + 1).next_power_of_two();
    let scope = if sharing == layout.threads_per_core() {
        CacheScope::Core
    } else if sharing == layout.threads_per_package() {
        CacheScope::Package
    } else {
        return Err(TopologyError::topology(
            leaf::CACHE_PARAMETERS,
            format!(
                "sub-leaf {subleaf}: cache shared by {sharing} ids, expected {} (core) or {} (package)",
                layout.threads_per_core(),
                layout.threads_per_package()
            ),
        ));
    };

    let line_size = bits(regs.ebx, LINE_SIZE_OFFSET, LINE_SIZE_WIDTH) + 1;
    let line_partitions = bits(regs.ebx, PARTITIONS_OFFSET, PARTITIONS_WIDTH) + 1;
    let associativity = bits(regs.ebx, WAYS_OFFSET, WAYS_WIDTH) + 1;
    let sets = u64::from(regs.ecx) + 1;
    let sets = u32::try_from(sets).map_err(|_| {
        TopologyError::topology(leaf::CACHE_PARAMETERS, format!("sub-leaf {subleaf}: set count overflows"))
    })?;

    Ok(CacheDescriptor {
        level: bits(regs.eax, LEVEL_OFFSET, LEVEL_WIDTH),
        cache_type,
        scope,
        size: u64::from(line_size)
            * u64::from(line_partitions)
            * u64::from(associativity)
            * u64::from(sets),
        line_size,
        line_partitions,
        associativity,
        sets,
        self_initializing: bits(regs.eax, SELF_INIT_BIT, 1) == 1,
        fully_associative: bits(regs.eax, FULLY_ASSOC_BIT, 1) == 1,
        invalidate_propagates: bits(regs.edx, WBINVD_BIT, 1) == 0,
        inclusive: bits(regs.edx, INCLUSIVE_BIT, 1) == 1,
        direct_mapped: bits(regs.edx, COMPLEX_INDEX_BIT, 1) == 0,
    })
}

/// Enumerate the cache hierarchy from leaf 4
pub fn decode_caches<O: CpuidOracle + ?Sized>(
    cpuid: &O,
    layout: &LogicalLayout,
) -> Result<Vec<CacheDescriptor>> {
    cpuid.require_leaf(leaf::CACHE_PARAMETERS)?;

    let mut caches = Vec::new();
    for entry in subleaves(cpuid, leaf::CACHE_PARAMETERS, |r| {
        bits(r.eax, TYPE_OFFSET, TYPE_WIDTH) == 0
    }) {
        let (subleaf, regs) = entry?;
        let cache = decode_descriptor(subleaf, &regs, layout)?;
        log::debug!("cache sub-leaf {}: {}", subleaf, cache);
        caches.push(cache);
    }
    Ok(caches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuid::Registers;
    use crate::testing::{cache_regs, haswell_layout, ScriptedCpuid};

    fn haswell_caches(cpuid: &mut ScriptedCpuid) {
        // L1d, L1i, L2 per core; L3 per package
        cpuid.set(4, 0, cache_regs(1, 1, 2, 64, 8, 64));
        cpuid.set(4, 1, cache_regs(2, 1, 2, 64, 8, 64));
        cpuid.set(4, 2, cache_regs(3, 2, 2, 64, 8, 512));
        cpuid.set(4, 3, cache_regs(3, 3, 8, 64, 16, 8192));
    }

    #[test]
    fn test_decode_hierarchy() {
        let mut cpuid = ScriptedCpuid::new(0xD);
        haswell_caches(&mut cpuid);

        let caches = decode_caches(&cpuid, &haswell_layout()).unwrap();
        assert_eq!(caches.len(), 4);

        assert_eq!(caches[0].cache_type, CacheType::Data);
        assert_eq!(caches[0].level, 1);
        assert_eq!(caches[0].size, 32 * 1024);
        assert_eq!(caches[0].scope, CacheScope::Core);

        assert_eq!(caches[1].cache_type, CacheType::Instruction);
        assert_eq!(caches[2].size, 256 * 1024);

        assert_eq!(caches[3].cache_type, CacheType::Unified);
        assert_eq!(caches[3].level, 3);
        assert_eq!(caches[3].scope, CacheScope::Package);
        assert_eq!(caches[3].size, 8 * 1024 * 1024);

        for cache in &caches {
            assert_eq!(
                cache.size,
                u64::from(cache.line_size)
                    * u64::from(cache.line_partitions)
                    * u64::from(cache.associativity)
                    * u64::from(cache.sets)
            );
        }
    }

    #[test]
    fn test_sharing_rounds_up() {
        let mut cpuid = ScriptedCpuid::new(0xD);
        // 6 sharing ids round up to 8, the package width
        cpuid.set(4, 0, cache_regs(3, 3, 6, 64, 12, 8192));
        let caches = decode_caches(&cpuid, &haswell_layout()).unwrap();
        assert_eq!(caches[0].scope, CacheScope::Package);
    }

    #[test]
    fn test_sharing_mismatch() {
        let mut cpuid = ScriptedCpuid::new(0xD);
        cpuid.set(4, 0, cache_regs(1, 1, 2, 64, 8, 64));
        // 4 ids: neither 2 per core nor 8 per package
        cpuid.set(4, 1, cache_regs(2, 3, 4, 64, 8, 512));

        let err = decode_caches(&cpuid, &haswell_layout()).unwrap_err();
        assert!(matches!(err, TopologyError::MalformedTopology { leaf: 4, .. }));
        assert!(err.to_string().contains("sub-leaf 1"));
    }

    #[test]
    fn test_unknown_type() {
        let mut cpuid = ScriptedCpuid::new(0xD);
        cpuid.set(4, 0, cache_regs(7, 1, 2, 64, 8, 64));
        assert!(matches!(
            decode_caches(&cpuid, &haswell_layout()),
            Err(TopologyError::UnknownCacheType { subleaf: 0, value: 7 })
        ));
    }

    #[test]
    fn test_flags() {
        let mut cpuid = ScriptedCpuid::new(0xD);
        let mut regs = cache_regs(3, 3, 8, 64, 16, 8192);
        regs.eax |= 1 << SELF_INIT_BIT;
        regs.edx = 0b110;
        cpuid.set(4, 0, regs);

        let cache = &decode_caches(&cpuid, &haswell_layout()).unwrap()[0];
        assert!(cache.self_initializing);
        assert!(!cache.fully_associative);
        assert!(cache.inclusive);
        assert!(!cache.direct_mapped);
        assert!(cache.invalidate_propagates);
    }

    #[test]
    fn test_line_partitions() {
        let mut cpuid = ScriptedCpuid::new(0xD);
        let mut regs = cache_regs(3, 3, 8, 64, 16, 4096);
        // 4 partitions, stored as 3
        regs.ebx |= 3 << PARTITIONS_OFFSET;
        cpuid.set(4, 0, regs);

        let cache = &decode_caches(&cpuid, &haswell_layout()).unwrap()[0];
        assert_eq!(cache.line_partitions, 4);
        assert_eq!(cache.line_size, 64);
        assert_eq!(cache.associativity, 16);
        assert_eq!(cache.size, 64 * 4 * 16 * 4096);
    }

    #[test]
    fn test_no_caches() {
        let cpuid = ScriptedCpuid::new(0xD).with_default(Registers::default());
        assert!(decode_caches(&cpuid, &haswell_layout()).unwrap().is_empty());
    }
}
