//! Scripted capabilities shared by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tempfile::TempDir;

use crate::affinity::ThreadAffinity;
use crate::cpuid::{leaf, CpuidOracle, Registers};
use crate::layout::LogicalLayout;
use crate::numa::{range_error, Bitmask, NumaBackend};

type PinnedCpu = Rc<Cell<Option<u32>>>;

/// CPUID table keyed by (leaf, sub-leaf).
///
/// Once it follows a [`FakeAffinity`], leaf 0xB EDX reports the x2APIC id
/// registered for whichever CPU the fake is pinned to.
#[derive(Debug, Clone)]
pub struct ScriptedCpuid {
    max_leaf: Option<u32>,
    table: HashMap<(u32, u32), Registers>,
    default: Registers,
    pinned: Option<PinnedCpu>,
    x2apic: HashMap<u32, u32>,
}

impl ScriptedCpuid {
    pub fn new(max_leaf: u32) -> Self {
        Self {
            max_leaf: Some(max_leaf),
            table: HashMap::new(),
            default: Registers::default(),
            pinned: None,
            x2apic: HashMap::new(),
        }
    }

    /// A processor without the CPUID instruction
    pub fn unsupported() -> Self {
        Self {
            max_leaf: None,
            ..Self::new(0)
        }
    }

    /// Registers returned for any unscripted (leaf, sub-leaf)
    pub fn with_default(mut self, regs: Registers) -> Self {
        self.default = regs;
        self
    }

    pub fn set(&mut self, leaf: u32, subleaf: u32, regs: Registers) {
        self.table.insert((leaf, subleaf), regs);
    }

    pub fn set_vendor(&mut self, id: &[u8; 12]) {
        let word = |at: usize| u32::from_le_bytes([id[at], id[at + 1], id[at + 2], id[at + 3]]);
        let max = self.max_leaf.unwrap_or(0);
        self.set(leaf::BASIC_INFO, 0, Registers::new(max, word(0), word(8), word(4)));
    }

    pub fn set_brand(&mut self, brand: &str) {
        self.set(leaf::MAX_EXTENDED, 0, Registers::new(0x8000_0008, 0, 0, 0));
        let parts = brand_leaves(brand);
        self.set(leaf::BRAND_STRING_1, 0, parts[0]);
        self.set(leaf::BRAND_STRING_2, 0, parts[1]);
        self.set(leaf::BRAND_STRING_3, 0, parts[2]);
    }

    pub fn follow(mut self, affinity: &FakeAffinity) -> Self {
        self.pinned = Some(Rc::clone(&affinity.pinned));
        self
    }

    pub fn x2apic(mut self, cpu: u32, id: u32) -> Self {
        self.x2apic.insert(cpu, id);
        self
    }
}

impl CpuidOracle for ScriptedCpuid {
    fn identify(&self, leaf: u32, subleaf: u32) -> Registers {
        let mut regs = self.table.get(&(leaf, subleaf)).copied().unwrap_or(self.default);
        if leaf == leaf::EXTENDED_TOPOLOGY {
            let cpu = self.pinned.as_ref().and_then(|p| p.get());
            if let Some(id) = cpu.and_then(|cpu| self.x2apic.get(&cpu)) {
                regs.edx = *id;
            }
        }
        regs
    }

    fn max_supported_leaf(&self) -> Option<u32> {
        self.max_leaf
    }
}

/// Thread affinity over an in-memory mask, limited to `allowed`
#[derive(Debug)]
pub struct FakeAffinity {
    allowed: Bitmask,
    current: RefCell<Bitmask>,
    pinned: PinnedCpu,
    history: RefCell<Vec<u32>>,
    fail_on: Option<u32>,
}

impl FakeAffinity {
    pub fn new(allowed: &[u32]) -> Self {
        let capacity = allowed.iter().max().map_or(1, |&max| max as usize + 1);
        let mut mask = Bitmask::new(capacity);
        for &cpu in allowed {
            mask.set(cpu).unwrap();
        }
        Self {
            allowed: mask.clone(),
            current: RefCell::new(mask),
            pinned: Rc::new(Cell::new(None)),
            history: RefCell::new(Vec::new()),
            fail_on: None,
        }
    }

    /// Refuse to pin to `cpu`
    pub fn fail_on(mut self, cpu: u32) -> Self {
        self.fail_on = Some(cpu);
        self
    }

    /// The single CPU the thread is restricted to, if any
    pub fn pinned(&self) -> Option<u32> {
        self.pinned.get()
    }

    /// Every single-CPU mask that was applied, in order
    pub fn pin_history(&self) -> Vec<u32> {
        self.history.borrow().clone()
    }
}

impl ThreadAffinity for FakeAffinity {
    fn current(&self) -> io::Result<Bitmask> {
        Ok(self.current.borrow().clone())
    }

    fn set(&self, mask: &Bitmask) -> io::Result<()> {
        if let Some(cpu) = mask.iter().find(|&cpu| !self.allowed.is_set(cpu)) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("CPU {cpu} not allowed"),
            ));
        }

        let single = (mask.weight() == 1).then(|| mask.iter().next()).flatten();
        if single.is_some() && single == self.fail_on {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "pin refused"));
        }

        *self.current.borrow_mut() = mask.clone();
        self.pinned.set(single);
        if let Some(cpu) = single {
            self.history.borrow_mut().push(cpu);
        }
        Ok(())
    }
}

/// In-memory NUMA backend
#[derive(Debug, Clone)]
pub struct FakeNuma {
    configured_cpus: u32,
    nodes: BTreeMap<u32, Vec<u32>>,
    task_nodes: Option<Vec<u32>>,
    task_cpus: Option<u32>,
    available: bool,
    range_error_on: Option<u32>,
}

impl FakeNuma {
    pub fn new(configured_cpus: u32) -> Self {
        Self {
            configured_cpus,
            nodes: BTreeMap::new(),
            task_nodes: None,
            task_cpus: None,
            available: true,
            range_error_on: None,
        }
    }

    pub fn node(mut self, id: u32, cpus: &[u32]) -> Self {
        self.nodes.insert(id, cpus.to_vec());
        self
    }

    pub fn task_nodes(mut self, ids: &[u32]) -> Self {
        self.task_nodes = Some(ids.to_vec());
        self
    }

    pub fn task_cpus(mut self, count: u32) -> Self {
        self.task_cpus = Some(count);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn range_error_on(mut self, node: u32) -> Self {
        self.range_error_on = Some(node);
        self
    }
}

impl NumaBackend for FakeNuma {
    fn is_available(&self) -> bool {
        self.available
    }

    fn configured_node_count(&self) -> io::Result<u32> {
        Ok(self.nodes.len() as u32)
    }

    fn task_node_count(&self) -> io::Result<u32> {
        Ok(self.task_nodes.as_ref().map_or(self.nodes.len(), Vec::len) as u32)
    }

    fn configured_cpu_count(&self) -> io::Result<u32> {
        Ok(self.configured_cpus)
    }

    fn task_cpu_count(&self) -> io::Result<u32> {
        Ok(self.task_cpus.unwrap_or(self.configured_cpus))
    }

    fn max_possible_node(&self) -> io::Result<u32> {
        self.nodes
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no nodes"))
    }

    fn is_task_node(&self, node: u32) -> io::Result<bool> {
        Ok(match &self.task_nodes {
            Some(ids) => ids.contains(&node),
            None => self.nodes.contains_key(&node),
        })
    }

    fn node_to_cpus(&self, node: u32) -> io::Result<Bitmask> {
        if self.range_error_on == Some(node) {
            return Err(range_error());
        }
        let cpus = self
            .nodes
            .get(&node)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no node {node}")))?;
        let mut mask = Bitmask::new(self.configured_cpus as usize);
        for &cpu in cpus {
            mask.set(cpu)?;
        }
        Ok(mask)
    }
}

/// Scratch sysfs/proc tree, removed when dropped
pub struct TempTree {
    dir: TempDir,
}

impl TempTree {
    pub fn new(name: &str) -> Self {
        let dir = tempfile::Builder::new()
            .prefix(&format!("ctop-{name}-"))
            .tempdir()
            .unwrap();
        Self { dir }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    pub fn mkdir(&self, rel: &str) {
        fs::create_dir_all(self.path(rel)).unwrap();
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// Pack a brand string into the three brand leaves, NUL padded
pub fn brand_leaves(brand: &str) -> [Registers; 3] {
    let mut buf = [0u8; 48];
    buf[..brand.len()].copy_from_slice(brand.as_bytes());
    let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    let part = |i: usize| Registers::new(word(i * 16), word(i * 16 + 4), word(i * 16 + 8), word(i * 16 + 12));
    [part(0), part(1), part(2)]
}

/// Leaf 4 registers for one cache level
pub fn cache_regs(cache_type: u32, level: u32, sharing_ids: u32, line_size: u32, ways: u32, sets: u32) -> Registers {
    Registers::new(
        cache_type | level << 5 | (sharing_ids - 1) << 14,
        (line_size - 1) | (ways - 1) << 22,
        sets - 1,
        0,
    )
}

/// Leaf 0xB registers for one level
pub fn topology_regs(level_type: u32, shift: u32, count: u32) -> Registers {
    Registers::new(shift, count, level_type << 8, 0)
}

/// Eight threads, two per core
pub fn haswell_layout() -> LogicalLayout {
    LogicalLayout::new(1, 3, 2, 8).unwrap()
}

/// A complete four-thread, two-core processor whose x2APIC ids follow `affinity`.
///
/// OS CPUs 0 and 2 are the siblings of core 0, CPUs 1 and 3 those of core 1.
pub fn machine(affinity: &FakeAffinity) -> ScriptedCpuid {
    let mut cpuid = ScriptedCpuid::new(0xD);
    cpuid.set_vendor(b"GenuineIntel");
    cpuid.set(leaf::VERSION_INFO, 0, Registers::new(0x0002_06D7, 0, 0, 0));
    cpuid.set_brand("Intel(R) Xeon(R) CPU E5-2620 0 @ 2.00GHz");

    cpuid.set(leaf::EXTENDED_TOPOLOGY, 0, topology_regs(1, 1, 2));
    cpuid.set(leaf::EXTENDED_TOPOLOGY, 1, topology_regs(2, 2, 4));

    cpuid.set(leaf::CACHE_PARAMETERS, 0, cache_regs(1, 1, 2, 64, 8, 64));
    cpuid.set(leaf::CACHE_PARAMETERS, 1, cache_regs(2, 1, 2, 64, 8, 64));
    cpuid.set(leaf::CACHE_PARAMETERS, 2, cache_regs(3, 2, 2, 64, 8, 512));
    cpuid.set(leaf::CACHE_PARAMETERS, 3, cache_regs(3, 3, 4, 64, 20, 12288));

    cpuid
        .follow(affinity)
        .x2apic(0, 0x0)
        .x2apic(2, 0x1)
        .x2apic(1, 0x2)
        .x2apic(3, 0x3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_tree_is_removed() {
        let tree = TempTree::new("cleanup");
        tree.write("node/node0/cpulist", "0-1\n");
        let root = tree.root().to_path_buf();
        assert_eq!(fs::read_to_string(tree.path("node/node0/cpulist")).unwrap(), "0-1\n");
        assert!(root.file_name().unwrap().to_string_lossy().starts_with("ctop-cleanup-"));

        drop(tree);
        assert!(!root.exists());
    }
}
