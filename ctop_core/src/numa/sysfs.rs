use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use glob::{glob, Pattern};

use super::{Bitmask, NumaBackend};
use crate::config::QueryConfig;

/// NUMA backend over `/sys/devices/system/{node,cpu}` and `/proc/self/status`
#[derive(Debug, Clone)]
pub struct SysfsNuma {
    node_root: PathBuf,
    cpu_root: PathBuf,
    proc_status: PathBuf,
}

impl SysfsNuma {
    pub fn new(
        node_root: impl Into<PathBuf>,
        cpu_root: impl Into<PathBuf>,
        proc_status: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_root: node_root.into(),
            cpu_root: cpu_root.into(),
            proc_status: proc_status.into(),
        }
    }

    pub fn from_config(config: &QueryConfig) -> Self {
        Self::new(&config.node_root, &config.cpu_root, &config.proc_status)
    }

    /// Numeric suffixes of `<root>/<prefix>N` directories, ascending
    fn numbered_dirs(root: &Path, prefix: &str) -> io::Result<Vec<u32>> {
        let pattern = format!(
            "{}/{prefix}[0-9]*",
            Pattern::escape(&root.to_string_lossy())
        );
        let entries = glob(&pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| e.into_error())?;
            if !path.is_dir() {
                continue;
            }
            let id = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(prefix))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(id) = id {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn nodes(&self) -> io::Result<Vec<u32>> {
        Self::numbered_dirs(&self.node_root, "node")
    }

    fn cpus(&self) -> io::Result<Vec<u32>> {
        Self::numbered_dirs(&self.cpu_root, "cpu")
    }

    /// Mask size able to hold every CPU id the kernel knows
    fn cpu_capacity(&self) -> io::Result<usize> {
        Ok(self.cpus()?.last().map_or(0, |&max| max as usize + 1))
    }

    /// Parse a `Key_list:` line of the status file
    fn status_list(&self, key: &str, capacity: usize) -> io::Result<Bitmask> {
        let text = fs::read_to_string(&self.proc_status)?;
        for line in text.lines() {
            if let Some((name, value)) = line.split_once(':') {
                if name.trim() == key {
                    return Bitmask::parse_list(value, capacity);
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{key} missing from {}", self.proc_status.display()),
        ))
    }

    fn task_nodes(&self) -> io::Result<Vec<u32>> {
        let nodes = self.nodes()?;
        let capacity = self.max_possible_node()? as usize + 1;
        let allowed = match self.status_list("Mems_allowed_list", capacity) {
            Ok(mask) => mask,
            // kernels without cpusets omit the line
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(nodes),
            Err(e) => return Err(e),
        };
        Ok(nodes.into_iter().filter(|&n| allowed.is_set(n)).collect())
    }
}

impl NumaBackend for SysfsNuma {
    fn is_available(&self) -> bool {
        self.node_root.is_dir()
    }

    fn configured_node_count(&self) -> io::Result<u32> {
        Ok(self.nodes()?.len() as u32)
    }

    fn task_node_count(&self) -> io::Result<u32> {
        Ok(self.task_nodes()?.len() as u32)
    }

    fn configured_cpu_count(&self) -> io::Result<u32> {
        Ok(self.cpus()?.len() as u32)
    }

    fn task_cpu_count(&self) -> io::Result<u32> {
        let allowed = self.status_list("Cpus_allowed_list", self.cpu_capacity()?)?;
        Ok(allowed.weight() as u32)
    }

    fn max_possible_node(&self) -> io::Result<u32> {
        match fs::read_to_string(self.node_root.join("possible")) {
            Ok(list) => {
                let possible = Bitmask::parse_list(&list, u16::MAX as usize)?;
                possible.max().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "empty possible node list")
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => self
                .nodes()?
                .last()
                .copied()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no NUMA nodes")),
            Err(e) => Err(e),
        }
    }

    fn is_task_node(&self, node: u32) -> io::Result<bool> {
        Ok(self.task_nodes()?.contains(&node))
    }

    fn node_to_cpus(&self, node: u32) -> io::Result<Bitmask> {
        let list = fs::read_to_string(self.node_root.join(format!("node{node}")).join("cpulist"))?;
        Bitmask::parse_list(&list, self.cpu_capacity()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::is_range_error;
    use crate::testing::TempTree;

    fn interleaved(tree: &TempTree) -> SysfsNuma {
        tree.write("node/possible", "0-3\n");
        tree.write("node/node0/cpulist", "0,2\n");
        tree.write("node/node1/cpulist", "1,3\n");
        for cpu in 0..4 {
            tree.mkdir(&format!("cpu/cpu{cpu}"));
        }
        tree.mkdir("cpu/cpufreq");
        tree.write(
            "status",
            "Name:\tctop\nCpus_allowed:\tf\nCpus_allowed_list:\t0-3\nMems_allowed_list:\t0-3\n",
        );
        SysfsNuma::new(tree.path("node"), tree.path("cpu"), tree.path("status"))
    }

    #[test]
    fn test_counts() {
        let tree = TempTree::new("sysfs-counts");
        let numa = interleaved(&tree);

        assert!(numa.is_available());
        assert_eq!(numa.configured_node_count().unwrap(), 2);
        assert_eq!(numa.task_node_count().unwrap(), 2);
        assert_eq!(numa.configured_cpu_count().unwrap(), 4);
        assert_eq!(numa.task_cpu_count().unwrap(), 4);
        assert_eq!(numa.max_possible_node().unwrap(), 3);
        assert!(numa.is_task_node(1).unwrap());
        assert!(!numa.is_task_node(2).unwrap());
    }

    #[test]
    fn test_node_cpus() {
        let tree = TempTree::new("sysfs-node-cpus");
        let numa = interleaved(&tree);
        let cpus = numa.node_to_cpus(1).unwrap();
        assert_eq!(cpus.iter().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(cpus.capacity(), 4);

        assert!(numa.node_to_cpus(7).is_err());
    }

    #[test]
    fn test_cpu_outside_mask_is_erange() {
        let tree = TempTree::new("sysfs-erange");
        let numa = interleaved(&tree);
        tree.write("node/node1/cpulist", "1,3,9\n");
        assert!(is_range_error(&numa.node_to_cpus(1).unwrap_err()));
    }

    #[test]
    fn test_restricted_task() {
        let tree = TempTree::new("sysfs-restricted");
        let numa = interleaved(&tree);
        tree.write("status", "Cpus_allowed_list:\t1,3\nMems_allowed_list:\t1\n");

        assert_eq!(numa.task_cpu_count().unwrap(), 2);
        assert_eq!(numa.task_node_count().unwrap(), 1);
        assert!(!numa.is_task_node(0).unwrap());
    }

    #[test]
    fn test_missing_root() {
        let tree = TempTree::new("sysfs-missing");
        let numa = SysfsNuma::new(tree.path("nope"), tree.path("cpu"), tree.path("status"));
        assert!(!numa.is_available());
    }
}
