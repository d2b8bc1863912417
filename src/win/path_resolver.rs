//! Resolves MFT File Reference Numbers (FRN) to full paths.
//!
//! Only directory records are added; files resolve as parent path plus
//! name. Parent chains are bounded (a well-formed MFT has no cycles, a
//! corrupt one is treated as a format error by the caller).

use std::collections::{HashMap, HashSet, VecDeque};

/// The root directory of every NTFS volume is FRN 5 (lower 48 bits).
pub const NTFS_ROOT_FRN: u64 = 5;

/// Parent-chain walks give up past this depth; deeper chains only occur
/// in corrupt file tables.
const MAX_PARENT_DEPTH: usize = 256;

pub struct PathResolver {
    drive_prefix: String,
    /// FRN -> (parent FRN, name); directories only
    frn_map: HashMap<u64, (u64, String)>,
    /// parent FRN -> child directory FRNs
    children_map: HashMap<u64, Vec<u64>>,
    /// FRN -> resolved full path
    path_cache: HashMap<u64, String>,
}

impl PathResolver {
    pub fn with_capacity(drive_prefix: &str, capacity: usize) -> Self {
        Self {
            drive_prefix: drive_prefix.trim_end_matches('\\').to_string(),
            frn_map: HashMap::with_capacity(capacity),
            children_map: HashMap::with_capacity(capacity / 4),
            path_cache: HashMap::with_capacity(capacity),
        }
    }

    /// Record one directory from the enumeration pass.
    pub fn add_record(&mut self, frn: u64, parent_frn: u64, name: String) {
        self.frn_map.insert(frn, (parent_frn, name));
        self.children_map.entry(parent_frn).or_default().push(frn);
    }

    /// Find the FRN of a directory path by walking segments from the
    /// volume root; case-insensitive.
    pub fn find_frn_by_path(&self, path: &str) -> Option<u64> {
        let stripped = path
            .strip_prefix(&self.drive_prefix)
            .unwrap_or(path)
            .trim_start_matches('\\');
        if stripped.is_empty() {
            return Some(NTFS_ROOT_FRN);
        }

        let mut current = NTFS_ROOT_FRN;
        for segment in stripped.split('\\').filter(|s| !s.is_empty()) {
            let segment_lower = segment.to_lowercase();
            let children = self.children_map.get(&current)?;
            current = *children.iter().find(|&&child| {
                self.frn_map
                    .get(&child)
                    .is_some_and(|(_, name)| name.to_lowercase() == segment_lower)
            })?;
        }
        Some(current)
    }

    /// Directory FRNs under `root_frn` (inclusive), BFS, pruning whole
    /// subtrees whose directory matches a skip name or skip FRN.
    pub fn collect_subtree_pruned(
        &self,
        root_frn: u64,
        skip_names: &[&str],
        skip_frns: &HashSet<u64>,
    ) -> HashSet<u64> {
        let mut result = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(root_frn);

        while let Some(frn) = queue.pop_front() {
            if frn != root_frn {
                if skip_frns.contains(&frn) {
                    continue;
                }
                if let Some((_, name)) = self.frn_map.get(&frn) {
                    if skip_names.iter().any(|&skip| name == skip) {
                        continue;
                    }
                }
            }
            result.insert(frn);
            if let Some(children) = self.children_map.get(&frn) {
                for &child in children {
                    if !result.contains(&child) {
                        queue.push_back(child);
                    }
                }
            }
        }
        result
    }

    /// Resolve an FRN to a full path. `None` means a broken parent
    /// chain, a cycle, or a chain deeper than [`MAX_PARENT_DEPTH`];
    /// all signs of a corrupt MFT record.
    pub fn resolve(&mut self, frn: u64) -> Option<String> {
        if frn == NTFS_ROOT_FRN {
            return Some(format!("{}\\", self.drive_prefix));
        }
        if let Some(cached) = self.path_cache.get(&frn) {
            return Some(cached.clone());
        }

        let mut chain: Vec<(u64, String)> = Vec::new();
        let mut visited: HashSet<u64> = HashSet::new();
        let mut current = frn;

        loop {
            if current == NTFS_ROOT_FRN {
                break;
            }
            if chain.len() >= MAX_PARENT_DEPTH || !visited.insert(current) {
                return None;
            }
            if let Some(cached) = self.path_cache.get(&current) {
                let mut path = cached.clone();
                for (_, name) in chain.iter().rev() {
                    path.push('\\');
                    path.push_str(name);
                }
                self.path_cache.insert(frn, path.clone());
                return Some(path);
            }
            match self.frn_map.get(&current) {
                Some((parent_frn, name)) => {
                    chain.push((current, name.clone()));
                    current = *parent_frn;
                }
                None => return None,
            }
        }

        let mut path = self.drive_prefix.clone();
        for (intermediate_frn, name) in chain.iter().rev() {
            path.push('\\');
            path.push_str(name);
            self.path_cache.insert(*intermediate_frn, path.clone());
        }
        Some(path)
    }

    /// Resolved directory paths, FRN-keyed.
    pub fn path_cache(&self) -> &HashMap<u64, String> {
        &self.path_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_walks_parent_chain() {
        let mut r = PathResolver::with_capacity("C:", 16);
        r.add_record(100, NTFS_ROOT_FRN, "Users".to_string());
        r.add_record(200, 100, "dev".to_string());
        assert_eq!(r.resolve(200), Some("C:\\Users\\dev".to_string()));
        assert_eq!(r.resolve(100), Some("C:\\Users".to_string()));
    }

    #[test]
    fn resolve_broken_chain_is_none() {
        let mut r = PathResolver::with_capacity("C:", 4);
        r.add_record(300, 999, "orphan".to_string());
        assert_eq!(r.resolve(300), None);
    }

    #[test]
    fn resolve_cycle_is_none() {
        let mut r = PathResolver::with_capacity("C:", 4);
        r.add_record(10, 20, "a".to_string());
        r.add_record(20, 10, "b".to_string());
        assert_eq!(r.resolve(10), None);
    }

    #[test]
    fn resolve_depth_cap() {
        let mut r = PathResolver::with_capacity("C:", 1024);
        let mut parent = NTFS_ROOT_FRN;
        for i in 0..400u64 {
            let frn = 1000 + i;
            r.add_record(frn, parent, format!("d{i}"));
            parent = frn;
        }
        // chain of 400 exceeds the 256 cap
        assert_eq!(r.resolve(parent), None);
        // a shallow node still resolves
        assert!(r.resolve(1000 + 10).is_some());
    }

    #[test]
    fn find_frn_is_case_insensitive() {
        let mut r = PathResolver::with_capacity("C:", 16);
        r.add_record(100, NTFS_ROOT_FRN, "Users".to_string());
        r.add_record(200, 100, "TestUser".to_string());
        assert_eq!(r.find_frn_by_path("C:\\users\\testuser"), Some(200));
        assert_eq!(r.find_frn_by_path("C:\\missing"), None);
        assert_eq!(r.find_frn_by_path("C:"), Some(NTFS_ROOT_FRN));
    }

    #[test]
    fn pruned_subtree_skips_named_dirs() {
        let mut r = PathResolver::with_capacity("C:", 16);
        r.add_record(100, NTFS_ROOT_FRN, "proj".to_string());
        r.add_record(200, 100, "node_modules".to_string());
        r.add_record(300, 200, "dep".to_string());
        r.add_record(400, 100, "src".to_string());

        let subtree = r.collect_subtree_pruned(NTFS_ROOT_FRN, &["node_modules"], &HashSet::new());
        assert!(subtree.contains(&100));
        assert!(subtree.contains(&400));
        assert!(!subtree.contains(&200));
        assert!(!subtree.contains(&300));
    }

    #[test]
    fn pruned_subtree_skips_frns() {
        let mut r = PathResolver::with_capacity("C:", 16);
        r.add_record(100, NTFS_ROOT_FRN, "a".to_string());
        r.add_record(200, 100, "b".to_string());
        let skip: HashSet<u64> = [100].into_iter().collect();
        let subtree = r.collect_subtree_pruned(NTFS_ROOT_FRN, &[], &skip);
        assert!(!subtree.contains(&100));
        assert!(!subtree.contains(&200));
    }
}
