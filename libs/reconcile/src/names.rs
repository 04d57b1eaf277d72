//! Positional allocation names.
//!
//! Each group owns the indices `0..count`, and every allocation holds one
//! of them through its name `jobID.group[index]`. The index set is seeded
//! from the allocations that currently exist; placements draw the lowest
//! free indices, scale-down releases the highest ones.

use std::collections::BTreeSet;

use flotilla_structs::alloc_name;

use crate::AllocSet;

/// Tracks which positional indices of a task group are in use.
#[derive(Debug)]
pub struct AllocNameIndex {
    job_id: String,
    task_group: String,
    count: usize,
    used: BTreeSet<u64>,
}

impl AllocNameIndex {
    /// Builds an index seeded with the indices held by `in_use`.
    /// Duplicate names collapse; indices beyond `count` (a scale-down in
    /// progress) are tracked so `highest` can release them first.
    #[must_use]
    pub fn new(job_id: &str, task_group: &str, count: usize, in_use: &AllocSet) -> Self {
        let used = in_use.values().filter_map(|a| a.index()).collect();
        Self {
            job_id: job_id.to_string(),
            task_group: task_group.to_string(),
            count,
            used,
        }
    }

    fn name(&self, index: u64) -> String {
        alloc_name(&self.job_id, &self.task_group, index)
    }

    /// Releases an index back to the free pool.
    pub fn unset_index(&mut self, index: u64) {
        self.used.remove(&index);
    }

    /// The `n` in-use names with the highest indices.
    #[must_use]
    pub fn highest(&self, n: usize) -> BTreeSet<String> {
        self.used
            .iter()
            .rev()
            .take(n)
            .map(|&i| self.name(i))
            .collect()
    }

    /// Claims the `n` lowest free names, reusing indices from the front
    /// once `0..count` is exhausted (duplicate names are tolerated
    /// downstream).
    #[must_use]
    pub fn next(&mut self, n: usize) -> Vec<String> {
        let mut next = Vec::with_capacity(n);

        let free: Vec<u64> = (0..self.count as u64)
            .filter(|i| !self.used.contains(i))
            .take(n)
            .collect();
        for i in free {
            next.push(self.name(i));
            self.used.insert(i);
        }

        let mut overlap = 0;
        while next.len() < n {
            next.push(self.name(overlap));
            self.used.insert(overlap);
            overlap += 1;
        }

        next
    }

    /// Claims `n` canary names, preferring the indices held by allocations
    /// about to be destructively replaced so each canary previews the
    /// replacement of a concrete index. Names already held by existing
    /// canaries are skipped; if preference and the free pool run dry, the
    /// overflow indices `count..` are used.
    #[must_use]
    pub fn next_canaries(
        &mut self,
        n: usize,
        existing: &AllocSet,
        destructive: &AllocSet,
    ) -> Vec<String> {
        let mut next = Vec::with_capacity(n);
        let existing_names = existing.name_set();

        let preferred: BTreeSet<u64> = destructive
            .values()
            .filter_map(|a| a.index())
            .filter(|&i| i < self.count as u64)
            .collect();
        for i in preferred {
            let name = self.name(i);
            if !existing_names.contains(&name) {
                next.push(name);
                self.used.insert(i);
                if next.len() == n {
                    return next;
                }
            }
        }

        let free: Vec<u64> = (0..self.count as u64)
            .filter(|i| !self.used.contains(i))
            .collect();
        for i in free {
            let name = self.name(i);
            if !existing_names.contains(&name) {
                next.push(name);
                self.used.insert(i);
                if next.len() == n {
                    return next;
                }
            }
        }

        // Preferred and free pools exhausted; spill past count to avoid
        // colliding with names that are about to be freed.
        let remainder = n - next.len();
        for i in self.count as u64..self.count as u64 + remainder as u64 {
            let name = self.name(i);
            if !existing_names.contains(&name) {
                next.push(name);
            }
        }

        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_id::{AllocId, NodeId};
    use flotilla_structs::{
        AllocClientStatus, AllocDesiredStatus, AllocMetrics, Allocation, DesiredTransition,
    };
    use std::sync::Arc;

    fn named(name: &str) -> Arc<Allocation> {
        Arc::new(Allocation {
            id: AllocId::new(),
            name: name.to_string(),
            namespace: "default".to_string(),
            job_id: "web".to_string(),
            task_group: "api".to_string(),
            node_id: NodeId::new(),
            job_version: 1,
            job_create_index: 1,
            create_index: 1,
            deployment_id: None,
            desired_status: AllocDesiredStatus::Run,
            client_status: AllocClientStatus::Running,
            desired_transition: DesiredTransition::default(),
            deployment_status: None,
            previous_allocation: None,
            next_allocation: None,
            followup_eval_id: None,
            reschedule: None,
            metrics: AllocMetrics::default(),
            last_event_at: None,
        })
    }

    fn set(names: &[&str]) -> AllocSet {
        names.iter().map(|n| named(n)).collect()
    }

    #[test]
    fn test_next_fills_gaps_first() {
        let seed = set(&["web.api[0]", "web.api[2]"]);
        let mut index = AllocNameIndex::new("web", "api", 4, &seed);
        assert_eq!(index.next(2), vec!["web.api[1]", "web.api[3]"]);
    }

    #[test]
    fn test_next_reuses_when_exhausted() {
        let seed = set(&["web.api[0]", "web.api[1]"]);
        let mut index = AllocNameIndex::new("web", "api", 2, &seed);
        assert_eq!(index.next(2), vec!["web.api[0]", "web.api[1]"]);
    }

    #[test]
    fn test_highest_takes_the_tail() {
        let seed = set(&["web.api[0]", "web.api[1]", "web.api[2]", "web.api[5]"]);
        let index = AllocNameIndex::new("web", "api", 3, &seed);
        let highest = index.highest(2);
        assert!(highest.contains("web.api[5]"));
        assert!(highest.contains("web.api[2]"));
    }

    #[test]
    fn test_unset_releases_for_next() {
        let seed = set(&["web.api[0]", "web.api[1]"]);
        let mut index = AllocNameIndex::new("web", "api", 2, &seed);
        index.unset_index(0);
        assert_eq!(index.next(1), vec!["web.api[0]"]);
    }

    #[test]
    fn test_canaries_prefer_destructive_names() {
        let seed = set(&["web.api[0]", "web.api[1]", "web.api[2]"]);
        let destructive = set(&["web.api[1]", "web.api[2]"]);
        let mut index = AllocNameIndex::new("web", "api", 3, &seed);
        let names = index.next_canaries(1, &AllocSet::new(), &destructive);
        assert_eq!(names, vec!["web.api[1]"]);
    }

    #[test]
    fn test_canaries_skip_existing_canary_names() {
        let seed = set(&["web.api[0]", "web.api[1]"]);
        let destructive = set(&["web.api[0]", "web.api[1]"]);
        let existing = set(&["web.api[0]"]);
        let mut index = AllocNameIndex::new("web", "api", 2, &seed);
        let names = index.next_canaries(1, &existing, &destructive);
        assert_eq!(names, vec!["web.api[1]"]);
    }
}
