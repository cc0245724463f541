use std::collections::HashSet;
use std::rc::Rc;
use std::time::Instant;
use tracing::trace;

use crate::graph::Graph;

/// A chain of committed moves: `agents[t]` traverses `path[t] -> path[t+1]`
/// somewhere in its plan. A closed chain (`path.front == path.back`) is a
/// potential deadlock: every agent on it waits for the next one's vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub(crate) path: Vec<usize>,
    pub(crate) agents: Vec<usize>,
}

impl Fragment {
    pub(crate) fn is_cycle(&self) -> bool {
        self.path.len() > 1 && self.path.first() == self.path.last()
    }
}

/// Incremental index of committed paths. Every registered fragment appears
/// once in `t_from[path.front]` and once in `t_to[path.back]`.
pub(crate) struct FragmentTable {
    t_from: Vec<Vec<Rc<Fragment>>>,
    t_to: Vec<Vec<Rc<Fragment>>>,
    max_fragment_size: i32,
}

impl FragmentTable {
    /// `max_fragment_size <= 0` means unbounded.
    pub(crate) fn new(graph: &Graph, max_fragment_size: i32) -> Self {
        FragmentTable {
            t_from: vec![Vec::new(); graph.size()],
            t_to: vec![Vec::new(); graph.size()],
            max_fragment_size,
        }
    }

    /// Number of registered fragments whose path starts at `v`.
    pub(crate) fn outbound(&self, v: usize) -> usize {
        self.t_from[v].len()
    }

    /// Whether moving `parent -> child` would close a potential cycle with an
    /// already registered fragment.
    pub(crate) fn closes_cycle(&self, child: usize, parent: usize) -> bool {
        self.t_to[parent]
            .iter()
            .any(|f| f.path.first() == Some(&child))
    }

    /// Registers every unit move of `path` for agent `id`, joining against
    /// the existing indices. Returns the first potential deadlock found; with
    /// `force` the registration continues past deadlocks (initial-node
    /// seeding tolerates them as soft signals). A passed deadline aborts with
    /// no deadlock reported.
    pub(crate) fn register_new_path(
        &mut self,
        id: usize,
        path: &[usize],
        force: bool,
        deadline: Option<Instant>,
    ) -> Option<Rc<Fragment>> {
        let mut first_cycle: Option<Rc<Fragment>> = None;

        for window in path.windows(2) {
            let (u, v) = (window[0], window[1]);
            if u == v {
                continue;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return None;
            }

            let lefts: Vec<Rc<Fragment>> = self.t_to[u]
                .iter()
                .filter(|f| !f.agents.contains(&id))
                .cloned()
                .collect();
            let rights: Vec<Rc<Fragment>> = self.t_from[v]
                .iter()
                .filter(|f| !f.agents.contains(&id))
                .cloned()
                .collect();

            let mut candidates: Vec<Fragment> = Vec::new();
            candidates.push(Fragment {
                path: vec![u, v],
                agents: vec![id],
            });
            for f in &lefts {
                let mut joined_path = f.path.clone();
                joined_path.push(v);
                let mut joined_agents = f.agents.clone();
                joined_agents.push(id);
                candidates.push(Fragment {
                    path: joined_path,
                    agents: joined_agents,
                });
            }
            for f in &rights {
                let mut joined_path = vec![u];
                joined_path.extend_from_slice(&f.path);
                let mut joined_agents = vec![id];
                joined_agents.extend_from_slice(&f.agents);
                candidates.push(Fragment {
                    path: joined_path,
                    agents: joined_agents,
                });
            }
            for lf in &lefts {
                for rf in &rights {
                    if lf.agents.iter().any(|a| rf.agents.contains(a)) {
                        continue;
                    }
                    let mut joined_path = lf.path.clone();
                    joined_path.extend_from_slice(&rf.path);
                    let mut joined_agents = lf.agents.clone();
                    joined_agents.push(id);
                    joined_agents.extend_from_slice(&rf.agents);
                    candidates.push(Fragment {
                        path: joined_path,
                        agents: joined_agents,
                    });
                }
            }

            for candidate in candidates {
                if candidate.is_cycle() {
                    trace!("potential deadlock: {candidate:?}");
                    let fragment = Rc::new(candidate);
                    if !force {
                        return Some(fragment);
                    }
                    if first_cycle.is_none() {
                        first_cycle = Some(fragment);
                    }
                    continue;
                }
                if self.max_fragment_size > 0 {
                    if candidate.path.len() > self.max_fragment_size as usize {
                        continue;
                    }
                    if !is_simple(&candidate.path) {
                        continue;
                    }
                }
                if self.exists_duplicate(&candidate) {
                    continue;
                }
                let first = candidate.path[0];
                let last = candidate.path[candidate.path.len() - 1];
                let fragment = Rc::new(candidate);
                self.t_from[first].push(Rc::clone(&fragment));
                self.t_to[last].push(fragment);
            }
        }

        first_cycle
    }

    fn exists_duplicate(&self, candidate: &Fragment) -> bool {
        self.t_from[candidate.path[0]]
            .iter()
            .any(|f| f.path == candidate.path && f.agents == candidate.agents)
    }

    #[cfg(test)]
    pub(crate) fn fragment_count(&self) -> usize {
        self.t_from.iter().map(|list| list.len()).sum()
    }
}

fn is_simple(path: &[usize]) -> bool {
    let mut seen = HashSet::with_capacity(path.len());
    path.iter().all(|&v| seen.insert(v))
}

#[cfg(test)]
mod tests {
    use tracing_subscriber;

    use super::*;
    use crate::graph::tests::open_grid;

    // Helper function to setup tracing
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("trace")
            .try_init();
    }

    #[test]
    fn test_swap_deadlock() {
        init_tracing();
        let graph = open_grid(3, 3);
        let mut table = FragmentTable::new(&graph, -1);

        assert!(table.register_new_path(0, &[0, 1, 2], false, None).is_none());
        let cycle = table.register_new_path(1, &[3, 2, 1], false, None);
        let cycle = cycle.expect("swap must be detected");
        assert!(cycle.is_cycle());
        assert_eq!(cycle.path, vec![1, 2, 1]);
        assert_eq!(cycle.agents, vec![0, 1]);
    }

    #[test]
    fn test_rotational_deadlock() {
        init_tracing();
        let graph = open_grid(3, 3);
        let mut table = FragmentTable::new(&graph, -1);

        assert!(table.register_new_path(0, &[0, 3, 6], false, None).is_none());
        assert!(table.register_new_path(1, &[3, 4, 5], false, None).is_none());
        assert!(table.register_new_path(2, &[7, 4, 1], false, None).is_none());
        let cycle = table.register_new_path(3, &[2, 1, 0], false, None);
        let cycle = cycle.expect("rotation must be detected");
        assert_eq!(cycle.path, vec![0, 3, 4, 1, 0]);
        assert_eq!(cycle.agents, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_self_loop_is_tolerated() {
        init_tracing();
        let graph = open_grid(8, 8);
        let mut table = FragmentTable::new(&graph, -1);

        let cycle = table.register_new_path(0, &[8, 9, 17, 16, 8], false, None);
        assert!(cycle.is_none());
    }

    #[test]
    fn test_duplicate_registration_is_idempotent() {
        init_tracing();
        let graph = open_grid(3, 3);
        let mut table = FragmentTable::new(&graph, -1);

        table.register_new_path(0, &[0, 1, 2], false, None);
        let count = table.fragment_count();
        table.register_new_path(0, &[0, 1, 2], false, None);
        assert_eq!(table.fragment_count(), count);
    }

    #[test]
    fn test_max_fragment_size_bounds_detection() {
        init_tracing();
        let paths: [&[usize]; 4] = [&[0, 3, 6], &[3, 4, 5], &[7, 4, 1], &[2, 1, 0]];

        // unbounded: the 4-cycle is found
        let graph = open_grid(3, 3);
        let mut table = FragmentTable::new(&graph, -1);
        let mut found = None;
        for (id, p) in paths.iter().enumerate() {
            found = table.register_new_path(id, p, false, None);
            if found.is_some() {
                break;
            }
        }
        assert!(found.is_some());

        // chains capped at two vertices cannot witness it
        let mut table = FragmentTable::new(&graph, 2);
        let mut found = None;
        for (id, p) in paths.iter().enumerate() {
            found = table.register_new_path(id, p, false, None);
            if found.is_some() {
                break;
            }
        }
        assert!(found.is_none());
    }

    #[test]
    fn test_closes_cycle_guard() {
        init_tracing();
        let graph = open_grid(3, 3);
        let mut table = FragmentTable::new(&graph, -1);
        table.register_new_path(0, &[0, 1, 2], false, None);

        // moving 2 -> 1 would close the swap with agent 0's [1, 2]
        assert!(table.closes_cycle(1, 2));
        // moving 1 -> 2 only follows agent 0
        assert!(!table.closes_cycle(2, 1));
        assert_eq!(table.outbound(0), 1);
        assert_eq!(table.outbound(1), 1);
    }
}
