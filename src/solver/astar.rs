use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;
use tracing::trace;

use super::{Path, Stats};
use crate::graph::Graph;

/// Search node; nodes live in a per-call arena and refer to parents by index.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SearchNode {
    pub(crate) v: usize,
    pub(crate) g: usize,
    pub(crate) f: usize,
    /// Parent vertex; equal to `v` on the start node.
    pub(crate) prev: usize,
    parent: Option<usize>,
}

struct HeapEntry<K> {
    key: K,
    idx: usize,
}

impl<K: Ord> Ord for HeapEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, callers want the smallest key
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.idx.cmp(&self.idx))
    }
}

impl<K: Ord> PartialOrd for HeapEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> PartialEq for HeapEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord> Eq for HeapEntry<K> {}

/// Single-agent A* under a caller-supplied move predicate and open-list key.
///
/// `blocked(child, parent)` vetoes a candidate move, `key` maps open-list
/// entries to the caller's ordering (smaller pops first). Neighbours are
/// shuffled with the shared PRNG before expansion. Returns the path
/// including start and goal, or an empty path when the open list drains or
/// the deadline passes.
pub(crate) fn search<K: Ord>(
    graph: &Graph,
    start: usize,
    goal: usize,
    rng: &mut StdRng,
    deadline: Option<Instant>,
    stats: &mut Stats,
    mut h: impl FnMut(usize) -> usize,
    mut blocked: impl FnMut(usize, usize) -> bool,
    mut key: impl FnMut(&SearchNode) -> K,
) -> Path {
    let mut arena: Vec<SearchNode> = Vec::new();
    let mut open: BinaryHeap<HeapEntry<K>> = BinaryHeap::new();
    let mut closed = vec![false; graph.size()];

    let root = SearchNode {
        v: start,
        g: 0,
        f: h(start),
        prev: start,
        parent: None,
    };
    open.push(HeapEntry {
        key: key(&root),
        idx: 0,
    });
    arena.push(root);

    while let Some(entry) = open.pop() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Vec::new();
        }

        let node = arena[entry.idx];
        if closed[node.v] {
            continue;
        }
        closed[node.v] = true;
        stats.low_level_expanded += 1;

        if node.v == goal {
            return reconstruct(&arena, entry.idx);
        }

        let mut neighbors = graph.neighbors(node.v).to_vec();
        neighbors.shuffle(rng);
        for u in neighbors {
            if closed[u] {
                continue;
            }
            if blocked(u, node.v) {
                continue;
            }
            let g = node.g + 1;
            let child = SearchNode {
                v: u,
                g,
                f: g + h(u),
                prev: node.v,
                parent: Some(entry.idx),
            };
            open.push(HeapEntry {
                key: key(&child),
                idx: arena.len(),
            });
            arena.push(child);
        }
        trace!("open list size {}", open.len());
    }

    Vec::new()
}

fn reconstruct(arena: &[SearchNode], mut idx: usize) -> Path {
    let mut path = vec![arena[idx].v];
    while let Some(parent) = arena[idx].parent {
        idx = parent;
        path.push(arena[idx].v);
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use tracing_subscriber;

    use super::*;
    use crate::graph::tests::open_grid;
    use rand::SeedableRng;

    // Helper function to setup tracing
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("trace")
            .try_init();
    }

    fn run(
        graph: &Graph,
        start: usize,
        goal: usize,
        blocked: impl FnMut(usize, usize) -> bool,
    ) -> Path {
        let mut rng = StdRng::seed_from_u64(0);
        let mut stats = Stats::default();
        let dist = {
            let mut d = vec![usize::MAX; graph.size()];
            // simple reverse BFS for the fixture
            let mut open = std::collections::VecDeque::from([goal]);
            d[goal] = 0;
            while let Some(v) = open.pop_front() {
                for &u in graph.neighbors(v) {
                    if d[v] + 1 < d[u] {
                        d[u] = d[v] + 1;
                        open.push_back(u);
                    }
                }
            }
            d
        };
        search(
            graph,
            start,
            goal,
            &mut rng,
            None,
            &mut stats,
            |v| dist[v],
            blocked,
            |n| (n.f, std::cmp::Reverse(n.g), n.v),
        )
    }

    #[test]
    fn test_shortest_path_on_open_grid() {
        init_tracing();
        let graph = open_grid(3, 3);
        let path = run(&graph, 0, 8, |_, _| false);
        assert_eq!(path.len(), 5);
        assert_eq!(path[0], 0);
        assert_eq!(path[4], 8);
        for w in path.windows(2) {
            assert!(graph.neighbors(w[0]).contains(&w[1]));
        }
    }

    #[test]
    fn test_blocked_moves_force_detour() {
        init_tracing();
        let graph = open_grid(3, 1);
        // corridor 0-1-2 with the direct move 1 -> 2 forbidden: unreachable
        let path = run(&graph, 0, 2, |child, parent| parent == 1 && child == 2);
        assert!(path.is_empty());
    }

    #[test]
    fn test_blocked_vertex_routes_around() {
        init_tracing();
        let graph = open_grid(3, 3);
        // vertex 1 entirely forbidden; still reachable through the middle
        let path = run(&graph, 0, 2, |child, _| child == 1);
        assert_eq!(path.len(), 5);
        assert!(!path.contains(&1));
    }

    #[test]
    fn test_start_equals_goal() {
        init_tracing();
        let graph = open_grid(2, 2);
        let path = run(&graph, 3, 3, |_, _| false);
        assert_eq!(path, vec![3]);
    }
}
