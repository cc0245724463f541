use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::astar;
use super::fragment::FragmentTable;
use super::{Path, Plan, SolveContext, SolveReport, Solver, Stats};
use crate::problem::Problem;

const SOLVER_NAME: &str = "DBS";
const DEFAULT_MAX_FRAGMENT_SIZE: i32 = -1;

/// Forbids the move `from -> to` anywhere on `agent`'s path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MoveConstraint {
    pub(crate) agent: usize,
    pub(crate) from: usize,
    pub(crate) to: usize,
}

/// Deadlock-based search for one-shot MAPF: the high-level tree branches on
/// potential deadlock cycles instead of timed conflicts. Deadlock-free but
/// not cost-optimal.
pub struct Dbs {
    ctx: SolveContext,
    stats: Stats,
    max_fragment_size: i32,
    node_seq: u64,
    elapsed_pathfinding: Duration,
    elapsed_deadlock_detection: Duration,
}

#[derive(Debug, Clone)]
struct HighLevelNode {
    id: u64,
    paths: Plan,
    constraints: Vec<MoveConstraint>,
    /// number of head-on (swap) collisions in `paths`
    f: usize,
    valid: bool,
}

impl Ord for HighLevelNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.f.cmp(&other.f).then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for HighLevelNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HighLevelNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HighLevelNode {}

impl Dbs {
    pub fn new(problem: &Problem) -> Self {
        Dbs {
            ctx: SolveContext::new(problem),
            stats: Stats::default(),
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            node_seq: 0,
            elapsed_pathfinding: Duration::ZERO,
            elapsed_deadlock_detection: Duration::ZERO,
        }
    }

    /// Non-positive means unbounded fragments.
    pub fn set_max_fragment_size(&mut self, max_fragment_size: i32) {
        self.max_fragment_size = max_fragment_size;
    }

    /// Plans agents in index order, preferring deadlock-avoiding paths under
    /// the growing fragment table and falling back to constraint-respecting
    /// ones. The table tolerates deadlocks here (`force`) and is discarded
    /// afterwards.
    fn initial_node(&mut self) -> HighLevelNode {
        let mut table = FragmentTable::new(&self.ctx.graph, self.max_fragment_size);
        let mut paths: Plan = Vec::new();
        let mut valid = true;

        for agent in 0..self.ctx.num_agents() {
            let search_start = Instant::now();
            let mut path = self.deadlock_avoiding_path(agent, &table);
            if path.is_empty() {
                path = self.constrained_path(agent, &[], &paths);
            }
            self.elapsed_pathfinding += search_start.elapsed();

            if path.is_empty() {
                valid = false;
                break;
            }
            paths.push(path);

            let detect_start = Instant::now();
            table.register_new_path(agent, &paths[agent], true, Some(self.ctx.deadline()));
            self.elapsed_deadlock_detection += detect_start.elapsed();
        }

        let f = count_swap_conflicts(&self.ctx, &paths);
        HighLevelNode {
            id: 0,
            paths,
            constraints: Vec::new(),
            f,
            valid,
        }
    }

    /// A* that never enters another agent's goal and never closes a potential
    /// cycle with an already registered fragment. Ties prefer vertices with
    /// fewer outbound fragments.
    fn deadlock_avoiding_path(&mut self, agent: usize, table: &FragmentTable) -> Path {
        let ctx = &self.ctx;
        let goal = ctx.goals[agent];
        let goal_table = &ctx.goal_table;
        let rng = Rc::clone(&ctx.rng);
        let mut rng = rng.borrow_mut();
        astar::search(
            &ctx.graph,
            ctx.starts[agent],
            goal,
            &mut rng,
            Some(ctx.deadline()),
            &mut self.stats,
            |v| ctx.h(agent, v),
            |child, parent| {
                (child != goal && goal_table[child]) || table.closes_cycle(child, parent)
            },
            |n| (ctx.h(agent, n.v), table.outbound(n.v), n.g, n.v),
        )
    }

    /// Plain constrained A*: avoids other agents' goals and every forbidden
    /// move accumulated for this agent. Ties prefer moves no other committed
    /// path traverses in reverse.
    fn constrained_path(
        &mut self,
        agent: usize,
        constraints: &[MoveConstraint],
        others: &Plan,
    ) -> Path {
        let ctx = &self.ctx;
        let goal = ctx.goals[agent];
        let goal_table = &ctx.goal_table;

        let relevant: Vec<&MoveConstraint> =
            constraints.iter().filter(|c| c.agent == agent).collect();
        let mut from_to: Vec<Vec<usize>> = vec![Vec::new(); ctx.graph.size()];
        for (i, path) in others.iter().enumerate() {
            if i == agent {
                continue;
            }
            for window in path.windows(2) {
                from_to[window[0]].push(window[1]);
            }
        }

        let rng = Rc::clone(&ctx.rng);
        let mut rng = rng.borrow_mut();
        astar::search(
            &ctx.graph,
            ctx.starts[agent],
            goal,
            &mut rng,
            Some(ctx.deadline()),
            &mut self.stats,
            |v| ctx.h(agent, v),
            |child, parent| {
                (child != goal && goal_table[child])
                    || relevant.iter().any(|c| c.from == parent && c.to == child)
            },
            |n| (ctx.h(agent, n.v), from_to[n.v].contains(&n.prev), n.g, n.v),
        )
    }

    /// Runs a fresh fragment table over the committed paths; the first
    /// potential deadlock yields one forbidden move per participating agent.
    fn extract_constraints(&mut self, paths: &Plan) -> Vec<MoveConstraint> {
        let detect_start = Instant::now();
        let mut table = FragmentTable::new(&self.ctx.graph, self.max_fragment_size);
        let mut constraints = Vec::new();

        for (agent, path) in paths.iter().enumerate() {
            if let Some(fragment) =
                table.register_new_path(agent, path, false, Some(self.ctx.deadline()))
            {
                for k in 0..fragment.agents.len() {
                    constraints.push(MoveConstraint {
                        agent: fragment.agents[k],
                        from: fragment.path[k],
                        to: fragment.path[k + 1],
                    });
                }
                break;
            }
        }

        self.elapsed_deadlock_detection += detect_start.elapsed();
        constraints
    }

    fn invoke(&mut self, parent: &HighLevelNode, constraint: MoveConstraint) -> HighLevelNode {
        let mut constraints = parent.constraints.clone();
        constraints.push(constraint.clone());
        let mut paths = parent.paths.clone();

        let search_start = Instant::now();
        let new_path = self.constrained_path(constraint.agent, &constraints, &paths);
        self.elapsed_pathfinding += search_start.elapsed();

        let valid = !new_path.is_empty();
        if valid {
            paths[constraint.agent] = new_path;
        }
        let f = count_swap_conflicts(&self.ctx, &paths);

        self.node_seq += 1;
        HighLevelNode {
            id: self.node_seq,
            paths,
            constraints,
            f,
            valid,
        }
    }
}

impl Solver for Dbs {
    fn solve(&mut self) -> SolveReport {
        self.ctx.start_timer();
        let mut open: BTreeSet<HighLevelNode> = BTreeSet::new();
        let mut solved = false;
        let mut timeout = false;
        let mut plan = Plan::new();

        let root = self.initial_node();
        if !root.valid {
            info!("failed to find a path");
            return self.report(false, false, plan);
        }
        open.insert(root);

        while let Some(node) = open.pop_first() {
            self.stats.high_level_expanded += 1;
            debug!(
                "elapsed: {:?}, open: {}, constraints: {}, head-on: {}",
                self.ctx.elapsed(),
                open.len() + 1,
                node.constraints.len(),
                node.f
            );

            let constraints = self.extract_constraints(&node.paths);

            // the deadline may have cut detection short; never trust an empty
            // constraint set after it passed
            if self.ctx.over_comp_time() {
                info!("timeout");
                timeout = true;
                break;
            }

            if constraints.is_empty() {
                solved = true;
                plan = node.paths;
                break;
            }

            for constraint in constraints {
                let child = self.invoke(&node, constraint);
                if child.valid {
                    open.insert(child);
                }
            }
        }

        let unsolvable = !solved && !timeout && open.is_empty();
        if unsolvable {
            info!("unsolvable instance");
        }
        self.stats.log(SOLVER_NAME);
        self.report(solved, unsolvable, plan)
    }
}

impl Dbs {
    fn report(&self, solved: bool, unsolvable: bool, plan: Plan) -> SolveReport {
        SolveReport {
            solver: SOLVER_NAME,
            solved,
            unsolvable,
            comp_time: self.ctx.elapsed(),
            elapsed_pathfinding: self.elapsed_pathfinding,
            elapsed_deadlock_detection: self.elapsed_deadlock_detection,
            plan,
        }
    }
}

/// Number of head-on collisions: pairs of committed moves `u -> v` and
/// `v -> u` across different paths.
fn count_swap_conflicts(ctx: &SolveContext, paths: &Plan) -> usize {
    let mut to_from: Vec<Vec<usize>> = vec![Vec::new(); ctx.graph.size()];
    let mut count = 0;
    for path in paths {
        for window in path.windows(2) {
            let (u, v) = (window[0], window[1]);
            count += to_from[v].iter().filter(|&&w| w == u).count();
            to_from[u].push(v);
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use tracing_subscriber;

    use super::*;
    use crate::graph::tests::open_grid;
    use crate::problem::Problem;

    // Helper function to setup tracing
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("trace")
            .try_init();
    }

    fn problem(
        width: usize,
        height: usize,
        starts: Vec<usize>,
        goals: Vec<usize>,
    ) -> Problem {
        Problem::from_parts(
            open_grid(width, height),
            starts,
            goals,
            0,
            Duration::from_secs(10),
        )
        .unwrap()
    }

    fn assert_deadlock_free(problem: &Problem, plan: &Plan) {
        let mut table = FragmentTable::new(problem.graph(), -1);
        for (agent, path) in plan.iter().enumerate() {
            assert!(
                table.register_new_path(agent, path, false, None).is_none(),
                "plan contains a potential deadlock"
            );
        }
    }

    #[test]
    fn test_corridor_swap_is_unsolvable() {
        init_tracing();
        let problem = problem(3, 1, vec![0, 2], vec![2, 0]);
        let mut solver = Dbs::new(&problem);
        let report = solver.solve();

        assert!(!report.solved);
        assert!(report.unsolvable);
    }

    #[test]
    fn test_initial_node_falls_back_to_deadlocked_paths() {
        init_tracing();
        let problem = problem(3, 1, vec![0, 2], vec![2, 0]);
        let mut solver = Dbs::new(&problem);
        let node = solver.initial_node();

        assert!(node.valid);
        assert_eq!(node.paths, vec![vec![0, 1, 2], vec![2, 1, 0]]);
        assert_eq!(node.f, 2);
    }

    #[test]
    fn test_head_on_pair_detours() {
        init_tracing();
        let problem = problem(3, 3, vec![0, 2], vec![2, 0]);
        let mut solver = Dbs::new(&problem);
        let report = solver.solve();

        assert!(report.solved);
        assert!(!report.unsolvable);
        for (agent, path) in report.plan.iter().enumerate() {
            assert_eq!(path[0], problem.start(agent));
            assert_eq!(*path.last().unwrap(), problem.goal(agent));
            for window in path.windows(2) {
                assert!(problem.graph().neighbors(window[0]).contains(&window[1]));
            }
        }
        assert_deadlock_free(&problem, &report.plan);
    }

    #[test]
    fn test_four_agents_on_open_grid() {
        init_tracing();
        let problem = problem(4, 4, vec![0, 3, 12, 15], vec![15, 12, 3, 0]);
        let mut solver = Dbs::new(&problem);
        let report = solver.solve();

        assert!(report.solved);
        assert_deadlock_free(&problem, &report.plan);
    }

    #[test]
    fn test_count_swap_conflicts() {
        init_tracing();
        let problem = problem(3, 1, vec![0, 2], vec![2, 0]);
        let solver = Dbs::new(&problem);

        let head_on: Plan = vec![vec![0, 1, 2], vec![2, 1, 0]];
        assert_eq!(count_swap_conflicts(&solver.ctx, &head_on), 2);

        let disjoint: Plan = vec![vec![0, 1], vec![2, 1]];
        assert_eq!(count_swap_conflicts(&solver.ctx, &disjoint), 0);
    }
}
