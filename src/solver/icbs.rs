use std::cmp::{Ordering, Reverse};
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::astar;
use super::mdd::{Constraint, Mdd, MddCache};
use super::{path_cost, position_at, Path, Plan, SolveContext, SolveReport, Solver, Stats};
use crate::problem::Problem;

const SOLVER_NAME: &str = "ICBS";

/// Conflict-based search with MDD-backed conflict prioritization and the
/// helpful-bypass rule. Sum-of-costs optimal.
pub struct Icbs {
    ctx: SolveContext,
    cache: MddCache,
    stats: Stats,
    node_seq: u64,
    elapsed_pathfinding: Duration,
}

#[derive(Debug, Clone)]
struct HighLevelNode {
    id: u64,
    paths: Plan,
    constraints: Vec<Constraint>,
    soc: usize,
    conflicts: usize,
    valid: bool,
    mdds: Vec<Rc<Mdd>>,
}

impl Ord for HighLevelNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.soc
            .cmp(&other.soc)
            .then_with(|| self.conflicts.cmp(&other.conflicts))
            .then_with(|| self.id.cmp(&other.id))
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

impl Icbs {
    pub fn new(problem: &Problem) -> Self {
        Icbs {
            ctx: SolveContext::new(problem),
            cache: MddCache::default(),
            stats: Stats::default(),
            node_seq: 0,
            elapsed_pathfinding: Duration::ZERO,
        }
    }

    fn initial_node(&mut self) -> Option<HighLevelNode> {
        let search_start = Instant::now();
        let mut paths: Plan = Vec::new();
        let mut mdds = Vec::new();
        for agent in 0..self.ctx.num_agents() {
            let path = self.classical_path(agent);
            if path.is_empty() {
                self.elapsed_pathfinding += search_start.elapsed();
                return None;
            }
            mdds.push(self.cache.pure(&self.ctx, agent, path.len() - 1));
            paths.push(path);
        }
        self.elapsed_pathfinding += search_start.elapsed();

        let soc = paths.iter().map(|p| path_cost(p)).sum();
        let conflicts = count_all_conflicts(&paths);
        Some(HighLevelNode {
            id: 0,
            paths,
            constraints: Vec::new(),
            soc,
            conflicts,
            valid: true,
            mdds,
        })
    }

    /// Unconstrained single-agent shortest path; ties prefer deeper nodes.
    fn classical_path(&mut self, agent: usize) -> Path {
        let ctx = &self.ctx;
        let rng = Rc::clone(&ctx.rng);
        let mut rng = rng.borrow_mut();
        astar::search(
            &ctx.graph,
            ctx.starts[agent],
            ctx.goals[agent],
            &mut rng,
            Some(ctx.deadline()),
            &mut self.stats,
            |v| ctx.h(agent, v),
            |_, _| false,
            |n| (n.f, Reverse(n.g), n.v),
        )
    }

    /// Recomputes the affected agent's path through its MDD: refine with the
    /// single new constraint if possible, otherwise escalate the MDD cost
    /// until a constrained MDD becomes valid. The cost is capped at
    /// `|V| * N`; hitting the cap or the budget invalidates the child.
    fn invoke(&mut self, parent: &HighLevelNode, constraint: Constraint) -> HighLevelNode {
        let agent = constraint.agent;
        let mut constraints = parent.constraints.clone();
        constraints.push(constraint.clone());
        let mut mdds = parent.mdds.clone();
        let mut paths = parent.paths.clone();

        let search_start = Instant::now();
        let mut refined = (*mdds[agent]).clone();
        refined.update(std::slice::from_ref(&constraint));
        let new_path = if refined.valid {
            let path = refined.get_path();
            mdds[agent] = Rc::new(refined);
            path
        } else {
            let agent_constraints: Vec<Constraint> = constraints
                .iter()
                .filter(|c| c.agent == agent)
                .cloned()
                .collect();
            let cost_cap = self.ctx.graph.size() * self.ctx.num_agents();
            let mut cost = mdds[agent].cost.max(constraint.t) + 1;
            loop {
                if cost > cost_cap || self.ctx.over_comp_time() {
                    break Vec::new();
                }
                let mut candidate = (*self.cache.pure(&self.ctx, agent, cost)).clone();
                candidate.update(&agent_constraints);
                if candidate.valid {
                    let path = candidate.get_path();
                    mdds[agent] = Rc::new(candidate);
                    break path;
                }
                cost += 1;
            }
        };
        self.elapsed_pathfinding += search_start.elapsed();

        self.node_seq += 1;
        if new_path.is_empty() {
            return HighLevelNode {
                id: self.node_seq,
                paths,
                constraints,
                soc: parent.soc,
                conflicts: parent.conflicts,
                valid: false,
                mdds,
            };
        }

        debug!(
            "agent {agent} replanned to {new_path:?} for constraint {constraint:?}"
        );
        paths[agent] = new_path;
        let soc = paths.iter().map(|p| path_cost(p)).sum();
        let conflicts = count_all_conflicts(&paths);
        HighLevelNode {
            id: self.node_seq,
            paths,
            constraints,
            soc,
            conflicts,
            valid: true,
            mdds,
        }
    }

    /// Scans time steps and agent pairs for vertex/swap conflicts, classified
    /// by MDD level widths. The first cardinal conflict is returned
    /// immediately; otherwise the remembered semi-cardinal, then the
    /// remembered non-cardinal pair. Empty means the node is a solution.
    fn prioritized_conflict(&self, node: &HighLevelNode) -> Vec<Constraint> {
        let n = self.ctx.num_agents();
        let makespan = node
            .paths
            .iter()
            .map(|p| p.len().saturating_sub(1))
            .max()
            .unwrap_or(0);
        let mut semi_cardinal: Vec<Constraint> = Vec::new();
        let mut non_cardinal: Vec<Constraint> = Vec::new();

        for t in 1..=makespan {
            for i in 0..n {
                for j in (i + 1)..n {
                    let c_i = node.mdds[i].cost;
                    let c_j = node.mdds[j].cost;
                    let w_i = if t <= c_i { node.mdds[i].width(t) } else { 0 };
                    let w_j = if t <= c_j { node.mdds[j].width(t) } else { 0 };
                    let pos_i = position_at(&node.paths[i], t);
                    let pos_j = position_at(&node.paths[j], t);

                    // vertex conflict; an agent past its horizon occupies its
                    // goal with width 1
                    if pos_i == pos_j {
                        let constraint_i = Constraint {
                            agent: i,
                            t,
                            v: pos_i,
                            u: None,
                        };
                        let constraint_j = Constraint {
                            agent: j,
                            t,
                            v: pos_j,
                            u: None,
                        };
                        if (t <= c_i && w_i == 1 && t <= c_j && w_j == 1)
                            || (t > c_i && w_j == 1)
                            || (t > c_j && w_i == 1)
                        {
                            return vec![constraint_i, constraint_j];
                        }
                        if semi_cardinal.is_empty()
                            && (t > c_i || t > c_j || w_i == 1 || w_j == 1)
                        {
                            semi_cardinal = vec![constraint_i, constraint_j];
                        } else if non_cardinal.is_empty() {
                            non_cardinal = vec![constraint_i, constraint_j];
                        }
                    }

                    // swap conflict
                    let prev_i = position_at(&node.paths[i], t - 1);
                    let prev_j = position_at(&node.paths[j], t - 1);
                    if pos_i == prev_j && pos_j == prev_i {
                        let singleton_i = node.mdds[i].singleton_with_unique_prev(t);
                        let singleton_j = node.mdds[j].singleton_with_unique_prev(t);
                        let constraint_i = Constraint {
                            agent: i,
                            t,
                            v: pos_i,
                            u: Some(prev_i),
                        };
                        let constraint_j = Constraint {
                            agent: j,
                            t,
                            v: pos_j,
                            u: Some(prev_j),
                        };
                        if t <= c_i && singleton_i && t <= c_j && singleton_j {
                            return vec![constraint_i, constraint_j];
                        }
                        if semi_cardinal.is_empty()
                            && (t > c_i || t > c_j || singleton_i || singleton_j)
                        {
                            semi_cardinal = vec![constraint_i, constraint_j];
                        } else if non_cardinal.is_empty() {
                            non_cardinal = vec![constraint_i, constraint_j];
                        }
                    }
                }
            }
        }

        if !semi_cardinal.is_empty() {
            semi_cardinal
        } else {
            non_cardinal
        }
    }

    /// Replaces one agent's path with an equal-cost MDD walk that avoids the
    /// conflict and strictly lowers its conflict count; the node keeps its
    /// id and a branch is saved.
    fn find_bypass(&mut self, node: &mut HighLevelNode, constraints: &[Constraint]) -> bool {
        let makespan = node
            .paths
            .iter()
            .map(|p| p.len().saturating_sub(1))
            .max()
            .unwrap_or(0);
        for constraint in constraints {
            let agent = constraint.agent;
            let mut path = node.mdds[agent].get_path_avoiding(constraint);
            if path.is_empty() {
                continue;
            }
            while path.len() - 1 < makespan {
                path.push(*path.last().expect("bypass path is non-empty"));
            }
            let old_count = count_agent_conflicts(&node.paths, agent, &node.paths[agent]);
            let new_count = count_agent_conflicts(&node.paths, agent, &path);
            if old_count <= new_count {
                continue;
            }
            debug!("helpful bypass: agent {agent} conflicts {old_count} -> {new_count}");
            node.paths[agent] = path;
            node.conflicts = node.conflicts - old_count + new_count;
            return true;
        }
        false
    }
}

impl Solver for Icbs {
    fn solve(&mut self) -> SolveReport {
        self.ctx.start_timer();
        let mut open: BTreeSet<HighLevelNode> = BTreeSet::new();
        let mut solution: Option<Plan> = None;

        if let Some(root) = self.initial_node() {
            open.insert(root);
            while let Some(mut node) = open.pop_first() {
                if self.ctx.over_comp_time() {
                    info!("timeout");
                    break;
                }
                debug!(
                    "elapsed: {:?}, open: {}, conflicts: {}, constraints: {}, soc: {}",
                    self.ctx.elapsed(),
                    open.len() + 1,
                    node.conflicts,
                    node.constraints.len(),
                    node.soc
                );

                let constraints = self.prioritized_conflict(&node);
                if constraints.is_empty() {
                    solution = Some(node.paths);
                    break;
                }

                if self.find_bypass(&mut node, &constraints) {
                    open.insert(node);
                    continue;
                }

                self.stats.high_level_expanded += 1;
                for constraint in constraints {
                    let child = self.invoke(&node, constraint);
                    if child.valid {
                        open.insert(child);
                    }
                }
            }
        }

        self.stats.log(SOLVER_NAME);
        let solved = solution.is_some();
        let mut plan = solution.unwrap_or_default();
        for path in &mut plan {
            let cost = path_cost(path);
            path.truncate(cost + 1);
        }
        SolveReport {
            solver: SOLVER_NAME,
            solved,
            unsolvable: false,
            comp_time: self.ctx.elapsed(),
            elapsed_pathfinding: self.elapsed_pathfinding,
            elapsed_deadlock_detection: Duration::ZERO,
            plan,
        }
    }
}

fn count_pair_conflicts(p1: &[usize], p2: &[usize]) -> usize {
    let makespan = p1.len().max(p2.len()).saturating_sub(1);
    let mut count = 0;
    for t in 1..=makespan {
        let pos_1 = position_at(p1, t);
        let pos_2 = position_at(p2, t);
        if pos_1 == pos_2 {
            count += 1;
        }
        if pos_1 == position_at(p2, t - 1) && pos_2 == position_at(p1, t - 1) && pos_1 != pos_2 {
            count += 1;
        }
    }
    count
}

fn count_agent_conflicts(paths: &Plan, agent: usize, path: &[usize]) -> usize {
    (0..paths.len())
        .filter(|&j| j != agent)
        .map(|j| count_pair_conflicts(path, &paths[j]))
        .sum()
}

fn count_all_conflicts(paths: &Plan) -> usize {
    let mut count = 0;
    for i in 0..paths.len() {
        for j in (i + 1)..paths.len() {
            count += count_pair_conflicts(&paths[i], &paths[j]);
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

    fn problem(starts: Vec<usize>, goals: Vec<usize>) -> Problem {
        Problem::from_parts(
            open_grid(3, 3),
            starts,
            goals,
            0,
            Duration::from_secs(10),
        )
        .unwrap()
    }

    fn assert_conflict_free(plan: &Plan) {
        let makespan = plan.iter().map(|p| p.len() - 1).max().unwrap();
        for t in 1..=makespan {
            for i in 0..plan.len() {
                for j in (i + 1)..plan.len() {
                    let pos_i = position_at(&plan[i], t);
                    let pos_j = position_at(&plan[j], t);
                    assert_ne!(pos_i, pos_j, "vertex conflict at t={t}");
                    let prev_i = position_at(&plan[i], t - 1);
                    let prev_j = position_at(&plan[j], t - 1);
                    assert!(
                        !(pos_i == prev_j && pos_j == prev_i),
                        "swap conflict at t={t}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_head_on_corridor_is_resolved() {
        init_tracing();
        let problem = problem(vec![0, 2], vec![2, 0]);
        let mut solver = Icbs::new(&problem);
        let report = solver.solve();

        assert!(report.solved);
        assert_eq!(report.plan.len(), 2);
        assert_eq!(report.plan[0][0], 0);
        assert_eq!(*report.plan[0].last().unwrap(), 2);
        assert_eq!(report.plan[1][0], 2);
        assert_eq!(*report.plan[1].last().unwrap(), 0);
        assert_conflict_free(&report.plan);
        // one agent keeps the straight line, the other takes the detour
        assert_eq!(report.sum_of_costs(), 6);
    }

    #[test]
    fn test_cardinal_conflict_returned_first() {
        init_tracing();
        let problem = problem(vec![0, 2], vec![2, 0]);
        let mut solver = Icbs::new(&problem);
        let node = solver.initial_node().unwrap();

        let constraints = solver.prioritized_conflict(&node);
        assert_eq!(constraints.len(), 2);
        for c in &constraints {
            assert_eq!(c.t, 1);
            assert_eq!(c.v, 1);
            assert_eq!(c.u, None);
        }
        assert_eq!(constraints[0].agent, 0);
        assert_eq!(constraints[1].agent, 1);
    }

    #[test]
    fn test_bypass_reduces_conflicts_at_equal_cost() {
        init_tracing();
        let problem = problem(vec![0, 2], vec![8, 6]);
        let mut solver = Icbs::new(&problem);

        // hand-picked equal-cost paths that collide twice
        let paths: Plan = vec![vec![0, 1, 4, 5, 8], vec![2, 1, 4, 7, 6]];
        let conflicts = count_all_conflicts(&paths);
        assert_eq!(conflicts, 2);
        let mdds = vec![
            solver.cache.pure(&solver.ctx, 0, 4),
            solver.cache.pure(&solver.ctx, 1, 4),
        ];
        let mut node = HighLevelNode {
            id: 0,
            soc: 8,
            conflicts,
            constraints: Vec::new(),
            paths,
            valid: true,
            mdds,
        };

        let constraints = solver.prioritized_conflict(&node);
        assert!(!constraints.is_empty());
        let soc_before = node.soc;
        assert!(solver.find_bypass(&mut node, &constraints));
        assert!(node.conflicts < 2);
        assert_eq!(node.soc, soc_before);
        assert_eq!(count_all_conflicts(&node.paths), node.conflicts);
    }

    #[test]
    fn test_solved_plans_have_no_conflicts_with_three_agents() {
        init_tracing();
        let problem = problem(vec![0, 2, 6], vec![8, 6, 2]);
        let mut solver = Icbs::new(&problem);
        let report = solver.solve();

        assert!(report.solved);
        assert_conflict_free(&report.plan);
        for (i, path) in report.plan.iter().enumerate() {
            assert_eq!(path[0], problem.start(i));
            assert_eq!(*path.last().unwrap(), problem.goal(i));
        }
    }
}
