mod astar;
mod dbs;
mod fragment;
mod icbs;
mod mdd;

pub use dbs::Dbs;
pub use icbs::Icbs;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::graph::Graph;
use crate::problem::Problem;

pub type Path = Vec<usize>;
pub type Plan = Vec<Path>;

pub trait Solver {
    fn solve(&mut self) -> SolveReport;
}

/// Outcome of one solve; search-time failures are flags, never errors.
#[derive(Debug, Clone)]
pub struct SolveReport {
    pub solver: &'static str,
    pub solved: bool,
    pub unsolvable: bool,
    pub comp_time: Duration,
    pub elapsed_pathfinding: Duration,
    pub elapsed_deadlock_detection: Duration,
    pub plan: Plan,
}

impl SolveReport {
    pub fn sum_of_costs(&self) -> usize {
        self.plan.iter().map(|p| p.len().saturating_sub(1)).sum()
    }

    pub fn makespan(&self) -> usize {
        self.plan
            .iter()
            .map(|p| p.len().saturating_sub(1))
            .max()
            .unwrap_or(0)
    }

    pub fn print_summary(&self) {
        println!(
            "solved={}, solver={:>8}, comp_time(ms)={:>8}, sum of path length={:>8}",
            self.solved as u8,
            self.solver,
            self.comp_time.as_millis(),
            self.sum_of_costs()
        );
    }

    pub fn write_log(&self, problem: &Problem, path: &str) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("error@solver: cannot create log file {path}"))?;
        let mut log = BufWriter::new(file);
        let graph = problem.graph();

        writeln!(log, "instance={}", problem.instance_file())?;
        writeln!(log, "agents={}", problem.num_agents())?;
        writeln!(log, "map_file={}", problem.map_file())?;
        writeln!(log, "seed={}", problem.seed())?;
        writeln!(log, "solver={}", self.solver)?;
        writeln!(log, "solved={}", self.solved as u8)?;
        writeln!(log, "unsolvable={}", self.unsolvable as u8)?;
        writeln!(log, "comp_time={}", self.comp_time.as_millis())?;
        writeln!(
            log,
            "elapsed_pathfinding={}",
            self.elapsed_pathfinding.as_millis()
        )?;
        writeln!(
            log,
            "elapsed_deadlock_detection={}",
            self.elapsed_deadlock_detection.as_millis()
        )?;

        let mut starts = String::new();
        let mut goals = String::new();
        for i in 0..problem.num_agents() {
            let (sx, sy) = graph.pos(problem.start(i));
            let (gx, gy) = graph.pos(problem.goal(i));
            starts.push_str(&format!("({sx},{sy}),"));
            goals.push_str(&format!("({gx},{gy}),"));
        }
        writeln!(log, "starts={starts}")?;
        writeln!(log, "goals={goals}")?;
        writeln!(log, "sum-of-path-length:{}", self.sum_of_costs())?;
        writeln!(log, "plan=")?;
        for (i, p) in self.plan.iter().enumerate() {
            write!(log, "{i}:")?;
            for v in p {
                write!(log, "{v},")?;
            }
            writeln!(log)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Stats {
    pub(crate) high_level_expanded: usize,
    pub(crate) low_level_expanded: usize,
}

impl Stats {
    pub(crate) fn log(&self, solver: &str) {
        info!(
            "{solver}: high level expand nodes {}, low level expand nodes {}",
            self.high_level_expanded, self.low_level_expanded
        );
    }
}

/// Per-solve shared state: graph handle, distance oracle, goal table,
/// PRNG handle and the elapsed-time budget.
pub(crate) struct SolveContext {
    pub(crate) graph: Rc<Graph>,
    pub(crate) starts: Vec<usize>,
    pub(crate) goals: Vec<usize>,
    pub(crate) dist_to_goal: Vec<Vec<usize>>,
    pub(crate) dist_from_start: Vec<Vec<usize>>,
    pub(crate) goal_table: Vec<bool>,
    pub(crate) rng: Rc<RefCell<StdRng>>,
    started: Instant,
    max_comp_time: Duration,
}

impl SolveContext {
    pub(crate) fn new(problem: &Problem) -> Self {
        let graph = Rc::clone(problem.graph());
        let starts = problem.starts().to_vec();
        let goals = problem.goals().to_vec();

        let preprocess = Instant::now();
        let dist_to_goal: Vec<Vec<usize>> =
            goals.iter().map(|&g| bfs_distances(&graph, g)).collect();
        let dist_from_start: Vec<Vec<usize>> =
            starts.iter().map(|&s| bfs_distances(&graph, s)).collect();
        let mut goal_table = vec![false; graph.size()];
        for &g in &goals {
            goal_table[g] = true;
        }
        info!(
            "pre-processing, created distance tables by BFS in {:?}",
            preprocess.elapsed()
        );

        SolveContext {
            graph,
            starts,
            goals,
            dist_to_goal,
            dist_from_start,
            goal_table,
            rng: problem.rng_handle(),
            started: Instant::now(),
            max_comp_time: problem.max_comp_time(),
        }
    }

    pub(crate) fn num_agents(&self) -> usize {
        self.starts.len()
    }

    pub(crate) fn h(&self, agent: usize, v: usize) -> usize {
        self.dist_to_goal[agent][v]
    }

    pub(crate) fn start_timer(&mut self) {
        self.started = Instant::now();
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn over_comp_time(&self) -> bool {
        self.elapsed() >= self.max_comp_time
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.started + self.max_comp_time
    }
}

/// Unweighted distances from `source` to every vertex; unreachable holds
/// `graph.size()`.
fn bfs_distances(graph: &Graph, source: usize) -> Vec<usize> {
    let infinity = graph.size();
    let mut dist = vec![infinity; graph.size()];
    dist[source] = 0;
    let mut open = VecDeque::from([source]);
    while let Some(v) = open.pop_front() {
        let d = dist[v] + 1;
        for &u in graph.neighbors(v) {
            if d < dist[u] {
                dist[u] = d;
                open.push_back(u);
            }
        }
    }
    dist
}

/// Path cost ignoring trailing stays at the goal.
pub(crate) fn path_cost(path: &[usize]) -> usize {
    let mut end = path.len();
    while end > 1 && path[end - 2] == path[end - 1] {
        end -= 1;
    }
    end.saturating_sub(1)
}

/// Position at `t`, with agents parked on their last vertex afterwards.
pub(crate) fn position_at(path: &[usize], t: usize) -> usize {
    if t < path.len() {
        path[t]
    } else {
        *path.last().expect("empty path")
    }
}
