use anyhow::{bail, Context, Result};
use rand::prelude::*;
use rand::rngs::StdRng;
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tracing::{info, warn};

use crate::graph::Graph;

const DEFAULT_SEED: u64 = 0;
const DEFAULT_MAX_COMP_TIME_MS: u64 = 10_000;

/// A solve instance: graph, starts/goals, time budget and the shared PRNG.
#[derive(Debug)]
pub struct Problem {
    instance_file: String,
    map_file: String,
    graph: Rc<Graph>,
    num_agents: usize,
    seed: u64,
    max_comp_time: Duration,
    starts: Vec<usize>,
    goals: Vec<usize>,
    rng: Rc<RefCell<StdRng>>,
}

impl Problem {
    /// Loads the line-oriented instance format: `map_file=`, `agents=`,
    /// `seed=`, `random_problem=`, `max_comp_time=`, one `xs,ys,xg,yg` pair
    /// per line, `#`-prefixed comments.
    pub fn from_file(path: &str) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("error@problem: file {path} is not found"))?;

        let mut map_file = String::new();
        let mut graph: Option<Graph> = None;
        let mut num_agents: usize = 0;
        let mut seed = DEFAULT_SEED;
        let mut max_comp_time = DEFAULT_MAX_COMP_TIME_MS;
        let mut pairs: Vec<(usize, usize)> = Vec::new();
        let mut read_scen = true;

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(value) = line.strip_prefix("map_file=") {
                map_file = value.to_string();
                graph = Some(load_map(path, value)?);
            } else if let Some(value) = line.strip_prefix("agents=") {
                num_agents = value
                    .parse()
                    .with_context(|| format!("error@problem: invalid agents value {value:?}"))?;
            } else if let Some(value) = line.strip_prefix("seed=") {
                seed = value
                    .parse()
                    .with_context(|| format!("error@problem: invalid seed value {value:?}"))?;
            } else if let Some(value) = line.strip_prefix("random_problem=") {
                if value.trim() != "0" {
                    read_scen = false;
                    pairs.clear();
                }
            } else if let Some(value) = line.strip_prefix("max_comp_time=") {
                max_comp_time = value.parse().with_context(|| {
                    format!("error@problem: invalid max_comp_time value {value:?}")
                })?;
            } else if read_scen && pairs.len() < num_agents {
                let fields: Vec<&str> = line.split(',').collect();
                if fields.len() != 4 {
                    continue;
                }
                let mut coords = [0usize; 4];
                for (slot, field) in coords.iter_mut().zip(&fields) {
                    *slot = field.trim().parse().with_context(|| {
                        format!("error@problem: invalid start/goal line {line:?}")
                    })?;
                }
                let graph = graph
                    .as_ref()
                    .context("error@problem: start/goal lines must follow map_file")?;
                let (xs, ys, xg, yg) = (coords[0], coords[1], coords[2], coords[3]);
                if !graph.exists(xs, ys) {
                    bail!("error@problem: start node ({xs}, {ys}) does not exist, invalid scenario");
                }
                if !graph.exists(xg, yg) {
                    bail!("error@problem: goal node ({xg}, {yg}) does not exist, invalid scenario");
                }
                pairs.push((graph.id_of(xs, ys), graph.id_of(xg, yg)));
            }
        }

        let graph = graph.context("error@problem: no map_file given")?;
        if num_agents == 0 {
            bail!("error@problem: invalid number of agents");
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let (starts, goals) = if pairs.len() < num_agents {
            if !pairs.is_empty() {
                warn!("given starts/goals are not sufficient, randomly create instances");
            }
            random_starts_goals(&graph, num_agents, &mut rng)?
        } else {
            pairs.truncate(num_agents);
            pairs.into_iter().unzip()
        };

        info!(
            "instance loaded: {} agents on {}x{} grid, seed {seed}",
            num_agents,
            graph.width(),
            graph.height()
        );

        Ok(Problem {
            instance_file: path.to_string(),
            map_file,
            graph: Rc::new(graph),
            num_agents,
            seed,
            max_comp_time: Duration::from_millis(max_comp_time),
            starts,
            goals,
            rng: Rc::new(RefCell::new(rng)),
        })
    }

    /// Assembles an instance directly; used by library callers and tests.
    pub fn from_parts(
        graph: Graph,
        starts: Vec<usize>,
        goals: Vec<usize>,
        seed: u64,
        max_comp_time: Duration,
    ) -> Result<Self> {
        if starts.is_empty() || starts.len() != goals.len() {
            bail!("error@problem: invalid number of agents");
        }
        for &v in starts.iter().chain(goals.iter()) {
            if graph.vertex(v).is_none() {
                bail!("error@problem: node {v} does not exist, invalid scenario");
            }
        }
        Ok(Problem {
            instance_file: String::new(),
            map_file: String::new(),
            num_agents: starts.len(),
            seed,
            max_comp_time,
            starts,
            goals,
            graph: Rc::new(graph),
            rng: Rc::new(RefCell::new(StdRng::seed_from_u64(seed))),
        })
    }

    pub fn instance_file(&self) -> &str {
        &self.instance_file
    }

    pub fn map_file(&self) -> &str {
        &self.map_file
    }

    pub fn graph(&self) -> &Rc<Graph> {
        &self.graph
    }

    pub fn num_agents(&self) -> usize {
        self.num_agents
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn max_comp_time(&self) -> Duration {
        self.max_comp_time
    }

    pub fn start(&self, i: usize) -> usize {
        self.starts[i]
    }

    pub fn goal(&self, i: usize) -> usize {
        self.goals[i]
    }

    pub fn starts(&self) -> &[usize] {
        &self.starts
    }

    pub fn goals(&self) -> &[usize] {
        &self.goals
    }

    pub(crate) fn rng_handle(&self) -> Rc<RefCell<StdRng>> {
        Rc::clone(&self.rng)
    }
}

fn load_map(instance_path: &str, map_file: &str) -> Result<Graph> {
    if Path::new(map_file).is_file() {
        return Graph::from_file(map_file);
    }
    // fall back to the instance file's directory
    let sibling = Path::new(instance_path)
        .parent()
        .map(|dir| dir.join(map_file));
    match sibling {
        Some(p) if p.is_file() => Graph::from_file(&p.to_string_lossy()),
        _ => Graph::from_file(map_file),
    }
}

fn random_starts_goals(
    graph: &Graph,
    num_agents: usize,
    rng: &mut StdRng,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let mut candidates: Vec<usize> = (0..graph.size()).collect();

    candidates.shuffle(rng);
    let starts: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&v| graph.vertex(v).is_some())
        .take(num_agents)
        .collect();
    if starts.len() < num_agents {
        bail!("error@problem: number of agents is too large");
    }

    // goals must differ from the same agent's start; restart on a clash
    let mut goals: Vec<usize> = Vec::with_capacity(num_agents);
    'retry: loop {
        candidates.shuffle(rng);
        goals.clear();
        for &v in &candidates {
            if graph.vertex(v).is_none() {
                continue;
            }
            if v == starts[goals.len()] {
                continue 'retry;
            }
            goals.push(v);
            if goals.len() == num_agents {
                break 'retry;
            }
        }
        bail!("error@problem: number of agents is too large");
    }

    Ok((starts, goals))
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
    fn test_parse_instance() {
        init_tracing();
        let dir = std::env::temp_dir().join("mapf_search_problem_test");
        fs::create_dir_all(&dir).unwrap();
        let map_path = dir.join("tiny.map");
        fs::write(&map_path, "type octile\nheight 3\nwidth 3\nmap\n...\n...\n...\n").unwrap();
        let scen_path = dir.join("tiny.txt");
        fs::write(
            &scen_path,
            "# comment\nmap_file=tiny.map\nagents=2\nseed=7\nmax_comp_time=500\n0,0,2,0\n2,0,0,0\n",
        )
        .unwrap();

        let problem = Problem::from_file(&scen_path.to_string_lossy()).unwrap();
        assert_eq!(problem.num_agents(), 2);
        assert_eq!(problem.seed(), 7);
        assert_eq!(problem.max_comp_time(), Duration::from_millis(500));
        assert_eq!(problem.start(0), 0);
        assert_eq!(problem.goal(0), 2);
        assert_eq!(problem.start(1), 2);
        assert_eq!(problem.goal(1), 0);
    }

    #[test]
    fn test_missing_vertex_is_fatal() {
        init_tracing();
        let dir = std::env::temp_dir().join("mapf_search_problem_test_bad");
        fs::create_dir_all(&dir).unwrap();
        let map_path = dir.join("wall.map");
        fs::write(&map_path, "type octile\nheight 2\nwidth 2\nmap\n.@\n..\n").unwrap();
        let scen_path = dir.join("wall.txt");
        fs::write(&scen_path, "map_file=wall.map\nagents=1\n1,0,0,0\n").unwrap();

        let err = Problem::from_file(&scen_path.to_string_lossy()).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_random_problem_is_reproducible() {
        init_tracing();
        let make = || {
            let graph = open_grid(4, 4);
            let mut rng = StdRng::seed_from_u64(11);
            random_starts_goals(&graph, 3, &mut rng).unwrap()
        };
        let (s1, g1) = make();
        let (s2, g2) = make();
        assert_eq!(s1, s2);
        assert_eq!(g1, g2);
        for (s, g) in s1.iter().zip(&g1) {
            assert_ne!(s, g);
        }
    }
}
