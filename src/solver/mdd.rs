use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use super::{Path, SolveContext};

/// Forbids `agent` from occupying `v` at `t`; with `u` present, forbids the
/// move `u -> v` arriving at `t` instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Constraint {
    pub(crate) agent: usize,
    pub(crate) t: usize,
    pub(crate) v: usize,
    pub(crate) u: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MddNode {
    pub(crate) prev: BTreeSet<usize>,
    pub(crate) next: BTreeSet<usize>,
}

/// Layered DAG of every length-`cost` path of one agent. Level `t` holds the
/// vertices reachable from the start in `t` steps that still reach the goal
/// in the remaining budget; wait edges connect consecutive levels alongside
/// graph edges.
#[derive(Debug, Clone)]
pub(crate) struct Mdd {
    pub(crate) agent: usize,
    pub(crate) cost: usize,
    pub(crate) goal: usize,
    pub(crate) body: Vec<BTreeMap<usize, MddNode>>,
    pub(crate) valid: bool,
}

impl Mdd {
    /// Builds the unconstrained MDD by bidirectional pruning over the
    /// distance tables.
    pub(crate) fn build(ctx: &SolveContext, agent: usize, cost: usize) -> Mdd {
        let ds = &ctx.dist_from_start[agent];
        let dg = &ctx.dist_to_goal[agent];

        let mut body: Vec<BTreeMap<usize, MddNode>> = Vec::with_capacity(cost + 1);
        for t in 0..=cost {
            let mut level = BTreeMap::new();
            for v in 0..ctx.graph.size() {
                if ctx.graph.vertex(v).is_some() && ds[v] <= t && dg[v] <= cost - t {
                    level.insert(v, MddNode::default());
                }
            }
            body.push(level);
        }

        for t in 0..cost {
            let (head, tail) = body.split_at_mut(t + 1);
            let level = &mut head[t];
            let next_level = &mut tail[0];
            let uppers: Vec<usize> = level.keys().copied().collect();
            for u in uppers {
                let mut moves = vec![u];
                moves.extend_from_slice(ctx.graph.neighbors(u));
                for w in moves {
                    if let Some(next_node) = next_level.get_mut(&w) {
                        next_node.prev.insert(u);
                        if let Some(node) = level.get_mut(&u) {
                            node.next.insert(w);
                        }
                    }
                }
            }
        }

        let mut mdd = Mdd {
            agent,
            cost,
            goal: ctx.goals[agent],
            body,
            valid: true,
        };
        mdd.prune();
        mdd
    }

    /// Removes the constrained vertices/edges for this agent, then prunes
    /// forward and backward to a fixed point. An emptied level flips `valid`.
    pub(crate) fn update(&mut self, constraints: &[Constraint]) {
        for c in constraints {
            if c.agent != self.agent {
                continue;
            }
            if c.t > self.cost {
                // past the horizon the agent is parked on its goal
                if c.u.is_none() && c.v == self.goal {
                    self.valid = false;
                    return;
                }
                continue;
            }
            match c.u {
                None => {
                    if let Some(node) = self.body[c.t].remove(&c.v) {
                        if c.t > 0 {
                            for &p in &node.prev {
                                if let Some(pn) = self.body[c.t - 1].get_mut(&p) {
                                    pn.next.remove(&c.v);
                                }
                            }
                        }
                        if c.t < self.cost {
                            for &n in &node.next {
                                if let Some(nn) = self.body[c.t + 1].get_mut(&n) {
                                    nn.prev.remove(&c.v);
                                }
                            }
                        }
                    }
                }
                Some(u) => {
                    if c.t == 0 {
                        continue;
                    }
                    if let Some(node) = self.body[c.t].get_mut(&c.v) {
                        node.prev.remove(&u);
                    }
                    if let Some(node) = self.body[c.t - 1].get_mut(&u) {
                        node.next.remove(&c.v);
                    }
                }
            }
        }
        self.prune();
    }

    fn prune(&mut self) {
        let cost = self.cost;
        let mut stack: Vec<(usize, usize)> = Vec::new();
        for (t, level) in self.body.iter().enumerate() {
            for (&v, node) in level {
                if (t > 0 && node.prev.is_empty()) || (t < cost && node.next.is_empty()) {
                    stack.push((t, v));
                }
            }
        }
        while let Some((t, v)) = stack.pop() {
            let node = match self.body[t].remove(&v) {
                Some(node) => node,
                None => continue,
            };
            if t > 0 {
                for &p in &node.prev {
                    if let Some(pn) = self.body[t - 1].get_mut(&p) {
                        pn.next.remove(&v);
                        if pn.next.is_empty() {
                            stack.push((t - 1, p));
                        }
                    }
                }
            }
            if t < cost {
                for &n in &node.next {
                    if let Some(nn) = self.body[t + 1].get_mut(&n) {
                        nn.prev.remove(&v);
                        if nn.prev.is_empty() {
                            stack.push((t + 1, n));
                        }
                    }
                }
            }
        }
        if self.body.iter().any(|level| level.is_empty()) {
            self.valid = false;
        }
    }

    pub(crate) fn width(&self, t: usize) -> usize {
        self.body.get(t).map_or(0, |level| level.len())
    }

    /// True when level `t` holds a single vertex whose predecessor is unique.
    pub(crate) fn singleton_with_unique_prev(&self, t: usize) -> bool {
        t <= self.cost
            && self.body[t].len() == 1
            && self.body[t].values().next().is_some_and(|n| n.prev.len() == 1)
    }

    /// Any source-to-sink walk; deterministic (smallest vertex id first).
    pub(crate) fn get_path(&self) -> Path {
        if !self.valid {
            return Vec::new();
        }
        let mut cur = match self.body[0].keys().next() {
            Some(&v) => v,
            None => return Vec::new(),
        };
        let mut path = vec![cur];
        for t in 0..self.cost {
            let next = self.body[t].get(&cur).and_then(|n| n.next.iter().next());
            match next {
                Some(&w) => {
                    path.push(w);
                    cur = w;
                }
                None => return Vec::new(),
            }
        }
        path
    }

    /// A source-to-sink walk that avoids one extra constraint, without
    /// rebuilding the MDD. Empty when no such walk exists.
    pub(crate) fn get_path_avoiding(&self, c: &Constraint) -> Path {
        if !self.valid {
            return Vec::new();
        }
        if c.agent != self.agent {
            return self.get_path();
        }
        if c.t > self.cost {
            if c.u.is_none() && c.v == self.goal {
                // parked on the goal, nothing of this cost avoids it
                return Vec::new();
            }
            return self.get_path();
        }
        let start = match self.body[0].keys().next() {
            Some(&v) => v,
            None => return Vec::new(),
        };
        let mut path = Vec::with_capacity(self.cost + 1);
        let mut dead: HashSet<(usize, usize)> = HashSet::new();
        if self.walk(0, start, c, &mut dead, &mut path) {
            path
        } else {
            Vec::new()
        }
    }

    fn walk(
        &self,
        t: usize,
        v: usize,
        c: &Constraint,
        dead: &mut HashSet<(usize, usize)>,
        path: &mut Path,
    ) -> bool {
        path.push(v);
        if t == self.cost {
            return true;
        }
        if let Some(node) = self.body[t].get(&v) {
            for &w in &node.next {
                if t + 1 == c.t && w == c.v && c.u.map_or(true, |u| u == v) {
                    continue;
                }
                if dead.contains(&(t + 1, w)) {
                    continue;
                }
                if self.walk(t + 1, w, c, dead, path) {
                    return true;
                }
            }
        }
        path.pop();
        dead.insert((t, v));
        false
    }
}

/// Session-scoped table of unconstrained MDDs keyed by `(agent, cost)`.
/// Published entries are immutable and shared by reference.
#[derive(Default)]
pub(crate) struct MddCache {
    table: HashMap<(usize, usize), Rc<Mdd>>,
}

impl MddCache {
    pub(crate) fn pure(&mut self, ctx: &SolveContext, agent: usize, cost: usize) -> Rc<Mdd> {
        if let Some(mdd) = self.table.get(&(agent, cost)) {
            return Rc::clone(mdd);
        }
        let mdd = Rc::new(Mdd::build(ctx, agent, cost));
        self.table.insert((agent, cost), Rc::clone(&mdd));
        mdd
    }
}
