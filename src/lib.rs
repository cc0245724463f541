//! Multi-agent path finding on 4-connected grids: an ICBS solver for the
//! classical setting and a deadlock-based search (DBS) for one-shot MAPF,
//! sharing a configurable single-agent A* underneath.

pub mod agent;
pub mod config;
pub mod graph;
pub mod problem;
pub mod solver;
