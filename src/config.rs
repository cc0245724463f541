use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "mapf",
    about = "Conflict-based multi-agent path finding: ICBS and DBS.",
    version
)]
pub struct Cli {
    #[arg(long, short, help = "Path to the instance file")]
    pub instance: String,

    #[arg(
        long,
        short,
        value_enum,
        default_value_t = SolverKind::Dbs,
        help = "High-level solver"
    )]
    pub solver: SolverKind,

    #[arg(long, short, default_value = "result.txt", help = "Plan log file")]
    pub output: String,

    #[arg(
        long,
        short = 'f',
        default_value_t = -1,
        allow_negative_numbers = true,
        help = "Maximum fragment size for DBS; negative means unbounded"
    )]
    pub max_fragment_size: i32,

    #[arg(long, short, help = "Verbose progress output")]
    pub verbose: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    Icbs,
    Dbs,
}
