use clap::Parser;
use tracing_subscriber::EnvFilter;

use mapf_search::config::{Cli, SolverKind};
use mapf_search::problem::Problem;
use mapf_search::solver::{Dbs, Icbs, Solver};

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    if let Err(err) = run(&cli) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let problem = Problem::from_file(&cli.instance)?;

    let mut solver: Box<dyn Solver> = match cli.solver {
        SolverKind::Icbs => Box::new(Icbs::new(&problem)),
        SolverKind::Dbs => {
            let mut dbs = Dbs::new(&problem);
            dbs.set_max_fragment_size(cli.max_fragment_size);
            Box::new(dbs)
        }
    };

    let report = solver.solve();
    report.print_summary();
    report.write_log(&problem, &cli.output)?;
    Ok(())
}
