use std::path::PathBuf;

use clap::Parser;

use hpc_batch_sim::config::SystemConfig;
use hpc_batch_sim::reader::sort_workload;
use hpc_batch_sim::scheduler::PolicyKind;
use hpc_batch_sim::simulator::{RunOptions, Simulator};

#[derive(Debug, clap::Parser)]
#[command(long_about = None)]
struct Args {
    /// SWF workload trace to replay
    #[arg(long)]
    workload: PathBuf,
    /// System configuration file (groups, node counts, output templates)
    #[arg(long)]
    config: PathBuf,
    /// Directory where output files are written
    #[arg(long, default_value = "results")]
    results: PathBuf,
    /// Scheduling policy to use
    #[arg(long, default_value_t = String::from("fifo-first-fit"))]
    policy: String,
    /// Sort the trace by submit time into the results directory first
    #[arg(long, default_value_t = false)]
    sort: bool,
    /// Skip the scheduling log
    #[arg(long, default_value_t = false)]
    no_sched_output: bool,
    /// Skip the pretty-print log
    #[arg(long, default_value_t = false)]
    no_pprint_output: bool,
    /// Skip the statistics file
    #[arg(long, default_value_t = false)]
    no_statistics: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let config = SystemConfig::from_file(&args.config)?;
    let policy = PolicyKind::from(&args.policy)?;

    let opts = RunOptions {
        results_dir: args.results.clone(),
        scheduling_output: !args.no_sched_output,
        pprint_output: !args.no_pprint_output,
        statistics_output: !args.no_statistics,
        ..RunOptions::default()
    };

    let workload = if args.sort {
        std::fs::create_dir_all(&args.results)?;
        let file_name = args
            .workload
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "workload".to_string());
        let sorted = args.results.join(format!("sorted-{}", file_name));
        sort_workload(&args.workload, &sorted)?;
        sorted
    } else {
        args.workload.clone()
    };

    let mut simulator = Simulator::new(&config, &workload, policy.build(), opts)?;
    let summary = simulator.run()?;
    print!("{}", summary);

    Ok(())
}
