use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::SystemConfig;
use crate::job::{AttributeType, FieldKind, JobFactory};
use crate::kernel::{EventManager, Time};
use crate::output::{pprint_pre_process, scheduling_pre_process, OutputContext, OutputSpec};
use crate::reader::SwfReader;
use crate::resources::{ResourceManager, ResourcePool};
use crate::scheduler::Scheduler;

/// Canonical renaming of SWF trace fields.
pub fn default_swf_mapper() -> HashMap<String, String> {
    [
        ("job_number", "id"),
        ("submit_time", "queued_time"),
        ("requested_time", "expected_duration"),
        ("requested_number_processors", "core"),
        ("requested_memory", "mem"),
    ]
    .iter()
    .map(|(old, new)| (old.to_string(), new.to_string()))
    .collect()
}

/// User attributes attached to jobs built from SWF traces. `core` and `mem`
/// double as the per-job resource totals the factory derives requests from.
pub fn default_swf_attrs() -> Vec<AttributeType> {
    vec![
        AttributeType::new("core", FieldKind::Int),
        AttributeType::new("mem", FieldKind::Int),
        AttributeType::optional("user_id", FieldKind::Int),
        AttributeType::optional("group_id", FieldKind::Int),
        AttributeType::optional("queue_number", FieldKind::Int),
    ]
}

/// Runtime knobs of a simulation run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub results_dir: PathBuf,
    pub scheduling_output: bool,
    pub pprint_output: bool,
    pub statistics_output: bool,
    /// Distinct submit times loaded per reader batch.
    pub time_samples: usize,
    /// Load more jobs whenever fewer future time buckets than this remain.
    pub low_watermark: usize,
    /// Dispatch processing cost added to every start time.
    pub time_diff: Time,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            scheduling_output: true,
            pprint_output: true,
            statistics_output: true,
            time_samples: 2,
            low_watermark: 10,
            time_diff: 0,
        }
    }
}

/// Aggregate results of a finished run.
#[derive(Debug)]
pub struct RunSummary {
    pub total_jobs: usize,
    /// Last completion minus first dispatch.
    pub makespan: Time,
    pub avg_waiting_time: f64,
    pub avg_slowdown: f64,
    pub execution_time: f64,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Total jobs: {}", self.total_jobs)?;
        writeln!(f, "Makespan: {}", self.makespan)?;
        writeln!(f, "Avg. waiting times: {}", self.avg_waiting_time)?;
        writeln!(f, "Avg. slowdown: {}", self.avg_slowdown)
    }
}

/// Wires reader → factory → kernel → policy and drives the main loop.
pub struct Simulator {
    reader: SwfReader,
    factory: JobFactory,
    kernel: EventManager,
    scheduler: Box<dyn Scheduler>,
    opts: RunOptions,
    stats_path: Option<PathBuf>,
    loaded_jobs: usize,
}

impl Simulator {
    pub fn new(
        config: &SystemConfig,
        workload: &Path,
        scheduler: Box<dyn Scheduler>,
        opts: RunOptions,
    ) -> anyhow::Result<Self> {
        let pool = ResourcePool::new(
            config.groups.clone(),
            &config.node_counts,
            &config.node_prefix,
        )?;
        let resource_manager = ResourceManager::new(pool);
        let factory = JobFactory::new(&resource_manager, default_swf_attrs(), default_swf_mapper())?;
        let mut kernel = EventManager::new(resource_manager);

        std::fs::create_dir_all(&opts.results_dir).with_context(|| {
            format!("cannot create results directory {}", opts.results_dir.display())
        })?;
        let workload_name = workload
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "workload".to_string());
        let ctx = OutputContext {
            node_prefix: config.node_prefix.clone(),
            resource_order: config.resource_order.clone(),
        };
        if opts.scheduling_output {
            let spec = config
                .scheduling_output
                .clone()
                .unwrap_or_else(OutputSpec::default_scheduling);
            kernel.add_sink(
                opts.results_dir.join(format!("sched-{}", workload_name)),
                scheduling_pre_process(spec, ctx.clone()),
            )?;
        }
        if opts.pprint_output {
            let spec = config
                .pprint_output
                .clone()
                .unwrap_or_else(OutputSpec::default_pprint);
            kernel.add_sink(
                opts.results_dir.join(format!("pprint-{}", workload_name)),
                pprint_pre_process(spec, ctx),
            )?;
        }
        let stats_path = opts
            .statistics_output
            .then(|| opts.results_dir.join(format!("statistics-{}", workload_name)));

        Ok(Self {
            reader: SwfReader::open(workload)?,
            factory,
            kernel,
            scheduler,
            opts,
            stats_path,
            loaded_jobs: 0,
        })
    }

    /// Run the simulation to completion and write the statistics file.
    pub fn run(&mut self) -> anyhow::Result<RunSummary> {
        let started = std::time::Instant::now();

        self.load_next_batch()?;
        let mut events = self.kernel.next_events();
        while !events.is_empty() || self.kernel.has_events() {
            self.kernel.release_ended()?;

            if !events.is_empty() {
                let now = self
                    .kernel
                    .current_time()
                    .context("clock not initialized with jobs eligible")?;
                let decisions = self.scheduler.schedule(
                    now,
                    self.kernel.jobs(),
                    &events,
                    self.kernel.resource_manager(),
                );
                let outcome = self.kernel.dispatch(decisions, self.opts.time_diff)?;
                log::debug!(
                    "{}: dispatched {}, instantly finished {}, postponed {}; {}",
                    now,
                    outcome.dispatched,
                    outcome.dispatched_and_finished,
                    outcome.postponed,
                    self.kernel.resource_manager().usage()
                );
            }

            if self.kernel.loaded_len() < self.opts.low_watermark && !self.reader.eof() {
                self.load_next_batch()?;
            }
            events = self.kernel.next_events();
        }

        let finished = self.kernel.finished().len();
        anyhow::ensure!(
            finished == self.loaded_jobs,
            "loaded {} jobs but finished {}",
            self.loaded_jobs,
            finished
        );
        self.kernel.stop_writers()?;

        let makespan = match (self.kernel.last_run_time(), self.kernel.first_time_dispatch()) {
            (Some(last), Some(first)) => last - first,
            _ => 0,
        };
        let summary = RunSummary {
            total_jobs: self.loaded_jobs,
            makespan,
            avg_waiting_time: self.kernel.avg_waiting_time(),
            avg_slowdown: self.kernel.avg_slowdown(),
            execution_time: started.elapsed().as_secs_f64(),
        };
        if let Some(path) = &self.stats_path {
            std::fs::write(path, summary.to_string())
                .with_context(|| format!("cannot write statistics to {}", path.display()))?;
        }
        log::info!(
            "simulation done in {:.3}s: {}",
            summary.execution_time,
            self.kernel.simulated_status()
        );
        Ok(summary)
    }

    fn load_next_batch(&mut self) -> anyhow::Result<()> {
        let batch = self.reader.next_batch(self.opts.time_samples)?;
        for raw in batch {
            let job = self.factory.build(raw)?;
            self.loaded_jobs += 1;
            self.kernel.load(job)?;
        }
        Ok(())
    }
}
