use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::Context;
use incr_stats::incr::Stats;

use crate::job::Job;
use crate::resources::ResourceManager;
use crate::writer::{AsyncWriter, PreProcess};

/// Simulated time in seconds. The clock starts one second before the first
/// submission, which may be negative for traces starting at zero.
pub type Time = i64;

/// Sorted set of future time points. Duplicate insertions collapse.
#[derive(Debug, Default)]
pub struct TimeSet {
    points: BTreeSet<Time>,
}

impl TimeSet {
    pub fn add(&mut self, t: Time) {
        self.points.insert(t);
    }

    pub fn pop_min(&mut self) -> Option<Time> {
        self.points.pop_first()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Mutable lifecycle fields of a dispatched job, kept apart from the
/// immutable intake record.
#[derive(Debug, Clone, Default)]
pub struct DispatchState {
    pub start_time: Option<Time>,
    pub end_time: Option<Time>,
    pub running_time: Option<Time>,
    pub waiting_time: Option<Time>,
    pub slowdown: Option<f64>,
    pub assigned_nodes: Vec<String>,
    /// 1-based completion rank, 0 until the job finishes.
    pub end_order: usize,
}

/// Snapshot of a job handed to output writers and observers.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job: Job,
    pub state: DispatchState,
}

/// One scheduling decision: a start time (or a wake-up hint), the job, and
/// the nodes it runs on. An empty node list re-queues the job.
#[derive(Debug, Clone)]
pub struct Decision {
    pub start_time: Option<Time>,
    pub job_id: String,
    pub nodes: Vec<String>,
}

/// Counters returned by a dispatch round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub dispatched: usize,
    pub dispatched_and_finished: usize,
    pub postponed: usize,
}

/// Read-only view for monitoring; copies, never references, kernel state.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub current_time: Option<Time>,
    pub loaded: usize,
    pub queued: usize,
    pub running: Vec<JobRecord>,
    pub finished: usize,
}

/// Lazily opened output sink: the file is only created once the first job
/// finishes, so a pre-dispatch fatal never opens an output file.
struct Sink {
    path: std::path::PathBuf,
    pre_process: Option<PreProcess<JobRecord>>,
    writer: Option<AsyncWriter<JobRecord>>,
}

/// The simulation kernel: coordinates admission, time advancement, dispatch
/// and completion of jobs, while keeping the resource accounts consistent.
///
/// Every admitted job id lives in exactly one of loaded, queued, running or
/// finished; the clock only moves forward.
pub struct EventManager {
    resource_manager: ResourceManager,
    jobs: HashMap<String, Job>,
    states: HashMap<String, DispatchState>,

    current_time: Option<Time>,
    time_points: TimeSet,
    loaded: HashMap<Time, Vec<String>>,
    queued: Vec<String>,
    running: Vec<String>,
    real_ending: HashMap<Time, Vec<String>>,
    finished: Vec<String>,
    finished_ids: HashSet<String>,

    first_time_dispatch: Option<Time>,
    last_run_time: Option<Time>,
    slowdowns: Stats,
    wtimes: Stats,

    sinks: Vec<Sink>,
}

impl EventManager {
    pub fn new(resource_manager: ResourceManager) -> Self {
        Self {
            resource_manager,
            jobs: HashMap::new(),
            states: HashMap::new(),
            current_time: None,
            time_points: TimeSet::default(),
            loaded: HashMap::new(),
            queued: Vec::new(),
            running: Vec::new(),
            real_ending: HashMap::new(),
            finished: Vec::new(),
            finished_ids: HashSet::new(),
            first_time_dispatch: None,
            last_run_time: None,
            slowdowns: Stats::new(),
            wtimes: Stats::new(),
            sinks: Vec::new(),
        }
    }

    /// Register an output sink. Paths must be distinct; the file is created
    /// when the first record is pushed.
    pub fn add_sink(
        &mut self,
        path: std::path::PathBuf,
        pre_process: PreProcess<JobRecord>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.sinks.iter().any(|s| s.path == path),
            "output path {} registered twice",
            path.display()
        );
        self.sinks.push(Sink {
            path,
            pre_process: Some(pre_process),
            writer: None,
        });
        Ok(())
    }

    /// Admit a job. The clock initializes lazily one second before the first
    /// submission; a submission behind the clock is a replay-ordering bug.
    pub fn load(&mut self, job: Job) -> anyhow::Result<()> {
        let now = match self.current_time {
            Some(t) => t,
            None => {
                let t = job.queued_time - 1;
                self.current_time = Some(t);
                self.time_points.add(t);
                t
            }
        };
        anyhow::ensure!(
            job.queued_time >= now,
            "job {} submitted at {} after the clock already reached {}",
            job.id,
            job.queued_time,
            now
        );
        anyhow::ensure!(
            !self.jobs.contains_key(&job.id) && !self.finished_ids.contains(&job.id),
            "duplicate job id {}",
            job.id
        );
        let id = job.id.clone();
        if job.queued_time == now {
            self.queued.push(id.clone());
        } else {
            self.loaded.entry(job.queued_time).or_default().push(id.clone());
            self.time_points.add(job.queued_time);
        }
        self.jobs.insert(id, job);
        Ok(())
    }

    pub fn load_many(&mut self, jobs: Vec<Job>) -> anyhow::Result<()> {
        for job in jobs {
            self.load(job)?;
        }
        Ok(())
    }

    /// Advance the clock to the next time point (or by one second when no
    /// future time points remain) and return the job ids eligible now:
    /// previously queued first, newly submitted after, both in admission
    /// order.
    pub fn next_events(&mut self) -> Vec<String> {
        match self.time_points.pop_min() {
            Some(t) => self.current_time = Some(t),
            None => {
                log::debug!("no more time points, but jobs are still in the queue");
                self.current_time = Some(self.current_time.map_or(0, |t| t + 1));
            }
        }
        let now = self.current_time.unwrap_or_default();
        let mut events = std::mem::take(&mut self.queued);
        if let Some(submitted) = self.loaded.remove(&now) {
            events.extend(submitted);
        }
        log::debug!("{} next events: {:?}", now, events);
        events
    }

    /// True while any job is loaded, queued or running.
    pub fn has_events(&self) -> bool {
        !self.loaded.is_empty() || !self.queued.is_empty() || !self.running.is_empty()
    }

    /// Apply one batch of scheduling decisions in the order emitted.
    ///
    /// A decision carrying nodes must be timed exactly at `current_time`,
    /// anything else is a fatal time-sync bug; the kernel then adds the
    /// dispatch processing cost `time_diff` itself, so the job starts at
    /// `current_time + time_diff` without the policy knowing about the cost.
    /// Decisions without nodes re-queue the job, keeping an optional wake-up
    /// hint.
    pub fn dispatch(
        &mut self,
        decisions: Vec<Decision>,
        time_diff: Time,
    ) -> anyhow::Result<DispatchOutcome> {
        let now = self.current_time.context("dispatch before any job was loaded")?;
        let mut outcome = DispatchOutcome::default();

        for decision in decisions {
            let Decision {
                start_time,
                job_id,
                nodes,
            } = decision;
            anyhow::ensure!(
                self.jobs.contains_key(&job_id),
                "scheduler returned unknown job id {}",
                job_id
            );
            anyhow::ensure!(
                start_time.map_or(true, |t| t >= now),
                "scheduler returned start time {:?} for job {} behind current time {}",
                start_time,
                job_id,
                now
            );

            if nodes.is_empty() {
                if let Some(hint) = start_time {
                    if hint != now {
                        self.time_points.add(hint);
                    }
                }
                self.queued.push(job_id);
                outcome.postponed += 1;
                continue;
            }

            let decision_time = start_time.with_context(|| {
                format!("decision for job {} names nodes but no start time", job_id)
            })?;
            anyhow::ensure!(
                decision_time == now,
                "job {}: dispatch time {} differs from current time {}",
                job_id,
                decision_time,
                now
            );
            let start = now + time_diff;

            let (duration, per_node) = {
                let job = &self.jobs[&job_id];
                (job.duration, job.requested_resources.clone())
            };
            let state = self.states.entry(job_id.clone()).or_default();
            state.start_time = Some(start);
            state.assigned_nodes = nodes.clone();

            if duration == 0 {
                log::debug!("{}: {} dispatched and finished at the same moment", now, job_id);
                if self.first_time_dispatch.is_none() {
                    self.first_time_dispatch = Some(start);
                }
                self.finish_at(&job_id, start)?;
                outcome.dispatched_and_finished += 1;
                continue;
            }

            self.running.push(job_id.clone());
            let real_end_time = start + duration;
            self.time_points.add(real_end_time);
            self.real_ending
                .entry(real_end_time)
                .or_default()
                .push(job_id.clone());

            match self.resource_manager.allocate_job(&job_id, &per_node, &nodes) {
                Ok(()) => {
                    if self.first_time_dispatch.is_none() {
                        self.first_time_dispatch = Some(start);
                    }
                    outcome.dispatched += 1;
                }
                Err(err) => {
                    log::warn!(
                        "{} must be postponed: {}. If this repeats, check the allocation heuristic",
                        job_id,
                        err
                    );
                    self.running.retain(|id| id != &job_id);
                    let now_empty = match self.real_ending.get_mut(&real_end_time) {
                        Some(ids) => {
                            ids.retain(|id| id != &job_id);
                            ids.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        self.real_ending.remove(&real_end_time);
                    }
                    self.states.remove(&job_id);
                    self.queued.push(job_id);
                    outcome.postponed += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Complete every running job whose real ending time is the current
    /// time: free its resources, compute its statistics and emit the output
    /// record. Returns the completed ids.
    pub fn release_ended(&mut self) -> anyhow::Result<Vec<String>> {
        let now = match self.current_time {
            Some(t) => t,
            None => return Ok(vec![]),
        };
        let ending = self.real_ending.remove(&now).unwrap_or_default();
        let mut completed = vec![];
        for id in ending {
            if let Some(pos) = self.running.iter().position(|r| r == &id) {
                self.running.remove(pos);
                self.finish_at(&id, now)?;
                self.resource_manager.release_job(&id)?;
                completed.push(id);
            }
        }
        self.last_run_time = Some(now);
        Ok(completed)
    }

    /// Close the job at `end_time`: statistics, completion rank, output
    /// records. Zero-duration jobs pass their start time, everything else
    /// completes at the current time. The job leaves the active table here.
    fn finish_at(&mut self, id: &str, end_time: Time) -> anyhow::Result<()> {
        let job = self
            .jobs
            .remove(id)
            .with_context(|| format!("finishing unknown job {}", id))?;
        let mut state = self.states.remove(id).unwrap_or_default();
        let start = state
            .start_time
            .with_context(|| format!("finishing job {} that never started", id))?;

        state.end_time = Some(end_time);
        let running_time = end_time - start;
        let waiting_time = start - job.queued_time;
        state.running_time = Some(running_time);
        state.waiting_time = Some(waiting_time);
        let slowdown = if running_time > 0 {
            let raw = (waiting_time + running_time) as f64 / running_time as f64;
            (raw * 100.0).round() / 100.0
        } else if waiting_time > 0 {
            waiting_time as f64
        } else {
            1.0
        };
        state.slowdown = Some(slowdown);
        self.slowdowns.update(slowdown).ok();
        self.wtimes.update(waiting_time as f64).ok();

        anyhow::ensure!(
            self.finished_ids.insert(id.to_string()),
            "job {} completed twice",
            id
        );
        self.finished.push(id.to_string());
        state.end_order = self.finished.len();

        let record = JobRecord { job, state };
        for sink in &mut self.sinks {
            if sink.writer.is_none() {
                let pre_process = sink
                    .pre_process
                    .take()
                    .with_context(|| format!("sink {} restarted", sink.path.display()))?;
                sink.writer = Some(AsyncWriter::spawn(&sink.path, pre_process)?);
            }
            if let Some(writer) = &sink.writer {
                writer.push(record.clone())?;
            }
        }
        Ok(())
    }

    /// Drain and join every output writer.
    pub fn stop_writers(&mut self) -> anyhow::Result<()> {
        for sink in &mut self.sinks {
            if let Some(mut writer) = sink.writer.take() {
                writer.stop()?;
            }
        }
        Ok(())
    }

    pub fn current_time(&self) -> Option<Time> {
        self.current_time
    }

    /// Read-only job table for schedulers.
    pub fn jobs(&self) -> &HashMap<String, Job> {
        &self.jobs
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.resource_manager
    }

    pub fn loaded_len(&self) -> usize {
        self.loaded.len()
    }

    pub fn finished(&self) -> &[String] {
        &self.finished
    }

    pub fn first_time_dispatch(&self) -> Option<Time> {
        self.first_time_dispatch
    }

    pub fn last_run_time(&self) -> Option<Time> {
        self.last_run_time
    }

    pub fn avg_waiting_time(&self) -> f64 {
        self.wtimes.mean().unwrap_or(0.0)
    }

    pub fn avg_slowdown(&self) -> f64 {
        self.slowdowns.mean().unwrap_or(0.0)
    }

    /// One line with the loaded/queued/running/finished counts.
    pub fn simulated_status(&self) -> String {
        format!(
            "Loaded {}, Queued {}, Running {}, and Finished {} Jobs",
            self.loaded.len(),
            self.queued.len(),
            self.running.len(),
            self.finished.len()
        )
    }

    /// Immutable copy of the observable state for monitors.
    pub fn snapshot(&self) -> Snapshot {
        let running = self
            .running
            .iter()
            .filter_map(|id| {
                let job = self.jobs.get(id)?.clone();
                let state = self.states.get(id).cloned().unwrap_or_default();
                Some(JobRecord { job, state })
            })
            .collect();
        Snapshot {
            current_time: self.current_time,
            loaded: self.loaded.len(),
            queued: self.queued.len(),
            running,
            finished: self.finished.len(),
        }
    }
}
