use std::collections::HashMap;

use crate::job::Job;
use crate::kernel::{Decision, Time};
use crate::resources::{Amount, ResourceManager};

/// Dispatching policy invoked by the driver at every time point.
///
/// Decisions that carry nodes must be timed at `current_time`; the kernel
/// accounts for any dispatch processing cost on its own. The scheduler sees
/// a read-only job table and must not assume its decisions are applied: the
/// kernel validates each one and may re-queue the job, so the same input can
/// come back on a later call.
pub trait Scheduler {
    fn schedule(
        &mut self,
        current_time: Time,
        jobs: &HashMap<String, Job>,
        eligible: &[String],
        resources: &ResourceManager,
    ) -> Vec<Decision>;
}

#[derive(Debug, Clone)]
pub enum PolicyKind {
    /// Jobs are served strictly in queue order; the head of the queue blocks
    /// everything behind it until it fits.
    FifoFirstFit,
    /// Jobs are served shortest expected duration first; jobs that do not
    /// fit are skipped, not blocking.
    SjfFirstFit,
}

impl PolicyKind {
    pub fn from(policy: &str) -> anyhow::Result<Self> {
        match policy {
            "fifo-first-fit" => Ok(PolicyKind::FifoFirstFit),
            "sjf-first-fit" => Ok(PolicyKind::SjfFirstFit),
            _ => Err(anyhow::anyhow!("unknown policy: {}", policy)),
        }
    }

    pub fn all() -> Vec<PolicyKind> {
        vec![PolicyKind::FifoFirstFit, PolicyKind::SjfFirstFit]
    }

    pub fn build(self) -> Box<dyn Scheduler> {
        Box::new(FirstFitScheduler { policy: self })
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                PolicyKind::FifoFirstFit => "fifo-first-fit",
                PolicyKind::SjfFirstFit => "sjf-first-fit",
            }
        )
    }
}

/// List scheduler over a first-fit allocator: order the eligible jobs, then
/// walk the nodes in system order packing as many units per node as fit.
pub struct FirstFitScheduler {
    policy: PolicyKind,
}

impl Scheduler for FirstFitScheduler {
    fn schedule(
        &mut self,
        current_time: Time,
        jobs: &HashMap<String, Job>,
        eligible: &[String],
        resources: &ResourceManager,
    ) -> Vec<Decision> {
        let node_order = resources.node_names().to_vec();
        let mut availability = resources.availability();

        let order: Vec<&String> = match self.policy {
            PolicyKind::FifoFirstFit => eligible.iter().collect(),
            PolicyKind::SjfFirstFit => {
                let mut sorted: Vec<&String> = eligible.iter().collect();
                // stable sort: admission order breaks ties
                sorted.sort_by_key(|id| {
                    jobs.get(*id).map(|j| j.expected_duration).unwrap_or(i64::MAX)
                });
                sorted
            }
        };
        let strict = matches!(self.policy, PolicyKind::FifoFirstFit);

        let mut decisions = vec![];
        let mut blocked = false;
        for id in order {
            let job = match jobs.get(id) {
                Some(job) => job,
                None => continue,
            };
            if blocked {
                decisions.push(requeue(id));
                continue;
            }
            match first_fit(&mut availability, &node_order, job) {
                Some(nodes) => decisions.push(Decision {
                    start_time: Some(current_time),
                    job_id: id.clone(),
                    nodes,
                }),
                None => {
                    decisions.push(requeue(id));
                    if strict {
                        blocked = true;
                    }
                }
            }
        }
        decisions
    }
}

fn requeue(id: &str) -> Decision {
    Decision {
        start_time: None,
        job_id: id.to_string(),
        nodes: vec![],
    }
}

/// Place `job.requested_nodes` units on the first nodes they fit, possibly
/// several units per node (the returned list repeats the node id then).
/// The availability map is debited so later jobs in the same batch see the
/// claim; a job that does not fit entirely leaves it untouched.
fn first_fit(
    availability: &mut HashMap<String, HashMap<String, Amount>>,
    node_order: &[String],
    job: &Job,
) -> Option<Vec<String>> {
    let mut assigned: Vec<String> = Vec::with_capacity(job.requested_nodes);
    let mut remaining = job.requested_nodes;
    for node in node_order {
        let free = match availability.get_mut(node) {
            Some(free) => free,
            None => continue,
        };
        let mut units = remaining;
        for (resource, request) in &job.requested_resources {
            if *request == 0 {
                continue;
            }
            let available = free.get(resource).copied().unwrap_or(0);
            units = units.min((available / request) as usize);
        }
        if units == 0 {
            continue;
        }
        for (resource, request) in &job.requested_resources {
            if let Some(available) = free.get_mut(resource) {
                *available -= request * units as Amount;
            }
        }
        assigned.extend(std::iter::repeat(node.clone()).take(units));
        remaining -= units;
        if remaining == 0 {
            return Some(assigned);
        }
    }

    // not enough capacity anywhere: credit the provisional debits back
    for node in &assigned {
        if let Some(free) = availability.get_mut(node) {
            for (resource, request) in &job.requested_resources {
                if let Some(available) = free.get_mut(resource) {
                    *available += request;
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourcePool;

    fn manager(core: Amount, mem: Amount, nodes: usize) -> ResourceManager {
        let groups = vec![(
            "g0".to_string(),
            [("core".to_string(), core), ("mem".to_string(), mem)]
                .into_iter()
                .collect(),
        )];
        ResourceManager::new(
            ResourcePool::new(groups, &[("g0".to_string(), nodes)], "node_").unwrap(),
        )
    }

    fn job(id: &str, expected: i64, nodes: usize, core: Amount, mem: Amount) -> Job {
        Job {
            id: id.to_string(),
            queued_time: 0,
            duration: expected,
            expected_duration: expected,
            requested_nodes: nodes,
            requested_resources: [("core".to_string(), core), ("mem".to_string(), mem)]
                .into_iter()
                .collect(),
            extras: HashMap::new(),
        }
    }

    fn table(jobs: Vec<Job>) -> HashMap<String, Job> {
        jobs.into_iter().map(|j| (j.id.clone(), j)).collect()
    }

    #[test]
    fn test_policy_names_round_trip() {
        for policy in PolicyKind::all() {
            let name = policy.to_string();
            assert!(PolicyKind::from(&name).is_ok(), "{}", name);
        }
        assert!(PolicyKind::from("best-effort").is_err());
    }

    #[test]
    fn test_first_fit_packs_multiple_units_per_node() {
        let rm = manager(4, 8, 2);
        let mut availability = rm.availability();
        let job = job("a", 10, 3, 1, 2);
        let nodes = first_fit(&mut availability, rm.node_names(), &job).unwrap();
        // three one-core units: all on node_1
        assert_eq!(nodes, vec!["node_1".to_string(); 3]);
        assert_eq!(availability["node_1"]["core"], 1);
        assert_eq!(availability["node_1"]["mem"], 2);
    }

    #[test]
    fn test_first_fit_spills_to_later_nodes() {
        let rm = manager(2, 4, 3);
        let mut availability = rm.availability();
        let job = job("a", 10, 3, 2, 2);
        let nodes = first_fit(&mut availability, rm.node_names(), &job).unwrap();
        assert_eq!(
            nodes,
            vec![
                "node_1".to_string(),
                "node_2".to_string(),
                "node_3".to_string()
            ]
        );
    }

    #[test]
    fn test_first_fit_rolls_back_on_shortage() {
        let rm = manager(2, 4, 2);
        let mut availability = rm.availability();
        let job = job("a", 10, 3, 2, 2);
        assert!(first_fit(&mut availability, rm.node_names(), &job).is_none());
        assert_eq!(availability["node_1"]["core"], 2);
        assert_eq!(availability["node_2"]["core"], 2);
    }

    #[test]
    fn test_fifo_blocks_behind_queue_head() {
        let mut rm = manager(4, 8, 1);
        let jobs = table(vec![job("big", 10, 1, 4, 8), job("small", 1, 1, 1, 1)]);
        let mut scheduler = FirstFitScheduler {
            policy: PolicyKind::FifoFirstFit,
        };
        // the full node is taken: big does not fit, small must not leapfrog
        rm.allocate_job(
            "running",
            &[("core".to_string(), 4), ("mem".to_string(), 8)]
                .into_iter()
                .collect(),
            &["node_1".to_string()],
        )
        .unwrap();
        let decisions = scheduler.schedule(
            0,
            &jobs,
            &["big".to_string(), "small".to_string()],
            &rm,
        );
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|d| d.nodes.is_empty()));
    }

    #[test]
    fn test_fifo_dispatches_in_queue_order() {
        let rm = manager(4, 8, 1);
        let jobs = table(vec![job("a", 5, 1, 2, 4), job("b", 1, 1, 2, 4)]);
        let mut scheduler = FirstFitScheduler {
            policy: PolicyKind::FifoFirstFit,
        };
        let decisions = scheduler.schedule(0, &jobs, &["a".to_string(), "b".to_string()], &rm);
        assert_eq!(decisions[0].job_id, "a");
        assert_eq!(decisions[1].job_id, "b");
        assert!(decisions.iter().all(|d| !d.nodes.is_empty()));
    }

    #[test]
    fn test_sjf_orders_by_expected_duration() {
        let rm = manager(4, 8, 1);
        let jobs = table(vec![job("slow", 100, 1, 2, 4), job("fast", 1, 1, 2, 4)]);
        let mut scheduler = FirstFitScheduler {
            policy: PolicyKind::SjfFirstFit,
        };
        let decisions =
            scheduler.schedule(0, &jobs, &["slow".to_string(), "fast".to_string()], &rm);
        assert_eq!(decisions[0].job_id, "fast");
        assert_eq!(decisions[1].job_id, "slow");
    }

    #[test]
    fn test_sjf_skips_jobs_that_do_not_fit() {
        let rm = manager(4, 8, 1);
        let jobs = table(vec![job("wide", 1, 2, 4, 8), job("narrow", 5, 1, 2, 4)]);
        let mut scheduler = FirstFitScheduler {
            policy: PolicyKind::SjfFirstFit,
        };
        let decisions =
            scheduler.schedule(0, &jobs, &["wide".to_string(), "narrow".to_string()], &rm);
        let wide = decisions.iter().find(|d| d.job_id == "wide").unwrap();
        let narrow = decisions.iter().find(|d| d.job_id == "narrow").unwrap();
        assert!(wide.nodes.is_empty());
        assert!(!narrow.nodes.is_empty());
    }
}
