use std::collections::HashMap;

/// Quantity of a single resource type (cores, MB of memory, GPUs, ...).
pub type Amount = u64;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("node {0} is powered off")]
    NodeOff(String),
    #[error(
        "node {node}: requested {requested} {resource}, but only {free} of {capacity} are free"
    )]
    Exhausted {
        node: String,
        resource: String,
        requested: Amount,
        free: Amount,
        capacity: Amount,
    },
    #[error(
        "node {node}: releasing {amount} {resource} with only {used} in use, usage cannot go negative"
    )]
    Underflow {
        node: String,
        resource: String,
        amount: Amount,
        used: Amount,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    On,
    Off,
}

#[derive(Debug, Clone)]
struct Node {
    status: NodeStatus,
    /// Capacity per resource type, constant after construction.
    available: HashMap<String, Amount>,
    /// Current consumption per resource type.
    used: HashMap<String, Amount>,
}

impl Node {
    fn from_group(capacities: &HashMap<String, Amount>) -> Self {
        Self {
            status: NodeStatus::On,
            available: capacities.clone(),
            used: capacities.keys().map(|k| (k.clone(), 0)).collect(),
        }
    }

    fn free(&self, resource: &str) -> Amount {
        let available = self.available.get(resource).copied().unwrap_or(0);
        let used = self.used.get(resource).copied().unwrap_or(0);
        available - used
    }
}

/// The per-node accounting engine: fixed capacities, mutable usage counters.
///
/// All counters are integers. `allocate` either applies the whole request or
/// leaves the node untouched; `release` treats underflow as a fatal
/// accounting bug and reports it without clamping.
pub struct ResourcePool {
    groups: Vec<(String, HashMap<String, Amount>)>,
    node_order: Vec<String>,
    nodes: HashMap<String, Node>,
    resource_types: Vec<String>,
}

impl ResourcePool {
    /// Build the pool from group templates and per-group node counts.
    ///
    /// Nodes are named `<prefix><n>` with `n` starting at 1, following the
    /// order of the `counts` slice.
    pub fn new(
        groups: Vec<(String, HashMap<String, Amount>)>,
        counts: &[(String, usize)],
        node_prefix: &str,
    ) -> anyhow::Result<Self> {
        let mut resource_types: Vec<String> = vec![];
        let mut seen_groups: Vec<&str> = vec![];
        for (name, capacities) in &groups {
            anyhow::ensure!(
                !seen_groups.contains(&name.as_str()),
                "repeated group name: {}",
                name
            );
            seen_groups.push(name);
            for resource in capacities.keys() {
                if !resource_types.contains(resource) {
                    resource_types.push(resource.clone());
                }
            }
        }

        let mut node_order = vec![];
        let mut nodes = HashMap::new();
        let mut j = 0;
        for (group_name, q) in counts {
            let capacities = groups
                .iter()
                .find(|(name, _)| name == group_name)
                .map(|(_, c)| c)
                .ok_or_else(|| anyhow::anyhow!("node count refers to unknown group {}", group_name))?;
            for _ in 0..*q {
                j += 1;
                let node_name = format!("{}{}", node_prefix, j);
                node_order.push(node_name.clone());
                nodes.insert(node_name, Node::from_group(capacities));
            }
        }

        Ok(Self {
            groups,
            node_order,
            nodes,
            resource_types,
        })
    }

    /// Consume `request` on `node`. Nothing is mutated on failure.
    pub fn allocate(
        &mut self,
        node_name: &str,
        request: &HashMap<String, Amount>,
    ) -> Result<(), PoolError> {
        let node = self
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| PoolError::UnknownNode(node_name.to_string()))?;
        if node.status == NodeStatus::Off {
            return Err(PoolError::NodeOff(node_name.to_string()));
        }
        for (resource, amount) in request {
            let free = node.free(resource);
            if *amount > free {
                return Err(PoolError::Exhausted {
                    node: node_name.to_string(),
                    resource: resource.clone(),
                    requested: *amount,
                    free,
                    capacity: node.available.get(resource).copied().unwrap_or(0),
                });
            }
        }
        for (resource, amount) in request {
            *node.used.entry(resource.clone()).or_insert(0) += amount;
        }
        Ok(())
    }

    /// Return `request` on `node`. Succeeds on OFF nodes so running work can
    /// drain; underflow is an accounting bug.
    pub fn release(
        &mut self,
        node_name: &str,
        request: &HashMap<String, Amount>,
    ) -> Result<(), PoolError> {
        let node = self
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| PoolError::UnknownNode(node_name.to_string()))?;
        for (resource, amount) in request {
            let used = node.used.get(resource).copied().unwrap_or(0);
            if *amount > used {
                return Err(PoolError::Underflow {
                    node: node_name.to_string(),
                    resource: resource.clone(),
                    amount: *amount,
                    used,
                });
            }
        }
        for (resource, amount) in request {
            *node.used.entry(resource.clone()).or_insert(0) -= amount;
        }
        Ok(())
    }

    /// Free resources per ON node, in node order. OFF nodes are skipped.
    pub fn availability(&self) -> HashMap<String, HashMap<String, Amount>> {
        self.node_order
            .iter()
            .filter_map(|name| {
                let node = &self.nodes[name];
                if node.status == NodeStatus::Off {
                    return None;
                }
                let free = self
                    .resource_types
                    .iter()
                    .map(|r| (r.clone(), node.free(r)))
                    .collect();
                Some((name.clone(), free))
            })
            .collect()
    }

    /// One-line usage summary, one percentage per resource type.
    pub fn usage(&self) -> String {
        let mut parts = vec![];
        for resource in &self.resource_types {
            let mut available = 0;
            let mut used = 0;
            for node in self.nodes.values() {
                available += node.available.get(resource).copied().unwrap_or(0);
                used += node.used.get(resource).copied().unwrap_or(0);
            }
            if available > 0 {
                parts.push(format!(
                    "{}: {:.2}%",
                    resource,
                    used as f64 / available as f64 * 100.0
                ));
            }
        }
        format!("System usage: {}", parts.join(", "))
    }

    /// Total capacity of the system per resource type.
    pub fn capacity(&self) -> HashMap<String, Amount> {
        let mut totals: HashMap<String, Amount> = self
            .resource_types
            .iter()
            .map(|r| (r.clone(), 0))
            .collect();
        for node in self.nodes.values() {
            for (resource, amount) in &node.available {
                *totals.entry(resource.clone()).or_insert(0) += amount;
            }
        }
        totals
    }

    pub fn set_status(&mut self, node_name: &str, status: NodeStatus) -> Result<(), PoolError> {
        let node = self
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| PoolError::UnknownNode(node_name.to_string()))?;
        node.status = status;
        Ok(())
    }

    pub fn resource_types(&self) -> &[String] {
        &self.resource_types
    }

    pub fn node_names(&self) -> &[String] {
        &self.node_order
    }

    fn group_capacities(&self) -> &[(String, HashMap<String, Amount>)] {
        &self.groups
    }
}

/// Tracks which nodes every running job occupies and drives the pool.
///
/// A job assigned the same node more than once (multi-unit placement) has its
/// per-node request multiplied by the multiplicity before the claim is
/// recorded.
pub struct ResourceManager {
    pool: ResourcePool,
    active: HashMap<String, HashMap<String, HashMap<String, Amount>>>,
}

impl ResourceManager {
    pub fn new(pool: ResourcePool) -> Self {
        Self {
            pool,
            active: HashMap::new(),
        }
    }

    /// Claim resources for `job_id` on `assigned_nodes` (repetitions allowed).
    /// If any node refuses, every allocation already applied by this call is
    /// rolled back and the error is returned.
    pub fn allocate_job(
        &mut self,
        job_id: &str,
        per_node: &HashMap<String, Amount>,
        assigned_nodes: &[String],
    ) -> Result<(), PoolError> {
        log::debug!("allocating job {} on nodes {}", job_id, assigned_nodes.join(", "));
        let mut multiplicity: Vec<(String, Amount)> = vec![];
        for node in assigned_nodes {
            match multiplicity.iter_mut().find(|(n, _)| n == node) {
                Some((_, q)) => *q += 1,
                None => multiplicity.push((node.clone(), 1)),
            }
        }

        let claim: HashMap<String, HashMap<String, Amount>> = multiplicity
            .iter()
            .map(|(node, q)| {
                let scaled = per_node.iter().map(|(r, v)| (r.clone(), v * q)).collect();
                (node.clone(), scaled)
            })
            .collect();

        let mut done: Vec<&String> = vec![];
        for (node, request) in &claim {
            if let Err(err) = self.pool.allocate(node, request) {
                for undone in done {
                    // Undoing a just-applied allocation cannot underflow.
                    let _ = self.pool.release(undone, &claim[undone]);
                }
                return Err(err);
            }
            done.push(node);
        }

        self.active.insert(job_id.to_string(), claim);
        Ok(())
    }

    /// Drop the claim of `job_id` and release every node it held.
    pub fn release_job(&mut self, job_id: &str) -> anyhow::Result<()> {
        let claim = self
            .active
            .remove(job_id)
            .ok_or_else(|| anyhow::anyhow!("job {} has no active allocation", job_id))?;
        for (node, request) in &claim {
            self.pool.release(node, request)?;
        }
        Ok(())
    }

    pub fn availability(&self) -> HashMap<String, HashMap<String, Amount>> {
        self.pool.availability()
    }

    pub fn usage(&self) -> String {
        self.pool.usage()
    }

    pub fn capacity(&self) -> HashMap<String, Amount> {
        self.pool.capacity()
    }

    pub fn resource_types(&self) -> &[String] {
        self.pool.resource_types()
    }

    pub fn node_names(&self) -> &[String] {
        self.pool.node_names()
    }

    /// Per-group capacities, used by the factory to derive node counts from
    /// raw per-job totals.
    pub fn groups_available_resource(&self) -> Vec<(String, HashMap<String, Amount>)> {
        self.pool.group_capacities().to_vec()
    }

    pub fn set_node_status(&mut self, node: &str, status: NodeStatus) -> Result<(), PoolError> {
        self.pool.set_status(node, status)
    }
}
