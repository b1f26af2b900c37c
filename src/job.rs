use std::collections::HashMap;

use crate::resources::{Amount, ResourceManager};

/// Value of a raw workload field before and after casting.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Text(String),
    Resources(HashMap<String, Amount>),
}

impl FieldValue {
    pub fn as_int(&self) -> anyhow::Result<i64> {
        match self {
            FieldValue::Int(v) => Ok(*v),
            FieldValue::Float(v) => Ok(*v as i64),
            FieldValue::Text(v) => Ok(v.parse()?),
            FieldValue::Resources(_) => Err(anyhow::anyhow!("resource map used as integer")),
        }
    }

    pub fn as_float(&self) -> anyhow::Result<f64> {
        match self {
            FieldValue::Int(v) => Ok(*v as f64),
            FieldValue::Float(v) => Ok(*v),
            FieldValue::Text(v) => Ok(v.parse()?),
            FieldValue::Resources(_) => Err(anyhow::anyhow!("resource map used as float")),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Text(v) => write!(f, "{}", v),
            FieldValue::Resources(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let parts: Vec<String> =
                    keys.iter().map(|k| format!("{}={}", k, map[*k])).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

/// Raw attribute map handed to the factory, keyed by field name.
pub type RawJob = HashMap<String, FieldValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Float,
    Text,
}

impl FieldKind {
    fn cast(&self, value: &FieldValue) -> anyhow::Result<FieldValue> {
        Ok(match self {
            FieldKind::Int => FieldValue::Int(value.as_int()?),
            FieldKind::Float => FieldValue::Float(value.as_float()?),
            FieldKind::Text => FieldValue::Text(value.to_string()),
        })
    }
}

/// Descriptor of a user attribute attached to every job at construction.
#[derive(Debug, Clone)]
pub struct AttributeType {
    pub name: String,
    pub kind: FieldKind,
    pub optional: bool,
}

impl AttributeType {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            optional: false,
        }
    }

    pub fn optional(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            optional: true,
        }
    }
}

/// Immutable intake record of a workload job.
///
/// Lifecycle fields (start/end time, assigned nodes, ...) live in the
/// kernel's per-job dispatch state, not here, so schedulers always observe
/// the job exactly as admitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub queued_time: i64,
    /// Real runtime in seconds.
    pub duration: i64,
    /// User-declared runtime upper bound, used by backfill-style policies.
    pub expected_duration: i64,
    pub requested_nodes: usize,
    /// Request per assigned node unit.
    pub requested_resources: HashMap<String, Amount>,
    /// User attributes declared at factory construction; `None` when an
    /// optional attribute was absent from the raw record.
    pub extras: HashMap<String, Option<FieldValue>>,
}

const INTRINSIC_FIELDS: [&str; 6] = [
    "id",
    "queued_time",
    "duration",
    "expected_duration",
    "requested_nodes",
    "requested_resources",
];

/// Validates raw attribute maps and constructs [`Job`] records.
pub struct JobFactory {
    attrs: Vec<AttributeType>,
    mapper: HashMap<String, String>,
    group_resources: Vec<(String, HashMap<String, Amount>)>,
    system_resources: Vec<String>,
    missing_resources: Vec<String>,
    checked: bool,
}

impl JobFactory {
    /// `mapper` renames raw field names to canonical ones before any check.
    pub fn new(
        resource_manager: &ResourceManager,
        attrs: Vec<AttributeType>,
        mapper: HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let mut names: Vec<&str> = INTRINSIC_FIELDS.to_vec();
        for attr in &attrs {
            anyhow::ensure!(
                !names.contains(&attr.name.as_str()),
                "attribute name {} already set, names must be unique",
                attr.name
            );
            names.push(&attr.name);
        }
        Ok(Self {
            attrs,
            mapper,
            group_resources: resource_manager.groups_available_resource(),
            system_resources: resource_manager.resource_types().to_vec(),
            missing_resources: vec![],
            checked: false,
        })
    }

    /// Build a job from a raw attribute map.
    pub fn build(&mut self, mut raw: RawJob) -> anyhow::Result<Job> {
        for (old, new) in &self.mapper {
            let value = raw
                .remove(old)
                .ok_or_else(|| anyhow::anyhow!("missing field {} (renamed to {})", old, new))?;
            raw.insert(new.clone(), value);
        }

        self.derive_request(&mut raw)?;

        let mut missing: Vec<&str> = vec![];
        for name in INTRINSIC_FIELDS {
            if !raw.contains_key(name) {
                missing.push(name);
            }
        }
        for attr in &self.attrs {
            if !attr.optional && !raw.contains_key(&attr.name) {
                missing.push(&attr.name);
            }
        }
        anyhow::ensure!(
            missing.is_empty(),
            "missing attributes: {}",
            missing.join(", ")
        );

        let mut requested_resources = match raw.get("requested_resources") {
            Some(FieldValue::Resources(map)) => map.clone(),
            Some(other) => anyhow::bail!("requested_resources is not a resource map: {}", other),
            None => unreachable!("presence checked above"),
        };

        if !self.checked {
            self.check_requested_resources(&requested_resources)?;
        }
        for resource in &self.missing_resources {
            requested_resources.entry(resource.clone()).or_insert(0);
        }

        let id = raw["id"].to_string();
        let queued_time = raw["queued_time"].as_int()?;
        let duration = raw["duration"].as_int()?;
        let expected_duration = raw["expected_duration"].as_int()?;
        let requested_nodes = raw["requested_nodes"].as_int()?;
        anyhow::ensure!(duration >= 0, "job {}: negative duration {}", id, duration);
        anyhow::ensure!(
            requested_nodes > 0,
            "job {}: requested_nodes must be positive, got {}",
            id,
            requested_nodes
        );

        let mut extras = HashMap::new();
        for attr in &self.attrs {
            let value = match raw.get(&attr.name) {
                Some(v) => Some(attr.kind.cast(v).map_err(|e| {
                    anyhow::anyhow!("job {}: cannot cast attribute {}: {}", id, attr.name, e)
                })?),
                None => None,
            };
            extras.insert(attr.name.clone(), value);
        }

        Ok(Job {
            id,
            queued_time,
            duration,
            expected_duration,
            requested_nodes: requested_nodes as usize,
            requested_resources,
            extras,
        })
    }

    /// Derive `requested_nodes` and the per-node request from raw resource
    /// totals when the record does not carry them explicitly.
    fn derive_request(&self, raw: &mut RawJob) -> anyhow::Result<()> {
        if !raw.contains_key("requested_nodes") {
            let mut partition: u64 = 0;
            for resource in &self.system_resources {
                let total = match self.raw_total(raw, resource)? {
                    Some(total) => total,
                    None => continue,
                };
                let max_capacity = self
                    .group_resources
                    .iter()
                    .map(|(_, caps)| caps.get(resource).copied().unwrap_or(0))
                    .max()
                    .unwrap_or(0);
                if max_capacity == 0 {
                    continue;
                }
                partition = partition.max((total + max_capacity - 1) / max_capacity);
            }
            anyhow::ensure!(
                partition > 0,
                "job {:?} requests no resources at all",
                raw.get("id").map(|v| v.to_string())
            );
            raw.insert(
                "requested_nodes".to_string(),
                FieldValue::Int(partition as i64),
            );
        }
        if !raw.contains_key("requested_resources") {
            let partition = raw["requested_nodes"].as_int()? as u64;
            let mut per_node = HashMap::new();
            for resource in &self.system_resources {
                // absent totals are left to the coverage check
                if let Some(total) = self.raw_total(raw, resource)? {
                    per_node.insert(resource.clone(), total / partition);
                }
            }
            raw.insert(
                "requested_resources".to_string(),
                FieldValue::Resources(per_node),
            );
        }
        Ok(())
    }

    fn raw_total(&self, raw: &RawJob, resource: &str) -> anyhow::Result<Option<Amount>> {
        let total = match raw.get(resource) {
            Some(value) => value.as_int()?,
            None => return Ok(None),
        };
        anyhow::ensure!(
            total >= 0,
            "job {:?}: the request for {} is not feasible ({}), accepted values are >= 0",
            raw.get("id").map(|v| v.to_string()),
            resource,
            total
        );
        Ok(Some(total as Amount))
    }

    /// First-job check: the request must cover every system resource type.
    /// Missing `core` or `mem` halts the run; other missing types are warned
    /// about once and zero-filled on every subsequent job.
    fn check_requested_resources(
        &mut self,
        requested: &HashMap<String, Amount>,
    ) -> anyhow::Result<()> {
        let missing: Vec<String> = self
            .system_resources
            .iter()
            .filter(|r| !requested.contains_key(*r))
            .cloned()
            .collect();
        if !missing.is_empty() {
            for mandatory in ["core", "mem"] {
                anyhow::ensure!(
                    !missing.iter().any(|r| r == mandatory),
                    "mandatory resource {} is missing from the job requests, the simulation will stop",
                    mandatory
                );
            }
            log::warn!(
                "resources {} not included in the parsed requests, assigning 0 from now on",
                missing.join(", ")
            );
            self.missing_resources = missing;
        }
        self.checked = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourcePool;

    fn manager(groups: &[(&str, &[(&str, Amount)])], count: usize) -> ResourceManager {
        let groups: Vec<(String, HashMap<String, Amount>)> = groups
            .iter()
            .map(|(name, caps)| {
                (
                    name.to_string(),
                    caps.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                )
            })
            .collect();
        let counts: Vec<(String, usize)> = groups
            .iter()
            .map(|(name, _)| (name.clone(), count))
            .collect();
        ResourceManager::new(ResourcePool::new(groups, &counts, "node_").unwrap())
    }

    fn raw(pairs: &[(&str, FieldValue)]) -> RawJob {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn swf_like(id: i64, submit: i64, duration: i64, core: i64, mem: i64) -> RawJob {
        raw(&[
            ("job_number", FieldValue::Int(id)),
            ("submit_time", FieldValue::Int(submit)),
            ("duration", FieldValue::Int(duration)),
            ("requested_time", FieldValue::Int(duration + 10)),
            ("requested_number_processors", FieldValue::Int(core)),
            ("requested_memory", FieldValue::Int(mem)),
        ])
    }

    fn swf_mapper() -> HashMap<String, String> {
        [
            ("job_number", "id"),
            ("submit_time", "queued_time"),
            ("requested_time", "expected_duration"),
            ("requested_number_processors", "core"),
            ("requested_memory", "mem"),
        ]
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
    }

    fn swf_attrs() -> Vec<AttributeType> {
        vec![
            AttributeType::new("core", FieldKind::Int),
            AttributeType::new("mem", FieldKind::Int),
            AttributeType::optional("user_id", FieldKind::Int),
        ]
    }

    #[test]
    fn test_factory_builds_from_totals() {
        let rm = manager(&[("g0", &[("core", 4), ("mem", 8)])], 2);
        let mut factory = JobFactory::new(&rm, swf_attrs(), swf_mapper()).unwrap();
        let job = factory.build(swf_like(7, 100, 60, 6, 8)).unwrap();
        assert_eq!(job.id, "7");
        assert_eq!(job.queued_time, 100);
        assert_eq!(job.duration, 60);
        assert_eq!(job.expected_duration, 70);
        // 6 cores over 4-core nodes: ceil(6/4) = 2 nodes, 3 cores each
        assert_eq!(job.requested_nodes, 2);
        assert_eq!(job.requested_resources["core"], 3);
        assert_eq!(job.requested_resources["mem"], 4);
        assert_eq!(job.extras["user_id"], None);
    }

    #[test]
    fn test_factory_small_request_rounds_up_to_one_node() {
        let rm = manager(&[("g0", &[("core", 4), ("mem", 8)])], 1);
        let mut factory = JobFactory::new(&rm, swf_attrs(), swf_mapper()).unwrap();
        let job = factory.build(swf_like(1, 0, 5, 1, 1)).unwrap();
        assert_eq!(job.requested_nodes, 1);
        assert_eq!(job.requested_resources["core"], 1);
    }

    #[test]
    fn test_factory_missing_mandatory_field_is_fatal() {
        let rm = manager(&[("g0", &[("core", 4), ("mem", 8)])], 1);
        let mut factory = JobFactory::new(&rm, swf_attrs(), swf_mapper()).unwrap();
        let mut record = swf_like(1, 0, 5, 1, 1);
        record.remove("duration");
        let err = factory.build(record).unwrap_err();
        assert!(err.to_string().contains("duration"), "{}", err);
    }

    #[test]
    fn test_factory_duplicate_attribute_rejected() {
        let rm = manager(&[("g0", &[("core", 4), ("mem", 8)])], 1);
        let attrs = vec![
            AttributeType::new("core", FieldKind::Int),
            AttributeType::new("core", FieldKind::Int),
        ];
        assert!(JobFactory::new(&rm, attrs, HashMap::new()).is_err());
    }

    fn explicit_request(mut record: RawJob, resources: &[(&str, Amount)]) -> RawJob {
        record.insert("requested_nodes".to_string(), FieldValue::Int(1));
        record.insert(
            "requested_resources".to_string(),
            FieldValue::Resources(
                resources
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
            ),
        );
        record
    }

    #[test]
    fn test_factory_missing_optional_resource_zero_filled() {
        // system declares gpu, trace provides only core and mem
        let rm = manager(&[("g0", &[("core", 4), ("mem", 8), ("gpu", 0)])], 1);
        let mut factory = JobFactory::new(&rm, swf_attrs(), swf_mapper()).unwrap();
        let record = explicit_request(swf_like(1, 0, 5, 2, 4), &[("core", 2), ("mem", 4)]);
        let job = factory.build(record).unwrap();
        assert_eq!(job.requested_resources["gpu"], 0);
        // subsequent jobs are silently zero-filled too
        let record = explicit_request(swf_like(2, 1, 5, 2, 4), &[("core", 2), ("mem", 4)]);
        assert_eq!(factory.build(record).unwrap().requested_resources["gpu"], 0);
    }

    #[test]
    fn test_factory_missing_mandatory_resource_is_fatal() {
        let rm = manager(&[("g0", &[("core", 4), ("mem", 8)])], 1);
        let mut factory = JobFactory::new(&rm, swf_attrs(), swf_mapper()).unwrap();
        let record = explicit_request(swf_like(1, 0, 5, 2, 4), &[("core", 2)]);
        let err = factory.build(record).unwrap_err();
        assert!(err.to_string().contains("mem"), "{}", err);
    }

    #[test]
    fn test_factory_empty_request_is_fatal() {
        let rm = manager(&[("g0", &[("core", 4), ("mem", 8)])], 1);
        let mut factory = JobFactory::new(&rm, swf_attrs(), swf_mapper()).unwrap();
        let err = factory.build(swf_like(1, 0, 5, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("no resources"), "{}", err);
    }

    #[test]
    fn test_factory_is_deterministic() {
        let rm = manager(&[("g0", &[("core", 4), ("mem", 8)])], 2);
        let mut factory = JobFactory::new(&rm, swf_attrs(), swf_mapper()).unwrap();
        let a = factory.build(swf_like(3, 50, 30, 4, 8)).unwrap();
        let b = factory.build(swf_like(3, 50, 30, 4, 8)).unwrap();
        assert_eq!(a, b);
    }
}
