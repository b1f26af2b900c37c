use std::collections::HashMap;

use crate::job::FieldValue;
use crate::kernel::JobRecord;
use crate::resources::Amount;
use crate::writer::PreProcess;

/// How a resolved attribute is rendered into the output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caster {
    /// Plain text.
    Text,
    /// Epoch seconds as `YYYY-mm-dd HH:MM:SS`.
    Timestamp,
    /// A number of seconds as `H:MM:SS`.
    Elapsed,
    /// Node ids with the node prefix stripped, comma separated.
    NodeList,
    /// Assigned nodes with the per-node request, `<n>;r1;r2#...#`.
    NodeResources,
}

impl Caster {
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        match name {
            "str_" => Ok(Caster::Text),
            "str_datetime" => Ok(Caster::Timestamp),
            "str_time" => Ok(Caster::Elapsed),
            "str_nodes" => Ok(Caster::NodeList),
            "str_resources" => Ok(Caster::NodeResources),
            _ => Err(anyhow::anyhow!("unknown output caster: {}", name)),
        }
    }
}

/// One template attribute: the record paths it reads and its caster.
#[derive(Debug, Clone)]
pub struct AttributeSpec {
    pub sources: Vec<String>,
    pub caster: Caster,
}

/// An output template: a format string with `{name}` placeholders plus the
/// attribute table the placeholders draw from.
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub format: String,
    pub attributes: Vec<(String, AttributeSpec)>,
}

impl OutputSpec {
    pub fn default_scheduling() -> Self {
        Self {
            format: "{end_time};{id};{queued_time};{start_time};{waiting_time};{running_time};{slowdown};{nodes}".to_string(),
            attributes: vec![(
                "nodes".to_string(),
                AttributeSpec {
                    sources: vec!["assigned_nodes".to_string()],
                    caster: Caster::NodeList,
                },
            )],
        }
    }

    pub fn default_pprint() -> Self {
        Self {
            format: "{id};{queued_time};{start_time};{end_time};{waiting_time};{running_time};{slowdown};{end_order}".to_string(),
            attributes: vec![],
        }
    }
}

/// System-wide rendering context shared by every template.
#[derive(Debug, Clone)]
pub struct OutputContext {
    pub node_prefix: String,
    pub resource_order: Vec<String>,
}

#[derive(Debug, Clone)]
enum Resolved {
    Int(i64),
    Float(f64),
    Text(String),
    Nodes(Vec<String>),
    Resources(HashMap<String, Amount>),
    Missing,
}

/// Look up a dotted attribute path on a finished-job record. Unknown paths
/// resolve to `Missing`, never to an error.
fn resolve(record: &JobRecord, path: &str) -> Resolved {
    let (root, rest) = match path.split_once('.') {
        Some((root, rest)) => (root, Some(rest)),
        None => (path, None),
    };
    let value = match root {
        "id" => Resolved::Text(record.job.id.clone()),
        "queued_time" => Resolved::Int(record.job.queued_time),
        "duration" => Resolved::Int(record.job.duration),
        "expected_duration" => Resolved::Int(record.job.expected_duration),
        "requested_nodes" => Resolved::Int(record.job.requested_nodes as i64),
        "requested_resources" => Resolved::Resources(record.job.requested_resources.clone()),
        "start_time" => opt_int(record.state.start_time),
        "end_time" => opt_int(record.state.end_time),
        "running_time" => opt_int(record.state.running_time),
        "waiting_time" => opt_int(record.state.waiting_time),
        "slowdown" => match record.state.slowdown {
            Some(v) => Resolved::Float(v),
            None => Resolved::Missing,
        },
        "end_order" => Resolved::Int(record.state.end_order as i64),
        "assigned_nodes" => Resolved::Nodes(record.state.assigned_nodes.clone()),
        name => match record.job.extras.get(name) {
            Some(Some(FieldValue::Int(v))) => Resolved::Int(*v),
            Some(Some(FieldValue::Float(v))) => Resolved::Float(*v),
            Some(Some(FieldValue::Text(v))) => Resolved::Text(v.clone()),
            Some(Some(FieldValue::Resources(map))) => Resolved::Resources(map.clone()),
            _ => Resolved::Missing,
        },
    };
    match (rest, value) {
        (None, value) => value,
        (Some(key), Resolved::Resources(map)) => map
            .get(key)
            .map(|v| Resolved::Int(*v as i64))
            .unwrap_or(Resolved::Missing),
        (Some(_), _) => Resolved::Missing,
    }
}

fn opt_int(value: Option<i64>) -> Resolved {
    value.map(Resolved::Int).unwrap_or(Resolved::Missing)
}

fn plain(value: &Resolved) -> String {
    match value {
        Resolved::Int(v) => v.to_string(),
        Resolved::Float(v) => v.to_string(),
        Resolved::Text(v) => v.clone(),
        Resolved::Nodes(nodes) => nodes.join(","),
        Resolved::Resources(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys.iter()
                .map(|k| format!("{}={}", k, map[*k]))
                .collect::<Vec<_>>()
                .join(",")
        }
        Resolved::Missing => "NA".to_string(),
    }
}

fn strip_prefix<'a>(node: &'a str, prefix: &str) -> &'a str {
    node.strip_prefix(prefix).unwrap_or(node)
}

fn apply(caster: Caster, values: &[Resolved], ctx: &OutputContext) -> String {
    let missing = Resolved::Missing;
    let first = values.first().unwrap_or(&missing);
    match caster {
        Caster::Text => plain(first),
        Caster::Timestamp => match first {
            Resolved::Int(secs) => match chrono::DateTime::from_timestamp(*secs, 0) {
                Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
                None => "NA".to_string(),
            },
            _ => "NA".to_string(),
        },
        Caster::Elapsed => match first {
            Resolved::Int(secs) if *secs >= 0 => {
                format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
            }
            _ => "NA".to_string(),
        },
        Caster::NodeList => match first {
            Resolved::Nodes(nodes) => nodes
                .iter()
                .map(|n| strip_prefix(n, &ctx.node_prefix))
                .collect::<Vec<_>>()
                .join(","),
            _ => "NA".to_string(),
        },
        Caster::NodeResources => match (values.first(), values.get(1)) {
            (Some(Resolved::Nodes(nodes)), Some(Resolved::Resources(map))) => {
                let mut out = String::new();
                for node in nodes {
                    out.push_str(strip_prefix(node, &ctx.node_prefix));
                    for resource in &ctx.resource_order {
                        out.push(';');
                        out.push_str(&map.get(resource).copied().unwrap_or(0).to_string());
                    }
                    out.push('#');
                }
                out
            }
            _ => "NA".to_string(),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// Split a format string into literals and `{name}` placeholders. Braces
/// that do not wrap a name are kept literally.
fn split_format(format: &str) -> Vec<Segment> {
    let mut segments = vec![];
    let mut literal = String::new();
    let mut chars = format.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '{' {
            literal.push(c);
            continue;
        }
        let rest = &format[i + 1..];
        match rest.find('}') {
            Some(end)
                if end > 0
                    && rest[..end]
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') =>
            {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(rest[..end].to_string()));
                for _ in 0..end + 1 {
                    chars.next();
                }
            }
            _ => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

/// Render one record through a template. A placeholder backed by a declared
/// attribute goes through its caster; any other placeholder resolves
/// directly by name; whatever is absent on the record prints as `NA`.
fn render(spec: &OutputSpec, ctx: &OutputContext, record: &JobRecord) -> String {
    let mut out = String::new();
    for segment in split_format(&spec.format) {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Placeholder(name) => {
                let rendered = match spec.attributes.iter().find(|(n, _)| *n == name) {
                    Some((_, attr)) => {
                        let values: Vec<Resolved> =
                            attr.sources.iter().map(|s| resolve(record, s)).collect();
                        apply(attr.caster, &values, ctx)
                    }
                    None => plain(&resolve(record, &name)),
                };
                out.push_str(&rendered);
            }
        }
    }
    out
}

/// Header line for the pretty-print output: every placeholder replaced by
/// its own name.
fn header(spec: &OutputSpec) -> String {
    let mut out = String::new();
    for segment in split_format(&spec.format) {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Placeholder(name) => out.push_str(&name),
        }
    }
    out
}

/// Pre-processor for the scheduling log: one line per finished job.
pub fn scheduling_pre_process(spec: OutputSpec, ctx: OutputContext) -> PreProcess<JobRecord> {
    Box::new(move |record| format!("{}\n", render(&spec, &ctx, record)))
}

/// Pre-processor for the pretty-print log: a header precedes the first
/// finished job.
pub fn pprint_pre_process(spec: OutputSpec, ctx: OutputContext) -> PreProcess<JobRecord> {
    Box::new(move |record| {
        let line = render(&spec, &ctx, record);
        if record.state.end_order == 1 {
            format!("{}\n{}\n", header(&spec), line)
        } else {
            format!("{}\n", line)
        }
    })
}
