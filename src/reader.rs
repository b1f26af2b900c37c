use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::Context;

use crate::job::{FieldValue, RawJob};

/// Field order of one SWF data line. `avg_cpu_time` is the only float.
pub const SWF_FIELDS: [&str; 18] = [
    "job_number",
    "submit_time",
    "wait_time",
    "duration",
    "allocated_processors",
    "avg_cpu_time",
    "used_memory",
    "requested_number_processors",
    "requested_time",
    "requested_memory",
    "status",
    "user_id",
    "group_id",
    "executable_number",
    "queue_number",
    "partition_number",
    "preceding_job_number",
    "think_time_prejob",
];

const COMMENT_TOKEN: char = ';';

/// Parse one data line into a raw attribute map.
pub fn parse_swf_line(line: &str) -> anyhow::Result<RawJob> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    anyhow::ensure!(
        tokens.len() == SWF_FIELDS.len(),
        "expected {} fields, found {}",
        SWF_FIELDS.len(),
        tokens.len()
    );
    let mut raw = RawJob::with_capacity(SWF_FIELDS.len());
    for (name, token) in SWF_FIELDS.iter().zip(tokens) {
        let value = if *name == "avg_cpu_time" {
            FieldValue::Float(
                token
                    .parse()
                    .with_context(|| format!("field {}: bad float {}", name, token))?,
            )
        } else {
            FieldValue::Int(
                token
                    .parse()
                    .with_context(|| format!("field {}: bad integer {}", name, token))?,
            )
        };
        raw.insert(name.to_string(), value);
    }
    Ok(raw)
}

/// A record without processor or memory information cannot be simulated.
fn unusable(raw: &RawJob) -> bool {
    let unknown = |field: &str| matches!(raw.get(field), Some(FieldValue::Int(-1)));
    (unknown("requested_number_processors") && unknown("allocated_processors"))
        || (unknown("requested_memory") && unknown("used_memory"))
}

/// Incremental reader over an SWF workload trace.
///
/// Comment lines (leading `;`) and unusable records are skipped; the trace
/// must be sorted by submit time, anything else is a replay-ordering error.
pub struct SwfReader {
    lines: std::io::Lines<BufReader<std::fs::File>>,
    pending: Option<RawJob>,
    line_no: usize,
    last_submit: Option<i64>,
    eof: bool,
}

impl SwfReader {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open workload {}", path.display()))?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            pending: None,
            line_no: 0,
            last_submit: None,
            eof: false,
        })
    }

    fn next_record(&mut self) -> anyhow::Result<Option<RawJob>> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(COMMENT_TOKEN) {
                continue;
            }
            let raw = parse_swf_line(trimmed)
                .with_context(|| format!("workload line {}", self.line_no))?;
            if unusable(&raw) {
                log::debug!("skipping unusable record at line {}", self.line_no);
                continue;
            }
            let submit = raw["submit_time"].as_int()?;
            if let Some(last) = self.last_submit {
                anyhow::ensure!(
                    submit >= last,
                    "workload line {}: submit time {} after {}, the trace is not sorted",
                    self.line_no,
                    submit,
                    last
                );
            }
            self.last_submit = Some(submit);
            return Ok(Some(raw));
        }
        self.eof = true;
        Ok(None)
    }

    /// Records covering the next `time_samples` distinct submit times. A
    /// submit-time group is never split across batches.
    pub fn next_batch(&mut self, time_samples: usize) -> anyhow::Result<Vec<RawJob>> {
        let mut batch = vec![];
        let mut samples = 0usize;
        let mut current: Option<i64> = None;
        loop {
            let raw = match self.pending.take() {
                Some(raw) => Some(raw),
                None => self.next_record()?,
            };
            let Some(raw) = raw else { break };
            let submit = raw["submit_time"].as_int()?;
            if current != Some(submit) {
                if samples == time_samples {
                    self.pending = Some(raw);
                    break;
                }
                samples += 1;
                current = Some(submit);
            }
            batch.push(raw);
        }
        Ok(batch)
    }

    /// True once the file is exhausted and no record is held back.
    pub fn eof(&self) -> bool {
        self.eof && self.pending.is_none()
    }
}

/// Rewrite a trace sorted ascending by submit time (stable on ties), with
/// comment lines first and unusable records dropped. Returns the number of
/// data lines written.
pub fn sort_workload(input: &Path, output: &Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(input)
        .with_context(|| format!("cannot open workload {}", input.display()))?;
    let mut comments = vec![];
    let mut records: Vec<(i64, String)> = vec![];
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with(COMMENT_TOKEN) {
            comments.push(line);
            continue;
        }
        let raw = parse_swf_line(trimmed).with_context(|| format!("line {}", line_no + 1))?;
        if unusable(&raw) {
            continue;
        }
        records.push((raw["submit_time"].as_int()?, line));
    }
    records.sort_by_key(|(submit, _)| *submit);

    let mut out = std::io::BufWriter::new(
        std::fs::File::create(output)
            .with_context(|| format!("cannot create {}", output.display()))?,
    );
    for line in &comments {
        writeln!(out, "{}", line)?;
    }
    for (_, line) in &records {
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    log::info!(
        "sorted {} into {} ({} records)",
        input.display(),
        output.display(),
        records.len()
    );
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn swf_line(job: i64, submit: i64, duration: i64, procs: i64, mem: i64) -> String {
        format!(
            "{} {} 0 {} {} 1.5 {} {} {} {} 1 1 1 1 1 1 -1 -1",
            job, submit, duration, procs, mem, procs, duration + 10, mem
        )
    }

    fn write_trace(lines: &[String]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_parse_line_field_kinds() {
        let raw = parse_swf_line(&swf_line(3, 120, 60, 4, 1024)).unwrap();
        assert_eq!(raw["job_number"], FieldValue::Int(3));
        assert_eq!(raw["submit_time"], FieldValue::Int(120));
        assert_eq!(raw["avg_cpu_time"], FieldValue::Float(1.5));
        assert_eq!(raw["requested_number_processors"], FieldValue::Int(4));
    }

    #[test]
    fn test_parse_line_wrong_arity() {
        assert!(parse_swf_line("1 2 3").is_err());
    }

    #[test]
    fn test_reader_skips_comments_and_unusable_records() {
        let trace = write_trace(&[
            "; UNIX epoch comment".to_string(),
            swf_line(1, 0, 10, 2, 64),
            // no processor information at all: skipped
            "2 0 0 10 -1 1.0 64 -1 20 64 1 1 1 1 1 1 -1 -1".to_string(),
            swf_line(3, 5, 10, 2, 64),
        ]);
        let mut reader = SwfReader::open(trace.path()).unwrap();
        let batch = reader.next_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0]["job_number"], FieldValue::Int(1));
        assert_eq!(batch[1]["job_number"], FieldValue::Int(3));
        assert!(reader.eof());
    }

    #[test]
    fn test_reader_batches_by_distinct_submit_times() {
        let trace = write_trace(&[
            swf_line(1, 0, 10, 1, 1),
            swf_line(2, 0, 10, 1, 1),
            swf_line(3, 7, 10, 1, 1),
            swf_line(4, 9, 10, 1, 1),
        ]);
        let mut reader = SwfReader::open(trace.path()).unwrap();
        let batch = reader.next_batch(2).unwrap();
        // two distinct times: 0 (twice) and 7
        assert_eq!(batch.len(), 3);
        assert!(!reader.eof());
        let batch = reader.next_batch(2).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["job_number"], FieldValue::Int(4));
        assert!(reader.next_batch(2).unwrap().is_empty());
        assert!(reader.eof());
    }

    #[test]
    fn test_reader_rejects_unsorted_trace() {
        let trace = write_trace(&[swf_line(1, 10, 5, 1, 1), swf_line(2, 4, 5, 1, 1)]);
        let mut reader = SwfReader::open(trace.path()).unwrap();
        assert!(reader.next_batch(10).is_err());
    }

    #[test]
    fn test_sort_workload_is_stable_on_ties() {
        let trace = write_trace(&[
            "; header".to_string(),
            swf_line(9, 50, 5, 1, 1),
            swf_line(1, 10, 5, 1, 1),
            swf_line(2, 10, 5, 1, 1),
        ]);
        let out = tempfile::NamedTempFile::new().unwrap();
        let written = sort_workload(trace.path(), out.path()).unwrap();
        assert_eq!(written, 3);
        let content = std::fs::read_to_string(out.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].starts_with(';'));
        assert!(lines[1].starts_with("1 10"));
        assert!(lines[2].starts_with("2 10"));
        assert!(lines[3].starts_with("9 50"));
    }
}
