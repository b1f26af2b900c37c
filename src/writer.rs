use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// Turns a record into the text appended to the output file. May return more
/// than one line (the pretty-print header does).
pub type PreProcess<T> = Box<dyn Fn(&T) -> String + Send>;

/// Queue depth of the writer FIFO. A full queue blocks the producer instead
/// of dropping records.
const QUEUE_DEPTH: usize = 1024;

/// Background consumer bound to one output file.
///
/// Records pushed by the simulation thread are serialized by the
/// pre-processor and flushed in FIFO order by a dedicated worker. The caller
/// must keep at most one writer per output path per run; `stop` drains the
/// queue before closing the file.
pub struct AsyncWriter<T> {
    path: PathBuf,
    tx: Option<tokio::sync::mpsc::Sender<T>>,
    handle: Option<std::thread::JoinHandle<anyhow::Result<()>>>,
}

impl<T: Send + 'static> AsyncWriter<T> {
    pub fn spawn(path: &Path, pre_process: PreProcess<T>) -> anyhow::Result<Self> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot create output file {}", path.display()))?;
        let (tx, mut rx) = tokio::sync::mpsc::channel::<T>(QUEUE_DEPTH);
        let handle = std::thread::spawn(move || -> anyhow::Result<()> {
            let mut out = std::io::BufWriter::new(file);
            while let Some(record) = rx.blocking_recv() {
                out.write_all(pre_process(&record).as_bytes())?;
            }
            out.flush()?;
            Ok(())
        });
        Ok(Self {
            path: path.to_path_buf(),
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Enqueue a record. Blocks only while the queue is full.
    pub fn push(&self, record: T) -> anyhow::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .with_context(|| format!("writer for {} already stopped", self.path.display()))?;
        tx.blocking_send(record)
            .map_err(|_| anyhow::anyhow!("writer thread for {} is gone", self.path.display()))
    }

    /// Signal end-of-stream, drain the queue and join the worker.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        self.tx.take();
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => {
                    result.with_context(|| format!("writer for {}", self.path.display()))
                }
                Err(_) => anyhow::bail!("writer thread for {} panicked", self.path.display()),
            },
            None => Ok(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> Drop for AsyncWriter<T> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_preserves_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut writer: AsyncWriter<u32> =
            AsyncWriter::spawn(&path, Box::new(|n| format!("{}\n", n))).unwrap();
        for n in 0..500 {
            writer.push(n).unwrap();
        }
        writer.stop().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 500);
        assert_eq!(lines[0], "0");
        assert_eq!(lines[499], "499");
    }

    #[test]
    fn test_writer_stop_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut writer: AsyncWriter<String> =
            AsyncWriter::spawn(&path, Box::new(|s: &String| format!("{}\n", s))).unwrap();
        writer.push("last".to_string()).unwrap();
        writer.stop().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "last\n");
    }

    #[test]
    fn test_writer_push_after_stop_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut writer: AsyncWriter<u32> =
            AsyncWriter::spawn(&path, Box::new(|n| format!("{}\n", n))).unwrap();
        writer.stop().unwrap();
        assert!(writer.push(1).is_err());
    }
}
