//! Out-of-process extraction.
//!
//! `yearbook extract-worker` answers one JSON request per stdin line with one
//! JSON response line on stdout. Every worker process loads its own face model,
//! so index batches extract in parallel, and a worker that overruns its
//! deadline is killed and replaced on the next request.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::detector::FaceModel;
use super::extractor::{ExtractionResult, Extractor};

/// Name of the subcommand that runs [`serve`].
pub const WORKER_COMMAND: &str = "extract-worker";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub path: PathBuf,
    pub thumbnail_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResponse {
    /// `None` when extraction failed; the worker logs why.
    pub result: Option<ExtractionResult>,
}

/// Worker side: answer requests from `input` until it is closed.
pub fn serve<R: BufRead, W: Write>(extractor: &Extractor, input: R, mut output: W) -> Result<()> {
    for line in input.lines() {
        let line = line.context("Failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }
        let result = match serde_json::from_str::<ExtractRequest>(&line) {
            Ok(request) => extractor.extract(&request.path, &request.thumbnail_dir),
            Err(e) => {
                tracing::warn!(error = %e, "Malformed extraction request");
                None
            }
        };
        serde_json::to_writer(&mut output, &ExtractResponse { result })?;
        output.write_all(b"\n")?;
        output.flush()?;
    }
    Ok(())
}

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    /// This executable, re-invoked as `extract-worker` with the same config.
    pub fn current_exe(config_path: Option<&Path>) -> Result<Self> {
        let program = std::env::current_exe().context("Cannot locate the yearbook executable")?;
        let mut args = Vec::new();
        if let Some(path) = config_path {
            args.push(OsString::from("--config"));
            args.push(path.as_os_str().to_owned());
        }
        args.push(OsString::from(WORKER_COMMAND));
        Ok(Self { program, args })
    }
}

struct RunningWorker {
    child: Child,
    stdin: ChildStdin,
    responses: Receiver<io::Result<String>>,
}

impl RunningWorker {
    fn spawn(command: &WorkerCommand) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to start {}", command.program.display()))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            bail!("Worker pipes were not opened");
        };

        // Ends by itself once the child's stdout closes.
        let (tx, responses) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name("extract-worker-stdout".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = reader {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e).context("Failed to start worker reader thread");
        }

        tracing::debug!(pid = child.id(), "Started extraction worker");
        Ok(Self {
            child,
            stdin,
            responses,
        })
    }

    fn kill(mut self) {
        let pid = self.child.id();
        if let Err(e) = self.child.kill() {
            tracing::debug!(pid, error = %e, "Worker already gone");
        }
        let _ = self.child.wait();
    }
}

/// One worker process, started on first use and restarted after it is
/// killed or dies.
pub struct WorkerProcess {
    command: WorkerCommand,
    running: Option<RunningWorker>,
}

impl WorkerProcess {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Extract one photo. On timeout the worker is killed, so nothing keeps
    /// running past the deadline.
    pub fn extract(
        &mut self,
        path: &Path,
        thumbnail_dir: &Path,
        timeout: Option<Duration>,
    ) -> Result<Option<ExtractionResult>> {
        let request = serde_json::to_string(&ExtractRequest {
            path: path.to_path_buf(),
            thumbnail_dir: thumbnail_dir.to_path_buf(),
        })?;

        if self.running.is_none() {
            self.running = Some(RunningWorker::spawn(&self.command)?);
        }
        let Some(worker) = self.running.as_mut() else {
            bail!("Worker did not start");
        };

        let sent = writeln!(worker.stdin, "{request}").and_then(|()| worker.stdin.flush());
        let received = match sent {
            Ok(()) => match timeout {
                Some(timeout) => worker.responses.recv_timeout(timeout),
                None => worker
                    .responses
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            },
            Err(e) => {
                self.stop();
                return Err(e).context("Worker is not accepting requests");
            }
        };

        match received {
            Ok(Ok(line)) => {
                let response: ExtractResponse =
                    serde_json::from_str(&line).context("Malformed worker response")?;
                Ok(response.result)
            }
            Ok(Err(e)) => {
                self.stop();
                Err(e).context("Failed to read worker response")
            }
            Err(RecvTimeoutError::Timeout) => {
                self.stop();
                Err(anyhow!(
                    "Extraction timed out after {:?}, worker killed",
                    timeout.unwrap_or_default()
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.stop();
                Err(anyhow!("Worker exited without answering"))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.running.take() {
            worker.kill();
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Idle worker processes shared by the index batches. A batch checks one out
/// for its lifetime, so there are never more processes than pool threads.
pub struct WorkerPool {
    command: WorkerCommand,
    idle: Mutex<Vec<WorkerProcess>>,
}

impl WorkerPool {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn checkout(&self) -> WorkerProcess {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| WorkerProcess::new(self.command.clone()))
    }

    pub fn checkin(&self, worker: WorkerProcess) {
        if worker.is_running() {
            self.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(worker);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Where the index task sends photos.
#[derive(Clone)]
pub enum Extraction {
    /// Extract on the batch thread itself. Item timeouts do not apply.
    InProcess(Arc<Extractor>),
    /// Extract in `extract-worker` processes.
    Workers(Arc<WorkerPool>),
}

impl Extraction {
    pub fn in_process(model: Arc<dyn FaceModel>, thumbnail_size: u32) -> Self {
        Extraction::InProcess(Arc::new(Extractor::new(model, thumbnail_size)))
    }

    pub fn workers(command: WorkerCommand) -> Self {
        Extraction::Workers(Arc::new(WorkerPool::new(command)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faces::detector::test_support::StubFaceModel;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn test_serve_answers_every_line() {
        let dir = tempdir().unwrap();
        let photo = dir.path().join("IMG_20180305_090000.png");
        RgbImage::from_pixel(30, 30, Rgb([40, 50, 60])).save(&photo).unwrap();
        let thumbs = dir.path().join("thumbs");

        let requests = [
            serde_json::to_string(&ExtractRequest {
                path: photo.clone(),
                thumbnail_dir: thumbs.clone(),
            })
            .unwrap(),
            serde_json::to_string(&ExtractRequest {
                path: dir.path().join("missing.jpg"),
                thumbnail_dir: thumbs.clone(),
            })
            .unwrap(),
            String::new(),
            "not json".to_string(),
        ]
        .join("\n");

        let extractor = Extractor::new(Arc::new(StubFaceModel), 50);
        let mut output = Vec::new();
        serve(&extractor, Cursor::new(requests), &mut output).unwrap();

        let responses: Vec<ExtractResponse> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(responses.len(), 3);

        let found = responses[0].result.as_ref().unwrap();
        assert_eq!(found.date.year, Some(2018));
        assert_eq!(found.faces.len(), 1);
        assert_eq!(found.faces[0].embedding, vec![40.0, 50.0, 60.0]);
        assert!(found.faces[0].thumbnail_path.as_ref().unwrap().exists());
        assert!(responses[1].result.is_none());
        assert!(responses[2].result.is_none());
    }

    #[test]
    fn test_current_exe_command_passes_config() {
        let command = WorkerCommand::current_exe(Some(Path::new("/etc/yearbook.toml"))).unwrap();
        assert_eq!(
            command.args,
            vec![
                OsString::from("--config"),
                OsString::from("/etc/yearbook.toml"),
                OsString::from(WORKER_COMMAND)
            ]
        );
    }

    #[cfg(unix)]
    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: PathBuf::from("sh"),
            args: vec![OsString::from("-c"), OsString::from(script)],
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_worker_round_trip_and_reuse() {
        let pool = WorkerPool::new(shell(r#"while read line; do echo '{"result":null}'; done"#));
        let mut worker = pool.checkout();
        for _ in 0..2 {
            let result = worker
                .extract(Path::new("/p/a.jpg"), Path::new("/t"), Some(Duration::from_secs(10)))
                .unwrap();
            assert!(result.is_none());
        }
        assert!(worker.is_running());

        pool.checkin(worker);
        assert_eq!(pool.idle_count(), 1);
        assert!(pool.checkout().is_running());
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_worker_is_killed_and_replaced() {
        let mut worker = WorkerProcess::new(shell("cat > /dev/null"));
        let err = worker
            .extract(Path::new("/p/a.jpg"), Path::new("/t"), Some(Duration::from_millis(100)))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(!worker.is_running());

        // Dead workers are not returned to the pool
        let pool = WorkerPool::new(shell("cat > /dev/null"));
        pool.checkin(worker);
        assert_eq!(pool.idle_count(), 0);

        // The next request starts a fresh process, which times out in turn
        let mut worker = pool.checkout();
        let err = worker
            .extract(Path::new("/p/b.jpg"), Path::new("/t"), Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_worker_is_an_error() {
        let mut worker = WorkerProcess::new(shell("exit 0"));
        assert!(worker
            .extract(Path::new("/p/a.jpg"), Path::new("/t"), Some(Duration::from_secs(10)))
            .is_err());
        assert!(!worker.is_running());
    }
}
