//! Line-delimited JSON job intake.
//!
//! Requests arrive one per line, each is dispatched to the executor on its own
//! task, and results are written back one per line in completion order. The
//! submission identifier, not the position, ties a result to its request.

use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};

use crate::errors::RunnerError;
use crate::orchestrator::SandboxExecutor;
use crate::types::{ExecutionRequest, ExecutionResult};

/// `system_error` prefix for a job whose executor task died.
pub const JOB_FAILED: &str = "System Error: job failed";

pub struct JobIntake<E> {
    executor: Arc<E>,
    max_concurrent_jobs: usize,
}

/// Counts reported when the input is exhausted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntakeSummary {
    pub accepted: usize,
    pub rejected: usize,
    pub completed: usize,
}

impl<E: SandboxExecutor + 'static> JobIntake<E> {
    pub fn new(executor: Arc<E>, max_concurrent_jobs: usize) -> Self {
        Self {
            executor,
            max_concurrent_jobs: max_concurrent_jobs.max(1),
        }
    }

    /// Serves until `reader` reaches EOF and every accepted job has finished.
    ///
    /// Results of accepted jobs are written even when reading the input fails.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<IntakeSummary, RunnerError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::channel::<ExecutionResult>(self.max_concurrent_jobs * 2);
        let limiter = Arc::new(Semaphore::new(self.max_concurrent_jobs));

        let dispatch = async move {
            let mut reader = reader;
            let mut line = Vec::new();
            let mut summary = IntakeSummary::default();

            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    break;
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let request: ExecutionRequest = match serde_json::from_slice(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        log::warn!("Skipping malformed request: {}", e);
                        summary.rejected += 1;
                        continue;
                    }
                };
                summary.accepted += 1;

                let permit = limiter
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| RunnerError::Config(format!("intake limiter closed: {}", e)))?;
                let executor = self.executor.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let submission_id = request.submission_id.clone();
                    let job = tokio::spawn(async move { executor.execute(request).await });
                    let result = match job.await {
                        Ok(result) => result,
                        Err(e) => {
                            log::error!("Job for submission {} failed: {}", submission_id, e);
                            ExecutionResult::system_failure(submission_id, format!("{}: {}", JOB_FAILED, e))
                        }
                    };
                    drop(permit);
                    if tx.send(result).await.is_err() {
                        log::warn!("Result writer is gone, dropping result");
                    }
                });
            }
            Ok::<_, RunnerError>(summary)
        };

        let write = async {
            let mut completed = 0;
            while let Some(result) = rx.recv().await {
                let mut line = serde_json::to_vec(&result)?;
                line.push(b'\n');
                writer.write_all(&line).await?;
                writer.flush().await?;
                completed += 1;
            }
            Ok::<_, RunnerError>(completed)
        };

        // The dispatcher owns the last sender, so the writer drains every
        // accepted job's result before either side's error is returned.
        let (dispatched, written) = tokio::join!(dispatch, write);
        let mut summary = dispatched?;
        summary.completed = written?;
        log::info!(
            "Intake finished: {} accepted, {} rejected, {} completed",
            summary.accepted,
            summary.rejected,
            summary.completed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoExecutor {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SandboxExecutor for EchoExecutor {
        async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
            if request.submission_id == "explode" {
                panic!("executor bug");
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            ExecutionResult::system_failure(request.submission_id, format!("timeout={}", request.timeout))
        }
    }

    fn executor() -> Arc<EchoExecutor> {
        Arc::new(EchoExecutor {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_results_are_tagged_and_malformed_lines_skipped() {
        let input = concat!(
            "{\"submission_id\": \"a\", \"code\": \"1\"}\n",
            "not json\n",
            "\n",
            "{\"submission_id\": \"b\", \"code\": \"2\", \"timeout\": 9}\n",
        );
        let mut output = Vec::new();
        let intake = JobIntake::new(executor(), 2);

        let summary = intake.serve(input.as_bytes(), &mut output).await.unwrap();

        assert_eq!(summary, IntakeSummary { accepted: 2, rejected: 1, completed: 2 });
        let mut results: Vec<ExecutionResult> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        results.sort_by(|a, b| a.submission_id.cmp(&b.submission_id));
        assert_eq!(results[0].submission_id, "a");
        assert_eq!(results[0].system_error.as_deref(), Some("timeout=5"));
        assert_eq!(results[1].system_error.as_deref(), Some("timeout=9"));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let input: String = (0..8)
            .map(|i| format!("{{\"submission_id\": \"{}\", \"code\": \"\"}}\n", i))
            .collect();
        let executor = executor();
        let intake = JobIntake::new(executor.clone(), 3);
        let mut output = Vec::new();

        let summary = intake.serve(input.as_bytes(), &mut output).await.unwrap();

        assert_eq!(summary.completed, 8);
        assert!(executor.peak.load(Ordering::SeqCst) <= 3);
    }

    fn results(output: Vec<u8>) -> Vec<ExecutionResult> {
        let mut results: Vec<ExecutionResult> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        results.sort_by(|a, b| a.submission_id.cmp(&b.submission_id));
        results
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_rejected_not_fatal() {
        let mut input = b"{\"submission_id\": \"a\", \"code\": \"1\"}\n".to_vec();
        input.extend_from_slice(b"\xff\xfe garbage\n");
        input.extend_from_slice(b"{\"submission_id\": \"b\", \"code\": \"2\"}\n");
        let mut output = Vec::new();
        let intake = JobIntake::new(executor(), 2);

        let summary = intake.serve(&input[..], &mut output).await.unwrap();

        assert_eq!(summary, IntakeSummary { accepted: 2, rejected: 1, completed: 2 });
        let ids: Vec<String> = results(output).into_iter().map(|r| r.submission_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_panicking_job_still_yields_tagged_result() {
        let input = concat!(
            "{\"submission_id\": \"explode\", \"code\": \"\"}\n",
            "{\"submission_id\": \"ok\", \"code\": \"\"}\n",
        );
        let mut output = Vec::new();
        let intake = JobIntake::new(executor(), 2);

        let summary = intake.serve(input.as_bytes(), &mut output).await.unwrap();

        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.completed, 2);
        let results = results(output);
        assert_eq!(results[0].submission_id, "explode");
        assert!(!results[0].success);
        assert!(results[0].system_error.as_deref().unwrap().starts_with(JOB_FAILED));
        assert_eq!(results[1].submission_id, "ok");
    }
}
