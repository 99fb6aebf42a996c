//! Polling of asynchronous provider tasks

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::api::ClbApi;
use super::error::{ApiError, CloudError, ErrorClass, Result};
use super::rate_limit::RateLimiter;
use super::types::{Action, DescribeTaskStatusRequest, DescribeTaskStatusResponse, TaskHandle, TaskState};
use crate::config::TaskPollConfig;

/// Delay between polls; swapped out in tests
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Waits for a mutating call's task to reach a terminal state
pub struct TaskTracker {
    api: Arc<dyn ClbApi>,
    region: String,
    limiter: Arc<RateLimiter>,
    config: TaskPollConfig,
    /// Deadline for each status query
    call_timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl TaskTracker {
    pub fn new(
        api: Arc<dyn ClbApi>,
        region: impl Into<String>,
        limiter: Arc<RateLimiter>,
        config: TaskPollConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            api,
            region: region.into(),
            limiter,
            config,
            call_timeout,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Poll until the task succeeds, fails, or the poll budget runs out
    pub async fn await_completion(&self, operation: &str, task: &TaskHandle) -> Result<()> {
        let payload = serde_json::to_value(DescribeTaskStatusRequest {
            task_id: task.0.clone(),
        })
        .map_err(|e| CloudError::Decode {
            operation: operation.to_string(),
            message: e.to_string(),
        })?;

        for poll in 1..=self.config.max_polls {
            self.limiter.acquire().await;

            let outcome = tokio::time::timeout(
                self.call_timeout,
                self.api
                    .invoke(&self.region, Action::DescribeTaskStatus, payload.clone()),
            )
            .await
            .map_err(|_| {
                warn!("{} task {} status query timed out", operation, task);
                CloudError::Timeout {
                    operation: operation.to_string(),
                    timeout: self.call_timeout,
                }
            })?;

            match outcome {
                Ok(body) => {
                    let status: DescribeTaskStatusResponse =
                        serde_json::from_value(body).map_err(|e| CloudError::Decode {
                            operation: operation.to_string(),
                            message: format!("task status: {e}"),
                        })?;
                    match TaskState::from_code(status.status) {
                        Some(TaskState::Succeeded) => {
                            debug!("{} task {} succeeded after {} polls", operation, task, poll);
                            return Ok(());
                        }
                        Some(TaskState::Failed) => {
                            warn!("{} task {} failed", operation, task);
                            return Err(CloudError::TaskFailed {
                                operation: operation.to_string(),
                                task: task.0.clone(),
                            });
                        }
                        Some(TaskState::Dealing) => {}
                        None => {
                            return Err(CloudError::Decode {
                                operation: operation.to_string(),
                                message: format!("unknown task status {}", status.status),
                            })
                        }
                    }
                }
                Err(ApiError::Provider { code, .. }) if ErrorClass::classify(&code).is_transient() => {
                    debug!("{} task {} status query throttled ({}), still dealing", operation, task, code);
                }
                Err(ApiError::Provider {
                    code,
                    message,
                    request_id,
                }) => {
                    return Err(CloudError::ProviderRejected {
                        operation: operation.to_string(),
                        code,
                        message,
                        request_id,
                    })
                }
                Err(source) => {
                    return Err(CloudError::Transport {
                        operation: operation.to_string(),
                        source,
                    })
                }
            }

            if poll < self.config.max_polls {
                self.sleeper.sleep(self.config.interval).await;
            }
        }

        warn!(
            "{} task {} still in progress after {} polls",
            operation, task, self.config.max_polls
        );
        Err(CloudError::TaskTimeout {
            operation: operation.to_string(),
            task: task.0.clone(),
            polls: self.config.max_polls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::FakeProvider;
    use crate::config::RateLimitConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSleeper(AtomicU32);

    #[async_trait]
    impl Sleeper for CountingSleeper {
        async fn sleep(&self, _duration: Duration) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracker(fake: Arc<FakeProvider>, max_polls: u32) -> (TaskTracker, Arc<CountingSleeper>) {
        let sleeper = Arc::new(CountingSleeper(AtomicU32::new(0)));
        let tracker = TaskTracker::new(
            fake,
            "ap-test",
            Arc::new(RateLimiter::new(&RateLimitConfig::default())),
            TaskPollConfig {
                interval: Duration::from_millis(10),
                max_polls,
            },
            Duration::from_secs(10),
        )
        .with_sleeper(sleeper.clone());
        (tracker, sleeper)
    }

    #[tokio::test]
    async fn test_succeeds_after_dealing() {
        let fake = Arc::new(FakeProvider::new());
        fake.script_task("req-1", vec![2, 2, 0]);
        let (tracker, sleeper) = tracker(fake, 5);
        tracker
            .await_completion("CreateListener", &TaskHandle("req-1".to_string()))
            .await
            .unwrap();
        assert_eq!(sleeper.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_task_names_handle() {
        let fake = Arc::new(FakeProvider::new());
        fake.script_task("req-2", vec![1]);
        let (tracker, _) = tracker(fake, 5);
        let err = tracker
            .await_completion("DeleteRule", &TaskHandle("req-2".to_string()))
            .await
            .unwrap_err();
        match err {
            CloudError::TaskFailed { task, operation } => {
                assert_eq!(task, "req-2");
                assert_eq!(operation, "DeleteRule");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_poll_budget_is_a_hard_cap() {
        let fake = Arc::new(FakeProvider::new());
        fake.script_task("req-3", vec![2; 10]);
        let (tracker, sleeper) = tracker(fake.clone(), 3);
        let err = tracker
            .await_completion("ModifyRule", &TaskHandle("req-3".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::TaskTimeout { polls: 3, .. }));
        assert_eq!(fake.call_count(Action::DescribeTaskStatus), 3);
        assert_eq!(sleeper.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_busy_status_query_counts_as_dealing() {
        let fake = Arc::new(FakeProvider::new());
        fake.fail_next(Action::DescribeTaskStatus, "ResourceBusy", 1);
        let (tracker, _) = tracker(fake.clone(), 5);
        tracker
            .await_completion("CreateRule", &TaskHandle("req-4".to_string()))
            .await
            .unwrap();
        assert_eq!(fake.call_count(Action::DescribeTaskStatus), 2);
    }

    struct StalledApi;

    #[async_trait]
    impl ClbApi for StalledApi {
        async fn invoke(
            &self,
            _region: &str,
            _action: Action,
            _payload: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, ApiError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_status_query_hits_call_deadline() {
        let tracker = TaskTracker::new(
            Arc::new(StalledApi),
            "ap-test",
            Arc::new(RateLimiter::new(&RateLimitConfig::default())),
            TaskPollConfig {
                interval: Duration::from_secs(1),
                max_polls: 3,
            },
            Duration::from_secs(5),
        );

        let err = tokio::time::timeout(
            Duration::from_secs(3600),
            tracker.await_completion("CreateListener", &TaskHandle("req-5".to_string())),
        )
        .await
        .expect("tracker must give up on its own")
        .unwrap_err();

        match err {
            CloudError::Timeout { operation, timeout } => {
                assert_eq!(operation, "CreateListener");
                assert_eq!(timeout, Duration::from_secs(5));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
