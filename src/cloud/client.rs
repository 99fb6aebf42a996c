//! Retrying, batching provider client for one region

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::api::ClbApi;
use super::error::{ApiError, CloudError, ErrorClass, Result, PARTIAL_BATCH_FAILURE};
use super::rate_limit::RateLimiter;
use super::task::{Sleeper, TaskTracker, TokioSleeper};
use super::types::*;
use crate::config::{BatchLimits, ProviderConfig, RetryPolicy};
use crate::model::{Backend, BatchResult, FailureCause, Listener, Rule};

/// A backend bound to a listener, or to one of its rules
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetBinding {
    pub listener_id: String,
    pub rule_id: Option<String>,
    pub backend: Backend,
}

impl TargetBinding {
    fn to_target(&self, with_weight: bool) -> BatchTarget {
        BatchTarget {
            listener_id: self.listener_id.clone(),
            location_id: self.rule_id.clone(),
            eni_ip: self.backend.ip.to_string(),
            port: self.backend.port,
            weight: with_weight.then_some(self.backend.weight),
        }
    }
}

/// Run `f` over `items` in chunks of at most `size`, merging per-chunk
/// results back into one entry per item. A chunk-level error fails every
/// member of that chunk.
async fn chunked<I, T, F, Fut>(action: Action, items: &[I], size: usize, f: F) -> BatchResult<T>
where
    I: Clone,
    F: Fn(Vec<I>) -> Fut,
    Fut: Future<Output = Result<BatchResult<T>>>,
{
    let mut results = Vec::with_capacity(items.len());
    for chunk in items.chunks(size.max(1)) {
        match f(chunk.to_vec()).await {
            Ok(partial) if partial.len() == chunk.len() => results.extend(partial),
            Ok(partial) => {
                let cause = FailureCause::new(
                    action.as_str(),
                    Some("Decode".to_string()),
                    format!("expected {} results, provider returned {}", chunk.len(), partial.len()),
                );
                results.extend(chunk.iter().map(|_| Err(cause.clone())));
            }
            Err(e) => {
                warn!("{} failed for a chunk of {}: {}", action, chunk.len(), e);
                let cause = e.to_cause();
                results.extend(chunk.iter().map(|_| Err(cause.clone())));
            }
        }
    }
    results
}

/// Provider client bound to one region.
///
/// Every call takes a rate-limiter token, runs under a deadline, retries
/// throttled and busy replies, and waits for the asynchronous task of
/// mutating actions before returning.
pub struct CloudClient {
    api: Arc<dyn ClbApi>,
    region: String,
    limiter: Arc<RateLimiter>,
    tracker: TaskTracker,
    retry: RetryPolicy,
    limits: BatchLimits,
    call_timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl CloudClient {
    pub fn new(
        api: Arc<dyn ClbApi>,
        region: impl Into<String>,
        limiter: Arc<RateLimiter>,
        config: &ProviderConfig,
    ) -> Self {
        let region = region.into();
        let tracker = TaskTracker::new(
            api.clone(),
            region.clone(),
            limiter.clone(),
            config.task_poll.clone(),
            config.call_timeout,
        );
        Self {
            api,
            region,
            limiter,
            tracker,
            retry: config.retry.clone(),
            limits: config.limits.clone(),
            call_timeout: config.call_timeout,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the sleeper used for retry backoff and task polling
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.tracker = self.tracker.with_sleeper(sleeper.clone());
        self.sleeper = sleeper;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn limits(&self) -> &BatchLimits {
        &self.limits
    }

    /// One logical call: throttle, deadline, retry transient codes
    async fn call<Req, Resp>(&self, action: Action, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let operation = action.as_str();
        let payload = serde_json::to_value(request).map_err(|e| CloudError::Decode {
            operation: operation.to_string(),
            message: e.to_string(),
        })?;

        let mut last_code = String::new();
        for attempt in 1..=self.retry.max_attempts {
            self.limiter.acquire().await;
            debug!("{} attempt {} in {}", operation, attempt, self.region);

            let outcome = tokio::time::timeout(
                self.call_timeout,
                self.api.invoke(&self.region, action, payload.clone()),
            )
            .await;

            match outcome {
                Err(_) => {
                    return Err(CloudError::Timeout {
                        operation: operation.to_string(),
                        timeout: self.call_timeout,
                    })
                }
                Ok(Ok(body)) => {
                    return serde_json::from_value(body).map_err(|e| CloudError::Decode {
                        operation: operation.to_string(),
                        message: e.to_string(),
                    })
                }
                Ok(Err(ApiError::Provider { code, .. })) if ErrorClass::classify(&code).is_transient() => {
                    warn!(
                        "{} attempt {}/{} got {}, retrying",
                        operation, attempt, self.retry.max_attempts, code
                    );
                    last_code = code;
                    if attempt < self.retry.max_attempts {
                        self.sleeper.sleep(self.retry.backoff).await;
                    }
                }
                Ok(Err(ApiError::Provider {
                    code,
                    message,
                    request_id,
                })) => {
                    return Err(CloudError::ProviderRejected {
                        operation: operation.to_string(),
                        code,
                        message,
                        request_id,
                    })
                }
                Ok(Err(source)) => {
                    return Err(CloudError::Transport {
                        operation: operation.to_string(),
                        source,
                    })
                }
            }
        }

        Err(CloudError::RetryExhausted {
            operation: operation.to_string(),
            attempts: self.retry.max_attempts,
            last_code,
        })
    }

    /// A call whose effect is applied asynchronously by the provider
    async fn mutate<Req, Resp>(&self, action: Action, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned + MutationResponse,
    {
        let response: Resp = self.call(action, request).await?;
        self.tracker
            .await_completion(action.as_str(), &response.task_handle())
            .await?;
        Ok(response)
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Create single-port listeners sharing `template`'s protocol, attributes
    /// and certificate. Ids come back in input order.
    pub async fn create_listeners(
        &self,
        lb: &str,
        template: &Listener,
        listeners: &[Listener],
    ) -> BatchResult<String> {
        let attributes = ListenerAttributesWire::for_listener(template);
        let attributes = &attributes;
        chunked(
            Action::CreateListener,
            listeners,
            self.limits.listeners_per_create,
            move |chunk| async move {
                let request = CreateListenerRequest {
                    load_balancer_id: lb.to_string(),
                    ports: chunk.iter().map(|l| l.port).collect(),
                    listener_names: chunk.iter().map(Listener::name).collect(),
                    protocol: template.protocol,
                    end_port: None,
                    attributes: attributes.clone(),
                };
                let response: CreateListenerResponse =
                    self.mutate(Action::CreateListener, &request).await?;
                Ok(response.listener_ids.into_iter().map(Ok).collect())
            },
        )
        .await
    }

    /// Create one port-range listener; the provider accepts one range per call
    pub async fn create_segment_listener(&self, lb: &str, listener: &Listener) -> Result<String> {
        let request = CreateListenerRequest {
            load_balancer_id: lb.to_string(),
            ports: vec![listener.port],
            listener_names: vec![listener.name()],
            protocol: listener.protocol,
            end_port: listener.end_port,
            attributes: ListenerAttributesWire::for_listener(listener),
        };
        let response: CreateListenerResponse = self.mutate(Action::CreateListener, &request).await?;
        match response.listener_ids.as_slice() {
            [id] => Ok(id.clone()),
            ids => Err(CloudError::Decode {
                operation: Action::CreateListener.to_string(),
                message: format!("expected one listener id, got {}", ids.len()),
            }),
        }
    }

    /// Create port-range listeners in parallel, at most `concurrency` at once
    pub async fn create_segment_listeners(
        &self,
        lb: &str,
        listeners: &[Listener],
        concurrency: usize,
    ) -> BatchResult<String> {
        let semaphore = Semaphore::new(concurrency.max(1));
        let semaphore = &semaphore;
        let tasks = listeners.iter().map(move |listener| async move {
            let _permit = semaphore.acquire().await.map_err(|e| {
                FailureCause::new(Action::CreateListener.as_str(), None, e.to_string())
            })?;
            self.create_segment_listener(lb, listener).await.map_err(|e| {
                warn!("Failed to create segment listener {}: {}", listener.name(), e);
                e.to_cause()
            })
        });
        join_all(tasks).await
    }

    pub async fn delete_listeners(&self, lb: &str, listener_ids: &[String]) -> BatchResult<()> {
        chunked(
            Action::DeleteLoadBalancerListeners,
            listener_ids,
            self.limits.listeners_per_delete,
            move |chunk| async move {
                let n = chunk.len();
                let request = DeleteListenersRequest {
                    load_balancer_id: lb.to_string(),
                    listener_ids: chunk,
                };
                let _: RequestIdResponse = self
                    .mutate(Action::DeleteLoadBalancerListeners, &request)
                    .await?;
                Ok(vec![Ok(()); n])
            },
        )
        .await
    }

    pub async fn modify_listener(&self, lb: &str, listener_id: &str, listener: &Listener) -> Result<()> {
        let request = ModifyListenerRequest {
            load_balancer_id: lb.to_string(),
            listener_id: listener_id.to_string(),
            attributes: ListenerAttributesWire::for_listener(listener),
        };
        let _: RequestIdResponse = self.mutate(Action::ModifyListener, &request).await?;
        Ok(())
    }

    // ========================================================================
    // Rules
    // ========================================================================

    pub async fn create_rules(&self, lb: &str, listener_id: &str, rules: &[Rule]) -> BatchResult<String> {
        chunked(
            Action::CreateRule,
            rules,
            self.limits.rules_per_call,
            move |chunk| async move {
                let request = CreateRuleRequest {
                    load_balancer_id: lb.to_string(),
                    listener_id: listener_id.to_string(),
                    rules: chunk.iter().map(RuleInput::from).collect(),
                };
                let response: CreateRuleResponse = self.mutate(Action::CreateRule, &request).await?;
                Ok(response.location_ids.into_iter().map(Ok).collect())
            },
        )
        .await
    }

    pub async fn delete_rules(&self, lb: &str, listener_id: &str, rule_ids: &[String]) -> BatchResult<()> {
        chunked(
            Action::DeleteRule,
            rule_ids,
            self.limits.rules_per_call,
            move |chunk| async move {
                let n = chunk.len();
                let request = DeleteRuleRequest {
                    load_balancer_id: lb.to_string(),
                    listener_id: listener_id.to_string(),
                    location_ids: chunk,
                };
                let _: RequestIdResponse = self.mutate(Action::DeleteRule, &request).await?;
                Ok(vec![Ok(()); n])
            },
        )
        .await
    }

    pub async fn modify_rule(&self, lb: &str, listener_id: &str, rule_id: &str, rule: &Rule) -> Result<()> {
        let request = ModifyRuleRequest {
            load_balancer_id: lb.to_string(),
            listener_id: listener_id.to_string(),
            location_id: rule_id.to_string(),
            rule: RuleInput::from(rule),
        };
        let _: RequestIdResponse = self.mutate(Action::ModifyRule, &request).await?;
        Ok(())
    }

    // ========================================================================
    // Targets
    // ========================================================================

    pub async fn register_targets(&self, lb: &str, bindings: &[TargetBinding]) -> BatchResult<()> {
        self.batch_targets(Action::BatchRegisterTargets, lb, bindings, true).await
    }

    pub async fn deregister_targets(&self, lb: &str, bindings: &[TargetBinding]) -> BatchResult<()> {
        self.batch_targets(Action::BatchDeregisterTargets, lb, bindings, false).await
    }

    pub async fn modify_target_weights(&self, lb: &str, bindings: &[TargetBinding]) -> BatchResult<()> {
        self.batch_targets(Action::BatchModifyTargetWeight, lb, bindings, true).await
    }

    async fn batch_targets(
        &self,
        action: Action,
        lb: &str,
        bindings: &[TargetBinding],
        with_weight: bool,
    ) -> BatchResult<()> {
        chunked(action, bindings, self.limits.targets_per_call, move |chunk| async move {
            let request = BatchTargetsRequest {
                load_balancer_id: lb.to_string(),
                targets: chunk.iter().map(|b| b.to_target(with_weight)).collect(),
            };
            let response: BatchTargetsResponse = self.mutate(action, &request).await?;
            Ok(chunk
                .iter()
                .map(|binding| {
                    if response.fail_listener_id_set.contains(&binding.listener_id) {
                        warn!(
                            "{} did not apply {} on listener {}",
                            action, binding.backend.key(), binding.listener_id
                        );
                        Err(FailureCause::new(
                            action.as_str(),
                            Some(PARTIAL_BATCH_FAILURE.to_string()),
                            format!(
                                "backend {} not applied on listener {}",
                                binding.backend.key(),
                                binding.listener_id
                            ),
                        ))
                    } else {
                        Ok(())
                    }
                })
                .collect())
        })
        .await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Every listener of a load balancer, with rules and attributes
    pub async fn describe_listeners(&self, lb: &str) -> Result<Vec<ListenerWire>> {
        let request = DescribeListenersRequest {
            load_balancer_id: lb.to_string(),
            listener_ids: Vec::new(),
        };
        let response: DescribeListenersResponse = self.call(Action::DescribeListeners, &request).await?;
        Ok(response.listeners)
    }

    /// Backends of the given listeners and their rules
    pub async fn describe_targets(&self, lb: &str, listener_ids: &[String]) -> Result<Vec<ListenerBackendWire>> {
        let mut listeners = Vec::new();
        for chunk in listener_ids.chunks(self.limits.ids_per_describe.max(1)) {
            let request = DescribeTargetsRequest {
                load_balancer_id: lb.to_string(),
                listener_ids: chunk.to_vec(),
            };
            let response: DescribeTargetsResponse = self.call(Action::DescribeTargets, &request).await?;
            listeners.extend(response.listeners);
        }
        Ok(listeners)
    }
}
