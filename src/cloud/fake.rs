//! In-memory provider used by unit tests
//!
//! Keeps listeners, rules and targets per load balancer, answers every
//! [`Action`] the client issues, and records each call so tests can assert
//! on batching. Failures are injected per action.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::api::ClbApi;
use super::client::CloudClient;
use super::error::ApiError;
use super::rate_limit::RateLimiter;
use super::task::Sleeper;
use super::types::*;
use crate::config::{Credentials, ProviderConfig};
use crate::model::{Backend, Listener};

pub struct NoSleep;

#[async_trait]
impl Sleeper for NoSleep {
    async fn sleep(&self, _duration: Duration) {}
}

/// Config with an effectively unlimited rate so tests never wait
pub fn test_config() -> ProviderConfig {
    let mut config = ProviderConfig::new(Credentials::new("id", "key"), "clb.test", "ap-test");
    config.rate_limit.rate_per_sec = 10_000.0;
    config.rate_limit.burst = 10_000;
    config
}

pub fn test_client_with(fake: Arc<FakeProvider>, config: &ProviderConfig) -> CloudClient {
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    CloudClient::new(fake, "ap-test", limiter, config).with_sleeper(Arc::new(NoSleep))
}

pub fn test_client(fake: Arc<FakeProvider>) -> CloudClient {
    test_client_with(fake, &test_config())
}

#[derive(Clone, Debug)]
struct FakeListener {
    wire: ListenerWire,
    targets: Vec<BackendWire>,
    rule_targets: BTreeMap<String, Vec<BackendWire>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    load_balancers: BTreeMap<String, Vec<FakeListener>>,
    calls: Vec<(Action, Value)>,
    failures: HashMap<Action, (String, usize)>,
    tasks: HashMap<String, VecDeque<i64>>,
    failing_listeners: HashSet<String>,
}

impl State {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn listeners(&mut self, lb: &str) -> &mut Vec<FakeListener> {
        self.load_balancers.entry(lb.to_string()).or_default()
    }

    fn listener(&mut self, lb: &str, id: &str) -> Result<&mut FakeListener, ApiError> {
        self.listeners(lb)
            .iter_mut()
            .find(|l| l.wire.listener_id == id)
            .ok_or_else(|| provider_error("InvalidParameter.ListenerNotFound", id))
    }
}

fn provider_error(code: &str, message: &str) -> ApiError {
    ApiError::Provider {
        code: code.to_string(),
        message: message.to_string(),
        request_id: "req-fake".to_string(),
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, ApiError> {
    serde_json::from_value(payload).map_err(|e| ApiError::Malformed(e.to_string()))
}

fn backend_wire(backend: &Backend) -> BackendWire {
    BackendWire {
        private_ip_addresses: vec![backend.ip.to_string()],
        port: backend.port,
        weight: backend.weight,
    }
}

fn same_backend(wire: &BackendWire, target: &BatchTarget) -> bool {
    wire.port == target.port && wire.private_ip_addresses.first() == Some(&target.eni_ip)
}

#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<State>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Install an existing listener, returning its provider id. Rules are
    /// assigned location ids in order.
    pub fn seed(&self, listener: &Listener) -> String {
        let mut state = self.state();
        let listener_id = state.next("lbl");
        let mut rule_targets = BTreeMap::new();
        let mut rules = Vec::new();
        for rule in &listener.rules {
            let location_id = state.next("loc");
            rule_targets.insert(
                location_id.clone(),
                rule.target_group.backends.iter().map(backend_wire).collect(),
            );
            rules.push(RuleWire {
                location_id,
                rule: RuleInput::from(rule),
            });
        }
        let fake = FakeListener {
            wire: ListenerWire {
                listener_id: listener_id.clone(),
                listener_name: listener.name(),
                protocol: listener.protocol,
                port: listener.port,
                end_port: listener.end_port,
                attributes: ListenerAttributesWire::for_listener(listener),
                rules,
            },
            targets: listener.backends().iter().map(backend_wire).collect(),
            rule_targets,
        };
        state.listeners(&listener.load_balancer_id).push(fake);
        listener_id
    }

    /// Status codes returned by successive polls of one task; unscripted
    /// tasks succeed on the first poll
    pub fn script_task(&self, request_id: &str, statuses: Vec<i64>) {
        self.state()
            .tasks
            .insert(request_id.to_string(), statuses.into());
    }

    /// Fail the next `times` calls of `action` with a provider code
    pub fn fail_next(&self, action: Action, code: &str, times: usize) {
        self.state()
            .failures
            .insert(action, (code.to_string(), times));
    }

    /// Report this listener in `FailListenerIdSet` for every target call
    pub fn fail_targets_on(&self, listener_id: &str) {
        self.state().failing_listeners.insert(listener_id.to_string());
    }

    pub fn calls(&self, action: Action) -> Vec<Value> {
        self.state()
            .calls
            .iter()
            .filter(|(a, _)| *a == action)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn call_count(&self, action: Action) -> usize {
        self.calls(action).len()
    }

    /// Mutating actions in the order they were issued
    pub fn mutation_log(&self) -> Vec<Action> {
        self.state()
            .calls
            .iter()
            .map(|(a, _)| *a)
            .filter(Action::is_mutating)
            .collect()
    }

    pub fn listener_count(&self, lb: &str) -> usize {
        self.state().listeners(lb).len()
    }

    pub fn backends_of(&self, lb: &str, listener_id: &str) -> Vec<(String, u16, u32)> {
        let mut state = self.state();
        state
            .listener(lb, listener_id)
            .map(|l| {
                l.targets
                    .iter()
                    .map(|t| {
                        (
                            t.private_ip_addresses.first().cloned().unwrap_or_default(),
                            t.port,
                            t.weight,
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn handle(&self, action: Action, payload: Value) -> Result<Value, ApiError> {
        let mut state = self.state();
        state.calls.push((action, payload.clone()));

        if let Some((code, remaining)) = state.failures.get_mut(&action) {
            if *remaining > 0 {
                *remaining -= 1;
                let code = code.clone();
                return Err(provider_error(&code, "injected failure"));
            }
        }

        let request_id = state.next("req");
        let mut reply = match action {
            Action::CreateListener => {
                let req: CreateListenerRequest = decode(payload)?;
                let mut ids = Vec::new();
                for (port, name) in req.ports.iter().zip(req.listener_names.iter()) {
                    let taken = state
                        .listeners(&req.load_balancer_id)
                        .iter()
                        .any(|l| l.wire.port == *port && l.wire.end_port == req.end_port);
                    if taken {
                        return Err(provider_error(
                            "InvalidParameter.PortCheckFailed",
                            &format!("port {port} already in use"),
                        ));
                    }
                    let id = state.next("lbl");
                    let listener = FakeListener {
                        wire: ListenerWire {
                            listener_id: id.clone(),
                            listener_name: name.clone(),
                            protocol: req.protocol,
                            port: *port,
                            end_port: req.end_port,
                            attributes: req.attributes.clone(),
                            rules: Vec::new(),
                        },
                        targets: Vec::new(),
                        rule_targets: BTreeMap::new(),
                    };
                    state.listeners(&req.load_balancer_id).push(listener);
                    ids.push(id);
                }
                json!({ "ListenerIds": ids })
            }
            Action::DeleteLoadBalancerListeners => {
                let req: DeleteListenersRequest = decode(payload)?;
                state
                    .listeners(&req.load_balancer_id)
                    .retain(|l| !req.listener_ids.contains(&l.wire.listener_id));
                json!({})
            }
            Action::ModifyListener => {
                let req: ModifyListenerRequest = decode(payload)?;
                state.listener(&req.load_balancer_id, &req.listener_id)?.wire.attributes =
                    req.attributes;
                json!({})
            }
            Action::CreateRule => {
                let req: CreateRuleRequest = decode(payload)?;
                let mut ids = Vec::new();
                let mut created = Vec::new();
                for rule in req.rules {
                    let location_id = state.next("loc");
                    ids.push(location_id.clone());
                    created.push(RuleWire { location_id, rule });
                }
                let listener = state.listener(&req.load_balancer_id, &req.listener_id)?;
                for rule in created {
                    listener.rule_targets.insert(rule.location_id.clone(), Vec::new());
                    listener.wire.rules.push(rule);
                }
                json!({ "LocationIds": ids })
            }
            Action::DeleteRule => {
                let req: DeleteRuleRequest = decode(payload)?;
                let listener = state.listener(&req.load_balancer_id, &req.listener_id)?;
                listener
                    .wire
                    .rules
                    .retain(|r| !req.location_ids.contains(&r.location_id));
                listener
                    .rule_targets
                    .retain(|id, _| !req.location_ids.contains(id));
                json!({})
            }
            Action::ModifyRule => {
                let req: ModifyRuleRequest = decode(payload)?;
                let listener = state.listener(&req.load_balancer_id, &req.listener_id)?;
                let rule = listener
                    .wire
                    .rules
                    .iter_mut()
                    .find(|r| r.location_id == req.location_id)
                    .ok_or_else(|| provider_error("InvalidParameter.LocationNotFound", &req.location_id))?;
                rule.rule = req.rule;
                json!({})
            }
            Action::BatchRegisterTargets
            | Action::BatchDeregisterTargets
            | Action::BatchModifyTargetWeight => {
                let req: BatchTargetsRequest = decode(payload)?;
                let mut failed: Vec<String> = Vec::new();
                for target in req.targets {
                    if state.failing_listeners.contains(&target.listener_id) {
                        if !failed.contains(&target.listener_id) {
                            failed.push(target.listener_id.clone());
                        }
                        continue;
                    }
                    let Ok(listener) = state.listener(&req.load_balancer_id, &target.listener_id) else {
                        failed.push(target.listener_id.clone());
                        continue;
                    };
                    let group = match &target.location_id {
                        Some(loc) => listener.rule_targets.entry(loc.clone()).or_default(),
                        None => &mut listener.targets,
                    };
                    match action {
                        Action::BatchRegisterTargets => {
                            group.retain(|b| !same_backend(b, &target));
                            group.push(BackendWire {
                                private_ip_addresses: vec![target.eni_ip.clone()],
                                port: target.port,
                                weight: target.weight.unwrap_or(10),
                            });
                        }
                        Action::BatchDeregisterTargets => group.retain(|b| !same_backend(b, &target)),
                        _ => {
                            for b in group.iter_mut().filter(|b| same_backend(b, &target)) {
                                b.weight = target.weight.unwrap_or(b.weight);
                            }
                        }
                    }
                }
                json!({ "FailListenerIdSet": failed })
            }
            Action::DescribeListeners => {
                let req: DescribeListenersRequest = decode(payload)?;
                let listeners: Vec<ListenerWire> = state
                    .listeners(&req.load_balancer_id)
                    .iter()
                    .filter(|l| req.listener_ids.is_empty() || req.listener_ids.contains(&l.wire.listener_id))
                    .map(|l| l.wire.clone())
                    .collect();
                json!({ "Listeners": listeners, "TotalCount": listeners.len() })
            }
            Action::DescribeTargets => {
                let req: DescribeTargetsRequest = decode(payload)?;
                let listeners: Vec<ListenerBackendWire> = state
                    .listeners(&req.load_balancer_id)
                    .iter()
                    .filter(|l| req.listener_ids.contains(&l.wire.listener_id))
                    .map(|l| ListenerBackendWire {
                        listener_id: l.wire.listener_id.clone(),
                        protocol: l.wire.protocol,
                        port: l.wire.port,
                        targets: l.targets.clone(),
                        rules: l
                            .wire
                            .rules
                            .iter()
                            .map(|r| RuleTargetsWire {
                                location_id: r.location_id.clone(),
                                domain: r.rule.domain.clone(),
                                url: r.rule.url.clone(),
                                targets: l.rule_targets.get(&r.location_id).cloned().unwrap_or_default(),
                            })
                            .collect(),
                    })
                    .collect();
                json!({ "Listeners": listeners })
            }
            Action::DescribeTaskStatus => {
                let req: DescribeTaskStatusRequest = decode(payload)?;
                let status = state
                    .tasks
                    .get_mut(&req.task_id)
                    .and_then(|q| q.pop_front())
                    .unwrap_or(0);
                json!({ "Status": status })
            }
        };

        if let Value::Object(map) = &mut reply {
            map.insert("RequestId".to_string(), Value::String(request_id));
        }
        Ok(reply)
    }
}

#[async_trait]
impl ClbApi for FakeProvider {
    async fn invoke(&self, _region: &str, action: Action, payload: Value) -> Result<Value, ApiError> {
        self.handle(action, payload)
    }
}
