//! Observed listener state, read back from the provider

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use tracing::{debug, warn};

use crate::cloud::error::Result;
use crate::cloud::types::{BackendWire, ListenerBackendWire, ListenerWire};
use crate::cloud::CloudClient;
use crate::model::{Backend, Listener, ListenerKey, Rule, TargetGroup};

/// Read every listener of `lb_id` on the requested ports (all ports when
/// `ports` is empty), hydrated with rules and backends.
///
/// Issues one listener describe and, when anything matched, one paginated
/// target describe.
pub async fn fetch_listeners(
    client: &CloudClient,
    lb_id: &str,
    ports: &BTreeSet<u16>,
) -> Result<BTreeMap<ListenerKey, Listener>> {
    let wires: Vec<ListenerWire> = client
        .describe_listeners(lb_id)
        .await?
        .into_iter()
        .filter(|w| ports.is_empty() || ports.contains(&w.port))
        .collect();

    if wires.is_empty() {
        debug!("No listeners on {} for the requested ports", lb_id);
        return Ok(BTreeMap::new());
    }

    let ids: Vec<String> = wires.iter().map(|w| w.listener_id.clone()).collect();
    let targets: HashMap<String, ListenerBackendWire> = client
        .describe_targets(lb_id, &ids)
        .await?
        .into_iter()
        .map(|t| (t.listener_id.clone(), t))
        .collect();

    let observed: BTreeMap<ListenerKey, Listener> = wires
        .into_iter()
        .map(|wire| {
            let backends = targets.get(&wire.listener_id);
            let listener = hydrate(lb_id, wire, backends);
            (listener.key(), listener)
        })
        .collect();

    debug!("Fetched {} listeners from {}", observed.len(), lb_id);
    Ok(observed)
}

fn hydrate(lb_id: &str, wire: ListenerWire, targets: Option<&ListenerBackendWire>) -> Listener {
    let mut listener = Listener::new(lb_id, wire.protocol, wire.port);
    listener.end_port = wire.end_port;
    listener.listener_id = Some(wire.listener_id.clone());
    listener.certificate = wire.attributes.certificate.as_ref().map(Into::into);
    listener.attributes = wire.attributes.to_attributes();

    if wire.protocol.is_layer7() {
        listener.rules = wire
            .rules
            .iter()
            .map(|r| {
                let backends = targets
                    .and_then(|t| t.rules.iter().find(|rt| rt.location_id == r.location_id))
                    .map(|rt| parse_backends(&rt.targets))
                    .unwrap_or_default();
                Rule {
                    rule_id: Some(r.location_id.clone()),
                    domain: r.rule.domain.clone(),
                    path: r.rule.url.clone(),
                    attributes: r.rule.to_attributes(),
                    certificate: r.rule.certificate.as_ref().map(Into::into),
                    target_group: TargetGroup::new(backends),
                }
            })
            .collect();
    } else {
        let backends = targets
            .map(|t| parse_backends(&t.targets))
            .unwrap_or_default();
        listener.target_group = Some(TargetGroup::new(backends));
    }

    listener
}

fn parse_backends(wires: &[BackendWire]) -> Vec<Backend> {
    wires
        .iter()
        .filter_map(|w| {
            let raw = w.private_ip_addresses.first()?;
            match raw.parse::<IpAddr>() {
                Ok(ip) => Some(Backend::new(ip, w.port, w.weight)),
                Err(_) => {
                    warn!("Skipping backend with unparsable address {:?}", raw);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cloud::fake::{test_client, FakeProvider};
    use crate::cloud::Action;
    use crate::model::{Protocol, Scheduler};

    fn backend(ip: &str, port: u16, weight: u32) -> Backend {
        Backend::new(ip.parse().unwrap(), port, weight)
    }

    #[tokio::test]
    async fn test_empty_load_balancer_skips_target_call() {
        let fake = Arc::new(FakeProvider::new());
        let client = test_client(fake.clone());

        let observed = fetch_listeners(&client, "lb-1", &BTreeSet::new()).await.unwrap();

        assert!(observed.is_empty());
        assert_eq!(fake.call_count(Action::DescribeListeners), 1);
        assert_eq!(fake.call_count(Action::DescribeTargets), 0);
    }

    #[tokio::test]
    async fn test_hydrates_layer4_and_layer7() {
        let fake = Arc::new(FakeProvider::new());

        let mut tcp = Listener::new("lb-1", Protocol::Tcp, 80);
        tcp.attributes.scheduler = Scheduler::LeastConn;
        tcp.target_group = Some(TargetGroup::new(vec![backend("10.0.0.1", 8080, 5)]));
        fake.seed(&tcp);

        let mut http = Listener::new("lb-1", Protocol::Http, 8000);
        http.rules = vec![Rule {
            rule_id: None,
            domain: "a.example.com".to_string(),
            path: "/api".to_string(),
            attributes: Default::default(),
            certificate: None,
            target_group: TargetGroup::new(vec![backend("10.0.0.2", 9000, 10)]),
        }];
        fake.seed(&http);

        let client = test_client(fake.clone());
        let observed = fetch_listeners(&client, "lb-1", &BTreeSet::new()).await.unwrap();

        assert_eq!(observed.len(), 2);
        let got_tcp = &observed[&tcp.key()];
        assert!(got_tcp.listener_id.is_some());
        assert_eq!(got_tcp.effective_attributes(), tcp.effective_attributes());
        assert_eq!(got_tcp.backends(), tcp.backends());

        let got_http = &observed[&http.key()];
        assert_eq!(got_http.rules.len(), 1);
        assert!(got_http.rules[0].rule_id.is_some());
        assert_eq!(got_http.rules[0].path, "/api");
        assert_eq!(got_http.rules[0].target_group.backends[0].port, 9000);
        assert_eq!(fake.call_count(Action::DescribeTargets), 1);
    }

    #[tokio::test]
    async fn test_port_filter() {
        let fake = Arc::new(FakeProvider::new());
        fake.seed(&Listener::new("lb-1", Protocol::Tcp, 80));
        fake.seed(&Listener::new("lb-1", Protocol::Udp, 53));
        let client = test_client(fake);

        let ports: BTreeSet<u16> = [53].into_iter().collect();
        let observed = fetch_listeners(&client, "lb-1", &ports).await.unwrap();

        assert_eq!(observed.len(), 1);
        assert!(observed.keys().all(|k| k.port == 53));
    }

    #[test]
    fn test_unparsable_backend_is_skipped() {
        let wires = vec![
            BackendWire {
                private_ip_addresses: vec!["not-an-ip".to_string()],
                port: 80,
                weight: 10,
            },
            BackendWire {
                private_ip_addresses: vec!["10.1.1.1".to_string()],
                port: 80,
                weight: 10,
            },
            BackendWire {
                private_ip_addresses: vec![],
                port: 80,
                weight: 10,
            },
        ];
        let backends = parse_backends(&wires);
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].ip.to_string(), "10.1.1.1");
    }
}
