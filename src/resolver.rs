//! Hostname to backend resolution
//!
//! [`Resolver`] ties the pipeline together:
//!
//! 1. parse the hostname into a [`HostDescriptor`]
//! 2. admit the request through the [`ConcurrencyGuard`]
//! 3. provision once per identity, coalescing concurrent callers
//! 4. locate the running container
//!
//! Every failure degrades to "no backend"; nothing here returns an error to
//! the transport.

use crate::descriptor::{HostDescriptor, HostParser, IdentityKey};
use crate::flight::{self, FlightState, FlightStats, Registration, SingleFlight};
use crate::guard::{ConcurrencyGuard, GuardStats};
use crate::locator::{BackendAddress, Locator};
use crate::provisioner::{ProvisionReport, Provisioner};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Narrow seam between the transport and resolution
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Backend for `hostname` (`host:port`), or `None` when there is none
    async fn resolve(&self, hostname: &str) -> Option<BackendAddress>;

    /// True once the resolver stops admitting new work
    fn is_draining(&self) -> bool {
        false
    }

    /// `ip:port` for `hostname`, or an empty string
    async fn convert_host(&self, hostname: &str) -> String {
        self.resolve(hostname)
            .await
            .map(|address| address.to_string())
            .unwrap_or_default()
    }
}

/// Shared result of one provisioning run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    Ready(ProvisionReport),
    Failed(String),
}

/// Operator view of one tracked identity
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub container_name: String,
    pub image_tag: String,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolverStats {
    pub provisioning: FlightStats,
    pub guard: GuardStats,
    pub tracked: usize,
}

pub struct Resolver {
    parser: HostParser,
    provisioner: Arc<Provisioner>,
    locator: Locator,
    guard: Arc<ConcurrencyGuard>,
    flights: Arc<SingleFlight<IdentityKey, Provisioned>>,
    retain_provisioned: bool,
}

impl Resolver {
    pub fn new(
        parser: HostParser,
        provisioner: Provisioner,
        locator: Locator,
        guard: Arc<ConcurrencyGuard>,
        retain_provisioned: bool,
    ) -> Self {
        Self {
            parser,
            provisioner: Arc::new(provisioner),
            locator,
            guard,
            flights: Arc::new(SingleFlight::new()),
            retain_provisioned,
        }
    }

    pub fn guard(&self) -> &Arc<ConcurrencyGuard> {
        &self.guard
    }

    /// Ensure the backend for `descriptor` has been provisioned.
    ///
    /// The first caller for an identity spawns the work; everyone else waits on
    /// its result. The spawned task waits for a background permit itself, so
    /// dropping the caller never abandons the flight.
    pub async fn provision(&self, descriptor: &HostDescriptor) -> Provisioned {
        self.provision_tracked(descriptor).await.0
    }

    /// Like [`Resolver::provision`], also reporting whether the outcome came
    /// from a retained result rather than a run started or joined just now
    async fn provision_tracked(&self, descriptor: &HostDescriptor) -> (Provisioned, bool) {
        let rx = match self.flights.register(descriptor.identity()) {
            Registration::Ready(outcome) => return (outcome, true),
            Registration::Follower(rx) => {
                debug!(key = %descriptor.identity(), "Joining in-flight provisioning");
                rx
            }
            Registration::Leader(leader) => {
                let rx = leader.subscribe();
                let provisioner = self.provisioner.clone();
                let guard = self.guard.clone();
                let flights = self.flights.clone();
                let retain = self.retain_provisioned;
                let descriptor = descriptor.clone();

                tokio::spawn(async move {
                    let _permit = match guard.acquire_background().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            flights.complete(leader, Provisioned::Failed(e.to_string()), false);
                            return;
                        }
                    };

                    let result = AssertUnwindSafe(provisioner.ensure_running(&descriptor))
                        .catch_unwind()
                        .await;

                    let outcome = match result {
                        Ok(Ok(report)) => Provisioned::Ready(report),
                        Ok(Err(e)) => {
                            warn!(key = %leader.key(), error = %e, "Provisioning failed");
                            Provisioned::Failed(e.to_string())
                        }
                        Err(_) => {
                            error!(key = %leader.key(), "Provisioning task panicked");
                            Provisioned::Failed("provisioning task panicked".to_string())
                        }
                    };

                    let keep = retain && matches!(outcome, Provisioned::Ready(_));
                    flights.complete(leader, outcome, keep);
                });
                rx
            }
        };

        let outcome = flight::wait(rx)
            .await
            .unwrap_or_else(|| Provisioned::Failed("provisioning ended without a result".to_string()));
        (outcome, false)
    }

    /// Drop the retained result for a container so the next request
    /// provisions it again
    pub fn forget(&self, container_name: &str) -> bool {
        let key = self
            .flights
            .entries()
            .into_iter()
            .map(|(key, _)| key)
            .find(|key| key.container_name() == container_name);

        match key {
            Some(key) => {
                let forgotten = self.flights.forget(&key);
                if forgotten {
                    info!(container = container_name, "Forgot provisioned backend");
                }
                forgotten
            }
            None => false,
        }
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        let mut instances: Vec<InstanceInfo> = self
            .flights
            .entries()
            .into_iter()
            .map(|(key, state)| {
                let (state, head_commit, error) = match state {
                    FlightState::InFlight => ("provisioning", None, None),
                    FlightState::Done(Provisioned::Ready(report)) => {
                        ("ready", Some(report.head_commit), None)
                    }
                    FlightState::Done(Provisioned::Failed(e)) => ("failed", None, Some(e)),
                };
                InstanceInfo {
                    container_name: key.container_name(),
                    image_tag: key.image_tag(),
                    state,
                    head_commit,
                    error,
                }
            })
            .collect();
        instances.sort_by(|a, b| a.container_name.cmp(&b.container_name));
        instances
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            provisioning: self.flights.stats(),
            guard: self.guard.stats(),
            tracked: self.flights.len(),
        }
    }
}

#[async_trait]
impl HostResolver for Resolver {
    async fn resolve(&self, hostname: &str) -> Option<BackendAddress> {
        let descriptor = match self.parser.parse(hostname) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(host = hostname, error = %e, "Hostname does not name a repository");
                return None;
            }
        };

        let _admission = match self.guard.admit().await {
            Ok(permit) => permit,
            Err(e) => {
                debug!(host = hostname, error = %e, "Resolution refused");
                return None;
            }
        };

        let (outcome, retained) = self.provision_tracked(&descriptor).await;
        if let Provisioned::Failed(e) = &outcome {
            debug!(host = hostname, error = %e, "Continuing without provisioning");
        }

        match self.locator.locate(&descriptor).await {
            Ok(address) => return Some(address),
            Err(e) if retained => {
                // Container went away after it was provisioned; run the sequence again
                info!(host = hostname, error = %e, "Retained backend not locatable, provisioning again");
                self.flights.forget(&descriptor.identity());
                self.provision_tracked(&descriptor).await;
            }
            Err(e) => {
                warn!(host = hostname, error = %e, "Backend not locatable");
                return None;
            }
        }

        match self.locator.locate(&descriptor).await {
            Ok(address) => Some(address),
            Err(e) => {
                warn!(host = hostname, error = %e, "Backend not locatable");
                None
            }
        }
    }

    fn is_draining(&self) -> bool {
        self.guard.is_draining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedRunner, Step};

    fn resolver(runner: &Arc<ScriptedRunner>, retain: bool) -> Resolver {
        Resolver::new(
            HostParser::default(),
            Provisioner::new(runner.clone(), "/opt/src", "https"),
            Locator::new(runner.clone()),
            Arc::new(ConcurrencyGuard::new(2, 10, 10)),
            retain,
        )
    }

    #[tokio::test]
    async fn test_convert_host_formats_address() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.set_inspection("master.app.acme.github.com", "172.17.0.2:4000/tcp");
        let resolver = resolver(&runner, true);

        assert_eq!(
            resolver.convert_host("master.app.acme.github.com.moorage:3000").await,
            "172.17.0.2:4000"
        );
        assert_eq!(resolver.convert_host("example.com:80").await, "");
    }

    #[tokio::test]
    async fn test_instances_report_state() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.set_inspection("master.app.acme.github.com", "172.17.0.2:4000/tcp");
        let resolver = resolver(&runner, true);

        resolver.resolve("master.app.acme.github.com.moorage:3000").await;
        let instances = resolver.instances();

        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].container_name, "master.app.acme.github.com");
        assert_eq!(instances[0].image_tag, "github.com/acme/app:master");
        assert_eq!(instances[0].state, "ready");
    }

    #[tokio::test]
    async fn test_without_retention_every_request_provisions() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.set_inspection("master.app.acme.github.com", "172.17.0.2:4000/tcp");
        let resolver = resolver(&runner, false);

        resolver.resolve("master.app.acme.github.com.moorage:3000").await;
        resolver.resolve("master.app.acme.github.com.moorage:3000").await;

        assert_eq!(runner.runs(), 2);
        assert_eq!(runner.clones(), 1);
        assert_eq!(runner.builds(), 1);
        assert!(resolver.instances().is_empty());
    }

    #[tokio::test]
    async fn test_provision_failure_still_locates() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.set_failing(Step::Clone, true);
        runner.set_inspection("master.app.acme.github.com", "172.17.0.2:4000/tcp");
        let resolver = resolver(&runner, true);

        let address = resolver
            .resolve("master.app.acme.github.com.moorage:3000")
            .await;
        assert_eq!(address, Some(BackendAddress::new("172.17.0.2", 4000)));
        assert!(resolver.instances().is_empty());
    }
}
