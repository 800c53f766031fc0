//! Docker and Swarm as a discovery source
//!
//! Plain containers are tracked by container id. Containers that are tasks
//! of a Swarm service are skipped; the service itself is tracked instead,
//! keyed by service id and addressed by service name.

use crate::discovery::{ContainerSource, LifecycleAction, LifecycleEvent, Workload};
use crate::model::SourceKind;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage, EventMessageTypeEnum, Service};
use bollard::service::{InspectServiceOptions, ListServicesOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::debug;

const SWARM_SERVICE_LABEL: &str = "com.docker.swarm.service.id";

pub struct DockerSource {
    client: Docker,
    label_prefix: String,
}

impl DockerSource {
    /// Connect to `docker_host`, `DOCKER_HOST`, or the local socket, in that order
    pub async fn connect(docker_host: Option<&str>, label_prefix: &str) -> Result<Self> {
        let client = match docker_host.map(str::to_string).or_else(|| std::env::var("DOCKER_HOST").ok()) {
            Some(host) => connect_to_host(&host)?,
            None => Docker::connect_with_socket_defaults()
                .context("Cannot connect to the local Docker socket; set discovery.docker_host or DOCKER_HOST")?,
        };

        client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Docker daemon is not responding: {}", e))?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            label_prefix: label_prefix.to_string(),
        })
    }

    fn enable_filter(&self) -> HashMap<String, Vec<String>> {
        HashMap::from([(
            "label".to_string(),
            vec![format!("{}.enable=true", self.label_prefix)],
        )])
    }

    async fn list_containers(&self) -> Result<Vec<Workload>> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                filters: self.enable_filter(),
                ..Default::default()
            }))
            .await
            .context("Failed to list containers")?;

        Ok(containers.into_iter().filter_map(container_summary_workload).collect())
    }

    /// Swarm services; empty when the daemon is not a swarm manager
    async fn list_services(&self) -> Vec<Workload> {
        let options = ListServicesOptions::<String> {
            filters: self.enable_filter(),
            ..Default::default()
        };

        match self.client.list_services(Some(options)).await {
            Ok(services) => services.into_iter().filter_map(service_workload).collect(),
            Err(e) => {
                debug!(error = %e, "Swarm services unavailable");
                Vec::new()
            }
        }
    }
}

fn connect_to_host(host: &str) -> Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

#[async_trait]
impl ContainerSource for DockerSource {
    async fn list_workloads(&self) -> Result<Vec<Workload>> {
        let mut workloads = self.list_containers().await?;
        workloads.extend(self.list_services().await);
        Ok(workloads)
    }

    async fn inspect(&self, kind: SourceKind, source_id: &str) -> Result<Option<Workload>> {
        match kind {
            SourceKind::Container => {
                match self
                    .client
                    .inspect_container(source_id, None::<InspectContainerOptions>)
                    .await
                {
                    Ok(response) => Ok(container_inspect_workload(response)),
                    Err(e) if is_not_found(&e) => Ok(None),
                    Err(e) => Err(e).with_context(|| format!("Failed to inspect container {}", source_id)),
                }
            }
            SourceKind::OrchestratedWorkload => {
                match self
                    .client
                    .inspect_service(source_id, None::<InspectServiceOptions>)
                    .await
                {
                    Ok(service) => Ok(service_workload(service)),
                    Err(e) if is_not_found(&e) => Ok(None),
                    Err(e) => Err(e).with_context(|| format!("Failed to inspect service {}", source_id)),
                }
            }
        }
    }

    fn events(&self) -> BoxStream<'static, Result<LifecycleEvent>> {
        let filters = HashMap::from([(
            "type".to_string(),
            vec!["container".to_string(), "service".to_string()],
        )]);

        self.client
            .events(Some(EventsOptions::<String> {
                since: None,
                until: None,
                filters,
            }))
            .filter_map(|item| async move {
                match item {
                    Ok(message) => lifecycle_event(message).map(Ok),
                    Err(e) => Some(Err(anyhow::Error::new(e).context("Docker event stream error"))),
                }
            })
            .boxed()
    }
}

// ==================== Mapping ====================

fn lifecycle_event(message: EventMessage) -> Option<LifecycleEvent> {
    let kind = match message.typ? {
        EventMessageTypeEnum::CONTAINER => SourceKind::Container,
        EventMessageTypeEnum::SERVICE => SourceKind::OrchestratedWorkload,
        _ => return None,
    };
    let action = LifecycleAction::parse(message.action.as_deref()?)?;
    let actor = message.actor?;

    // swarm tasks are followed through their service
    if kind == SourceKind::Container
        && actor
            .attributes
            .as_ref()
            .map(|attrs| attrs.contains_key(SWARM_SERVICE_LABEL))
            .unwrap_or(false)
    {
        return None;
    }

    Some(LifecycleEvent {
        action,
        kind,
        source_id: actor.id?,
    })
}

fn container_summary_workload(summary: ContainerSummary) -> Option<Workload> {
    let labels = summary.labels.unwrap_or_default();
    if labels.contains_key(SWARM_SERVICE_LABEL) {
        return None;
    }

    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())?;

    let address = summary
        .network_settings
        .and_then(|settings| settings.networks)
        .and_then(|networks| {
            networks
                .into_values()
                .filter_map(|endpoint| endpoint.ip_address)
                .find(|ip| !ip.is_empty())
        })
        .or_else(|| Some(name.clone()));

    let mut ports: Vec<u16> = summary
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|port| port.private_port)
        .collect();
    ports.sort_unstable();
    ports.dedup();

    Some(Workload {
        kind: SourceKind::Container,
        source_id: summary.id?,
        name,
        labels,
        address,
        ports,
    })
}

fn container_inspect_workload(response: ContainerInspectResponse) -> Option<Workload> {
    let running = response
        .state
        .as_ref()
        .and_then(|state| state.running)
        .unwrap_or(false);
    if !running {
        return None;
    }

    let config = response.config.unwrap_or_default();
    let labels = config.labels.unwrap_or_default();
    if labels.contains_key(SWARM_SERVICE_LABEL) {
        return None;
    }

    let name = response.name.map(|n| n.trim_start_matches('/').to_string())?;

    let address = response
        .network_settings
        .and_then(|settings| settings.networks)
        .and_then(|networks| {
            networks
                .into_values()
                .filter_map(|endpoint| endpoint.ip_address)
                .find(|ip| !ip.is_empty())
        })
        .or_else(|| Some(name.clone()));

    let mut ports: Vec<u16> = config
        .exposed_ports
        .map(|exposed| exposed.keys().filter_map(|key| parse_port_key(key)).collect())
        .unwrap_or_default();
    ports.sort_unstable();
    ports.dedup();

    Some(Workload {
        kind: SourceKind::Container,
        source_id: response.id?,
        name,
        labels,
        address,
        ports,
    })
}

fn service_workload(service: Service) -> Option<Workload> {
    let spec = service.spec?;
    let name = spec.name?;

    let mut ports: Vec<u16> = service
        .endpoint
        .and_then(|endpoint| endpoint.ports)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|port| port.target_port)
        .filter_map(|port| u16::try_from(port).ok())
        .collect();
    ports.sort_unstable();
    ports.dedup();

    Some(Workload {
        kind: SourceKind::OrchestratedWorkload,
        source_id: service.id?,
        address: Some(name.clone()),
        name,
        labels: spec.labels.unwrap_or_default(),
        ports,
    })
}

/// `"8080/tcp"` -> 8080
fn parse_port_key(key: &str) -> Option<u16> {
    key.split('/').next()?.parse().ok()
}
