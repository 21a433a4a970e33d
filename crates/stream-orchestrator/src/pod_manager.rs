//! Kubernetes pod lifecycle for workers: one Pod per active `Monitor`,
//! labeled so it can be found again by monitor id without a side index.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, ObjectList, PostParams};
use kube::{Api, Client};

use crate::error::PodManagerError;

pub const MONITOR_LABEL: &str = "stream-monitor.io/monitor-id";
pub const APP_LABEL_SELECTOR: &str = "app=stream-worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn from_str(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPodInfo {
    pub monitor_id: String,
    pub pod_name: String,
    pub phase: PodPhase,
    pub node_name: Option<String>,
    pub resource_version: Option<String>,
}

fn pod_name_for(monitor_id: &str) -> String {
    format!("stream-worker-{monitor_id}")
}

fn worker_pod_info(pod: &Pod) -> WorkerPodInfo {
    let monitor_id = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(MONITOR_LABEL))
        .cloned()
        .unwrap_or_default();
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(PodPhase::from_str)
        .unwrap_or(PodPhase::Unknown);
    let node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone());
    WorkerPodInfo {
        monitor_id,
        pod_name: pod.metadata.name.clone().unwrap_or_default(),
        phase,
        node_name,
        resource_version: pod.metadata.resource_version.clone(),
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPodSpec {
    pub monitor_id: String,
    pub stream_url: String,
    /// Operator-supplied external URL the worker delivers webhooks to.
    pub callback_url: String,
    /// Cluster-internal Gateway base URL the worker calls for its status
    /// heartbeat, terminate, and event-recording calls.
    pub control_plane_url: String,
    pub extra_env: Vec<(String, String)>,
}

/// Abstraction over the pod lifecycle so the reconciler and control API
/// can be tested against a fake without a live cluster.
#[async_trait]
pub trait PodManager: Send + Sync {
    async fn create_worker(&self, spec: WorkerPodSpec) -> Result<WorkerPodInfo, PodManagerError>;

    async fn delete_worker(&self, monitor_id: &str) -> Result<(), PodManagerError>;

    async fn get_worker(&self, monitor_id: &str) -> Result<Option<WorkerPodInfo>, PodManagerError>;

    /// Returns all worker pods plus the list's resource version, used as
    /// the watch's starting bookmark.
    async fn list_workers(&self) -> Result<(Vec<WorkerPodInfo>, String), PodManagerError>;

    async fn resolve_owner(&self, pod_name: &str) -> Result<String, PodManagerError>;
}

pub struct KubePodManager {
    client: Client,
    namespace: String,
    worker_image: String,
}

impl KubePodManager {
    pub fn new(client: Client, namespace: impl Into<String>, worker_image: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            worker_image: worker_image.into(),
        }
    }

    fn api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn build_pod(&self, spec: &WorkerPodSpec) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "stream-worker".to_string());
        labels.insert(MONITOR_LABEL.to_string(), spec.monitor_id.clone());

        let mut env = vec![
            EnvVar {
                name: "MONITOR_ID".to_string(),
                value: Some(spec.monitor_id.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "STREAM_URL".to_string(),
                value: Some(spec.stream_url.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "CALLBACK_URL".to_string(),
                value: Some(spec.callback_url.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "WEBHOOK_URL".to_string(),
                value: Some(spec.control_plane_url.clone()),
                ..Default::default()
            },
        ];
        for (k, v) in &spec.extra_env {
            env.push(EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            });
        }

        Pod {
            metadata: ObjectMeta {
                name: Some(pod_name_for(&spec.monitor_id)),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "worker".to_string(),
                    image: Some(self.worker_image.clone()),
                    env: Some(env),
                    resources: Some(ResourceRequirements::default()),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            status: None,
        }
    }
}

#[async_trait]
impl PodManager for KubePodManager {
    async fn create_worker(&self, spec: WorkerPodSpec) -> Result<WorkerPodInfo, PodManagerError> {
        let pod = self.build_pod(&spec);
        let created = self.api().create(&PostParams::default(), &pod).await?;
        Ok(worker_pod_info(&created))
    }

    async fn delete_worker(&self, monitor_id: &str) -> Result<(), PodManagerError> {
        let name = pod_name_for(monitor_id);
        match self.api().delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(PodManagerError::Kube(e)),
        }
    }

    async fn get_worker(&self, monitor_id: &str) -> Result<Option<WorkerPodInfo>, PodManagerError> {
        let name = pod_name_for(monitor_id);
        match self.api().get(&name).await {
            Ok(pod) => Ok(Some(worker_pod_info(&pod))),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(PodManagerError::Kube(e)),
        }
    }

    async fn list_workers(&self) -> Result<(Vec<WorkerPodInfo>, String), PodManagerError> {
        let lp = ListParams::default().labels(APP_LABEL_SELECTOR);
        let list: ObjectList<Pod> = self.api().list(&lp).await?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let items = list.items.iter().map(worker_pod_info).collect();
        Ok((items, resource_version))
    }

    async fn resolve_owner(&self, pod_name: &str) -> Result<String, PodManagerError> {
        let pod = self.api().get(pod_name).await?;
        pod.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(MONITOR_LABEL))
            .cloned()
            .ok_or_else(|| PodManagerError::UnresolvedOwner(pod_name.to_string()))
    }
}
