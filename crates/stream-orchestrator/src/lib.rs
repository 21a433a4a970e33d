#![forbid(unsafe_code)]

pub mod error;
pub mod failure_watcher;
pub mod pod_manager;
pub mod reconciler;

pub use error::PodManagerError;
pub use failure_watcher::PodFailureWatcher;
pub use pod_manager::{KubePodManager, PodManager, PodPhase, WorkerPodInfo, WorkerPodSpec, MONITOR_LABEL};
pub use reconciler::{ReconcileReport, Reconciler};
