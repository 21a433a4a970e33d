use thiserror::Error;

#[derive(Debug, Error)]
pub enum PodManagerError {
    #[error("pod not found for monitor {0}")]
    NotFound(String),
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("owner reference missing or ambiguous for pod {0}")]
    UnresolvedOwner(String),
}
