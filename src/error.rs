use derive_more::From;
use k8s_openapi::serde_json;

use crate::k8s::watch::WatchError;

pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by client setup, discovery and the CLI. Sync tasks never
/// return these; they report `WatchError`s through the store instead.
#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Kube(kube::Error),

    /// No usable kubeconfig or in-cluster environment
    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    HttpHeader(hyper::http::Error),

    /// Failure to build a request against the resource path
    #[from]
    Request(kube::core::request::Error),

    #[from]
    Io(std::io::Error),

    #[from]
    Watch(WatchError),

    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::Json(e) => write!(f, "invalid JSON: {e}"),
            Self::Kube(e) => write!(f, "kubernetes API: {e}"),
            Self::Infer(e) => write!(f, "kube config: {e}"),
            Self::HttpHeader(e) => write!(f, "http: {e}"),
            Self::Request(e) => write!(f, "request: {e}"),
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Watch(e) => write!(f, "watch: {e}"),
            Self::Custom(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::Kube(e) => Some(e),
            Self::Infer(e) => Some(e),
            Self::HttpHeader(e) => Some(e),
            Self::Request(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Watch(e) => Some(e),
            Self::Custom(_) => None,
        }
    }
}
