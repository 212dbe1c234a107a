/**
 * Error taxonomy for the watch layer
 */
use thiserror::Error;

/// Failure reported to consumers inside the `(data, loaded, error)` tuple.
///
/// Cloneable and comparable so it can sit in the store and take part in
/// memoized snapshot comparison.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    /// A page or object read failed; retried on the next poll or reload
    #[error("fetch failed ({}): {message}", code.map_or_else(|| "no status".to_string(), |c| c.to_string()))]
    Fetch { code: Option<u16>, message: String },

    /// The streaming connection could not be (re)established in time
    #[error("watch connection lost: {0}")]
    ConnectionLost(String),

    /// The watched object does not exist or was deleted
    #[error("{0} not found")]
    NotFound(String),

    /// The starting resourceVersion is too old to resume from
    #[error("resource version expired: {0}")]
    Expired(String),

    /// The resource kind is unknown to the client after discovery completed
    #[error("no model registered for {kind}")]
    NoModel { kind: String },
}

impl WatchError {
    /// Build a fetch error from an HTTP status and message
    #[must_use]
    pub fn fetch(code: Option<u16>, message: impl Into<String>) -> Self {
        match code {
            Some(404) => Self::NotFound(message.into()),
            Some(410) => Self::Expired(message.into()),
            _ => Self::Fetch {
                code,
                message: message.into(),
            },
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<kube::Error> for WatchError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(response) => Self::fetch(Some(response.code), response.message),
            other => Self::Fetch {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

impl From<kube::core::request::Error> for WatchError {
    fn from(e: kube::core::request::Error) -> Self {
        Self::Fetch {
            code: None,
            message: e.to_string(),
        }
    }
}

/// Failure inside a streaming transport. Never surfaced to consumers directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("transport is not open")]
    NotOpen,

    #[error("transport does not accept outbound messages")]
    SendUnsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_classifies_status_codes() {
        assert!(WatchError::fetch(Some(404), "pods \"x\"").is_not_found());
        assert!(matches!(WatchError::fetch(Some(410), "too old"), WatchError::Expired(_)));
        assert_eq!(
            WatchError::fetch(Some(500), "boom"),
            WatchError::Fetch {
                code: Some(500),
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_display() {
        let e = WatchError::fetch(None, "connection refused");
        assert_eq!(e.to_string(), "fetch failed (no status): connection refused");
        let e = WatchError::NoModel {
            kind: "example.com~v1~Widget".to_string(),
        };
        assert_eq!(e.to_string(), "no model registered for example.com~v1~Widget");
    }

    #[test]
    fn test_from_kube_api_error() {
        let err = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "Forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        assert_eq!(
            WatchError::from(err),
            WatchError::Fetch {
                code: Some(403),
                message: "Forbidden".to_string()
            }
        );
    }
}
