use std::borrow::Cow;

/// An error in cluster or bootstrap configuration.
///
/// Configuration errors are schema-level problems: they mean the input can't
/// describe a valid cluster set, independent of any runtime state.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: Cow<'static, str> },

    #[error("invalid endpoint url {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: Cow<'static, str> },

    #[error("duplicate cluster {name:?}")]
    DuplicateCluster { name: String },

    #[error("local cluster {name:?} is not in the cluster list")]
    MissingLocalCluster { name: String },

    #[error("cluster {cluster:?}: {reason}")]
    InvalidCluster { cluster: String, reason: Cow<'static, str> },
}

impl Error {
    pub(crate) fn invalid_name(name: &str, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_endpoint(url: &str, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidEndpoint {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_cluster(cluster: &str, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidCluster {
            cluster: cluster.to_string(),
            reason: reason.into(),
        }
    }
}
