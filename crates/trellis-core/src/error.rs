use std::borrow::Cow;

/// A `Result` alias where the `Err` case is `trellis_core::Error`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A schema-level configuration problem. Fatal during bootstrap; during a
    /// dynamic update it rejects the update and leaves prior state intact.
    #[error(transparent)]
    Config(#[from] trellis_api::Error),

    /// A cluster definition that passed the schema but can't be turned into a
    /// running cluster: unknown discovery or load balancer kind, a bad
    /// endpoint, a broken TLS context.
    #[error("cluster creation failed: {0}")]
    ClusterCreation(Cow<'static, str>),

    /// The caller named a cluster that doesn't exist. By contract the raw
    /// connection and async client interfaces require the cluster to exist,
    /// so this is a caller bug rather than a data-plane event.
    #[error("unknown cluster {0:?}")]
    NoSuchCluster(String),

    /// A bootstrap-level wiring problem, like a discovery source naming a
    /// cluster that isn't in the primary set.
    #[error("bootstrap error: {0}")]
    Bootstrap(Cow<'static, str>),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn cluster_creation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::ClusterCreation(message.into())
    }

    pub(crate) fn bootstrap(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Bootstrap(message.into())
    }
}
