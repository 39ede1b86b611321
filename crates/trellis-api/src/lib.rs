//! Trellis API configuration.
//!
//! These types express upstream cluster and bootstrap configuration as plain
//! data structures. They are the schema shared by the static bootstrap file,
//! the filesystem discovery documents, and the control-plane discovery
//! stream.
//!
//! Use this crate directly if you're building or exporting configuration. Use
//! `trellis-core` if you want to run a cluster manager against it.

mod error;
pub use error::Error;

pub mod bootstrap;
pub mod cluster;
pub mod endpoints;

pub use bootstrap::{Bootstrap, ConfigSource};
pub use cluster::{ClusterSpec, DiscoveryType, LbPolicy};
pub use endpoints::EndpointAssignment;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A validated cluster (or other resource) name.
///
/// Names are non-empty, at most [Name::MAX_LEN] bytes, and drawn from
/// `[a-zA-Z0-9_.-]`. They're immutable and cheap to clone and share.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Name(SmolStr);

impl Name {
    /// The maximum length of a name, in bytes.
    pub const MAX_LEN: usize = 60;

    /// Create a new name, validating length and character set.
    pub fn new(name: impl AsRef<str>) -> Result<Self, Error> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(Error::invalid_name(name, "must not be empty"));
        }
        if name.len() > Self::MAX_LEN {
            return Err(Error::invalid_name(name, "must be at most 60 characters"));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(Error::invalid_name(
                name,
                format!("invalid character {c:?}: names may only contain [a-zA-Z0-9_.-]"),
            ));
        }

        Ok(Self(SmolStr::new(name)))
    }

    /// Create a name from a static str, panicking if it's invalid. Meant for
    /// static data where the name is known at compile time.
    pub fn from_static(name: &'static str) -> Self {
        Self::new(name).expect("Name::from_static: invalid name")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::ops::Deref for Name {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Name {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for Name {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<String> for Name {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Name::new(&s).map_err(serde::de::Error::custom)
    }
}
