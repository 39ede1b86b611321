//! Endpoint assignments.
//!
//! An [EndpointAssignment] is the dynamic counterpart of a cluster's static
//! host list: the full member set for one EDS cluster, pushed by the
//! management server. Each update replaces the previous assignment wholesale.

use serde::{Deserialize, Serialize};

use crate::cluster::EndpointSpec;
use crate::{Error, Name};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalitySpec {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
}

/// One endpoint in an assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LbEndpoint {
    pub url: String,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default)]
    pub locality: Option<LocalitySpec>,
}

fn default_weight() -> u32 {
    1
}

impl LbEndpoint {
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, Error> {
        EndpointSpec {
            url: self.url.clone(),
        }
        .socket_addr()
    }
}

/// The full member set for one cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndpointAssignment {
    pub cluster_name: Name,

    #[serde(default)]
    pub endpoints: Vec<LbEndpoint>,
}

impl EndpointAssignment {
    pub fn validate(&self) -> Result<(), Error> {
        for endpoint in &self.endpoints {
            endpoint.socket_addr()?;
        }
        Ok(())
    }
}
