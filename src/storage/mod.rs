//! Storage collaborator interface
//!
//! The cache never talks to the cluster itself. It drives the storage library
//! through the traits below: a connector opens instances, an instance opens
//! tables, a table opens readers, and every handle can be released and probed.

pub mod memory;

use crate::error::{CacheError, Result, StorageResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use memory::{MemoryConnector, MemoryInstance, MemoryReader, MemoryTable};

/// Kind of resource held by the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Instance,
    Table,
    Reader,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Instance => write!(f, "instance"),
            ResourceKind::Table => write!(f, "table"),
            ResourceKind::Reader => write!(f, "reader"),
        }
    }
}

/// An open handle that must be released exactly once
///
/// `Display` is used to name the resource in logs and health issues.
#[async_trait]
pub trait Resource: fmt::Display + Send + Sync + 'static {
    /// Release the underlying connection
    async fn release(&self) -> StorageResult<()>;

    /// Lightweight liveness probe.
    ///
    /// Instances answer with a metadata lookup, tables with a capability
    /// lookup and readers with an empty read of a zero-length key. Probes
    /// must not have side effects.
    async fn probe(&self) -> StorageResult<()>;
}

/// Handle to an open table reader
pub trait StorageReader: Resource {}

/// Handle to an open table
#[async_trait]
pub trait StorageTable: Resource {
    type Reader: StorageReader;

    async fn open_reader(&self) -> StorageResult<Self::Reader>;
}

/// Handle to an open storage instance
#[async_trait]
pub trait StorageInstance: Resource {
    type Table: StorageTable;

    async fn open_table(&self, name: &str) -> StorageResult<Self::Table>;
}

/// Entry point into the storage library
#[async_trait]
pub trait StorageConnector: Send + Sync + 'static {
    type Instance: StorageInstance;

    async fn open_instance(&self, uri: &InstanceUri) -> StorageResult<Self::Instance>;
}

/// Table handle type produced by a connector
pub type TableOf<C> = <<C as StorageConnector>::Instance as StorageInstance>::Table;

/// Reader handle type produced by a connector
pub type ReaderOf<C> = <TableOf<C> as StorageTable>::Reader;

/// Address of a storage instance: the cluster it lives in plus its name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceUri {
    cluster: String,
    instance: String,
}

impl InstanceUri {
    pub fn new(cluster: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into().trim_end_matches('/').to_string(),
            instance: instance.into(),
        }
    }

    /// Build the URI of `instance` inside the cluster addressed by `cluster_uri`
    pub fn for_instance(cluster_uri: &InstanceUri, instance: impl Into<String>) -> Self {
        Self::new(cluster_uri.cluster.clone(), instance)
    }

    /// Parse `scheme://host[:port]/instance`
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| CacheError::Config(format!("missing scheme in URI '{}'", uri)))?;

        let (authority, instance) = rest
            .split_once('/')
            .ok_or_else(|| CacheError::Config(format!("missing instance in URI '{}'", uri)))?;

        let instance = instance.trim_end_matches('/');
        if scheme.is_empty() || authority.is_empty() || instance.is_empty() || instance.contains('/')
        {
            return Err(CacheError::Config(format!("malformed instance URI '{}'", uri)));
        }

        Ok(Self::new(format!("{}://{}", scheme, authority), instance))
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }
}

impl fmt::Display for InstanceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.instance)
    }
}
