//! Collaborator adapters (cAdapter).
//!
//! Submodules:
//! - `s3`: object-store client backed by `aws-sdk-s3`
//! - `memory`: in-process object store that counts calls, for tests and demos
//! - `ssh`: remote-shell execution through the system `ssh` binary
//!
//! The backends only see the traits below; wire protocols stay in here.

pub mod memory;
pub mod s3;
pub mod ssh;

use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<SystemTime>,
}

/// One listing response. With a delimiter, `common_prefixes` holds the
/// "sub-directories" (each ending in `/`); without one it is empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectListing {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
}

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Lists keys under `prefix`; `recursive = false` groups on `/`.
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> Result<ObjectListing>;

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Whether anything at all is stored under `prefix`.
    async fn has_prefix(&self, bucket: &str, prefix: &str) -> Result<bool> {
        let listing = self.list(bucket, prefix, false).await?;
        Ok(!listing.objects.is_empty() || !listing.common_prefixes.is_empty())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ShellOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs one shell command line on a remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(&self, host: &str, command: &str, stdin: Option<&[u8]>) -> Result<ShellOutput>;
}
