//! The boundary to an external WebAssembly runtime.
//!
//! The overlay only moves artifact bytes around. An artifact is stored under the hash of its
//! bytes, fetched back through the DHT and handed to an [`ArtifactRuntime`] that loads and calls
//! it; the DHT never looks inside a module.
use std::error;

use thiserror::Error;

use crate::key::Key;
use crate::node::Node;

/// A WebAssembly interpreter or engine that executes artifacts fetched from the overlay.
pub trait ArtifactRuntime {
    type Module;
    type Value;
    type Error: error::Error + Send + Sync + 'static;

    fn load_module(&self, bytes: &[u8]) -> Result<Self::Module, Self::Error>;

    fn call(
        &self,
        module: &Self::Module,
        function: &str,
        args: &[Self::Value],
    ) -> Result<Vec<Self::Value>, Self::Error>;
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact {0:?} not found")]
    NotFound(Key),

    /// The bytes found under the key do not hash to it.
    #[error("artifact {0:?} does not match its key")]
    Corrupted(Key),

    #[error("runtime error: {0}")]
    Runtime(#[source] Box<dyn error::Error + Send + Sync>),
}

impl Node {
    /// Returns the key an artifact is stored under.
    pub fn artifact_key(&self, bytes: &[u8]) -> Key {
        Key::hash(bytes).masked(self.config().id_bits)
    }

    /// Publishes an artifact under the hash of its bytes and returns that key.
    pub fn publish_artifact(&self, bytes: &[u8]) -> Key {
        let key = self.artifact_key(bytes);
        let acks = self.put(key, bytes.to_vec());
        info!(
            "{} - Published artifact {:?} to {} nodes",
            self.contact().addr,
            key,
            acks
        );
        key
    }

    /// Fetches the artifact stored under `key` and checks that its bytes hash to `key`.
    pub fn fetch_artifact(&self, key: &Key) -> Result<Vec<u8>, ArtifactError> {
        let bytes = self.get(key).ok_or(ArtifactError::NotFound(*key))?;
        if self.artifact_key(&bytes) != *key {
            return Err(ArtifactError::Corrupted(*key));
        }
        Ok(bytes)
    }
}

/// Fetches the artifact stored under `key`, loads it into `runtime` and calls `function`.
pub fn run_artifact<R: ArtifactRuntime>(
    node: &Node,
    runtime: &R,
    key: &Key,
    function: &str,
    args: &[R::Value],
) -> Result<Vec<R::Value>, ArtifactError> {
    let bytes = node.fetch_artifact(key)?;
    let module = runtime
        .load_module(&bytes)
        .map_err(|err| ArtifactError::Runtime(Box::new(err)))?;
    runtime
        .call(&module, function, args)
        .map_err(|err| ArtifactError::Runtime(Box::new(err)))
}
