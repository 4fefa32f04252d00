//! Preimage resolver registry
//!
//! Engines ask for preimages through a callback that can only carry an
//! integer context, so resolvers live in a process-wide table addressed by
//! token. Each token belongs to a clone family of machine handles: the
//! family shares one [`ResolverRegistration`] behind an `Arc`, and the entry
//! is removed when the last handle of the family lets go of it.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, warn};

use crate::error::{Result, ValidatorError};
use crate::types::Bytes32;

/// Function from a content hash to its preimage.
pub type PreimageResolver =
    Arc<dyn Fn(Bytes32) -> std::result::Result<Vec<u8>, String> + Send + Sync>;

/// Token value meaning "no resolver bound".
pub const NO_RESOLVER: u64 = 0;

pub struct PreimageResolverRegistry {
    resolvers: DashMap<u64, PreimageResolver>,
    last_token: AtomicU64,
}

static GLOBAL_REGISTRY: OnceLock<Arc<PreimageResolverRegistry>> = OnceLock::new();

impl PreimageResolverRegistry {
    pub fn new() -> Self {
        Self {
            resolvers: DashMap::new(),
            last_token: AtomicU64::new(NO_RESOLVER),
        }
    }

    /// The registry engines call back into.
    pub fn global() -> &'static Arc<PreimageResolverRegistry> {
        GLOBAL_REGISTRY.get_or_init(|| Arc::new(PreimageResolverRegistry::new()))
    }

    /// Store `resolver` under a fresh, process-unique token.
    pub fn register(&self, resolver: PreimageResolver) -> u64 {
        let token = self.last_token.fetch_add(1, Ordering::Relaxed) + 1;
        self.resolvers.insert(token, resolver);
        debug!(token, "Registered preimage resolver");
        token
    }

    /// Register `resolver` and wrap the token in a family-owned registration
    /// that unregisters on drop.
    pub fn register_family(self: &Arc<Self>, resolver: PreimageResolver) -> Arc<ResolverRegistration> {
        let token = self.register(resolver);
        Arc::new(ResolverRegistration {
            token,
            registry: Arc::clone(self),
        })
    }

    /// Look up `token` and ask its resolver for `hash`.
    pub fn resolve(&self, token: u64, hash: Bytes32) -> Result<Vec<u8>> {
        // Clone out of the map so user code never runs under a shard lock.
        let resolver = self.resolvers.get(&token).map(|entry| Arc::clone(entry.value()));
        let Some(resolver) = resolver else {
            warn!(token, %hash, "Preimage requested with unknown resolver token");
            return Err(ValidatorError::PreimageResolutionFailed {
                token,
                hash,
                reason: "unknown resolver token".to_string(),
            });
        };
        resolver(hash).map_err(|reason| {
            error!(token, %hash, %reason, "Preimage resolution failed");
            ValidatorError::PreimageResolutionFailed {
                token,
                hash,
                reason,
            }
        })
    }

    /// Remove `token`. Returns `true` if it was present.
    pub fn unregister(&self, token: u64) -> bool {
        let removed = self.resolvers.remove(&token).is_some();
        if removed {
            debug!(token, "Unregistered preimage resolver");
        }
        removed
    }

    pub fn contains(&self, token: u64) -> bool {
        self.resolvers.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl Default for PreimageResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Ownership of one registry entry, shared by a handle clone family.
pub struct ResolverRegistration {
    token: u64,
    registry: Arc<PreimageResolverRegistry>,
}

impl ResolverRegistration {
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for ResolverRegistration {
    fn drop(&mut self) {
        self.registry.unregister(self.token);
    }
}

impl std::fmt::Debug for ResolverRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistration")
            .field("token", &self.token)
            .finish()
    }
}
