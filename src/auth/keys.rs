//! Key registry and key rotation.
//!
//! Tokens carry the index of the key that signed them in the `kid` header.
//! Indices are stable for the life of a registry lineage: retiring or removing
//! a key leaves its slot in place, and new keys are always appended.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::error::KeyError;

/// A symmetric signing secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(<{} bytes>)", self.0.len())
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<Vec<u8>> for Secret {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum KeySlot {
    /// Used for issuance and verification.
    Active(Secret),
    /// Verification only, until outstanding tokens have expired.
    Retired(Secret),
    /// Tombstone. The index is never reused.
    Removed,
}

/// Ordered, immutable set of signing keys addressed by index.
///
/// Rotation methods return a new registry and leave `self` untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRegistry {
    slots: Vec<KeySlot>,
}

impl KeyRegistry {
    /// Create a registry where every key is active.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Secret>,
    {
        Self {
            slots: keys
                .into_iter()
                .map(|k| KeySlot::Active(k.into()))
                .collect(),
        }
    }

    /// Number of slots, including retired and removed ones.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Secret usable for verification at `index`.
    pub fn get(&self, index: usize) -> Result<&Secret, KeyError> {
        match self.slots.get(index) {
            Some(KeySlot::Active(secret)) | Some(KeySlot::Retired(secret)) => Ok(secret),
            Some(KeySlot::Removed) => Err(KeyError::Removed(index)),
            None => Err(KeyError::OutOfRange {
                index,
                len: self.slots.len(),
            }),
        }
    }

    /// Indices and secrets eligible for issuing new tokens, in index order.
    pub fn issuable(&self) -> Vec<(usize, &Secret)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                KeySlot::Active(secret) => Some((i, secret)),
                _ => None,
            })
            .collect()
    }

    pub fn is_active(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(KeySlot::Active(_)))
    }

    /// Append a new active key. Returns the new registry and the key's index.
    pub fn push(&self, secret: impl Into<Secret>) -> (Self, usize) {
        let mut slots = self.slots.clone();
        slots.push(KeySlot::Active(secret.into()));
        let index = slots.len() - 1;
        (Self { slots }, index)
    }

    /// Stop issuing with `index` while keeping it verifiable.
    pub fn retire(&self, index: usize) -> Result<Self, KeyError> {
        let mut slots = self.slots.clone();
        let len = slots.len();
        let slot = slots
            .get_mut(index)
            .ok_or(KeyError::OutOfRange { index, len })?;
        match slot {
            KeySlot::Active(secret) => {
                let secret = secret.clone();
                *slot = KeySlot::Retired(secret);
                Ok(Self { slots })
            }
            KeySlot::Retired(_) => Err(KeyError::AlreadyRetired(index)),
            KeySlot::Removed => Err(KeyError::Removed(index)),
        }
    }

    /// Drop a retired key. Its index stays reserved.
    pub fn remove(&self, index: usize) -> Result<Self, KeyError> {
        let mut slots = self.slots.clone();
        let len = slots.len();
        let slot = slots
            .get_mut(index)
            .ok_or(KeyError::OutOfRange { index, len })?;
        match slot {
            KeySlot::Retired(_) => {
                *slot = KeySlot::Removed;
                Ok(Self { slots })
            }
            KeySlot::Active(_) => Err(KeyError::StillActive(index)),
            KeySlot::Removed => Err(KeyError::Removed(index)),
        }
    }
}

/// Parse a `kid` header value into a registry index.
pub fn parse_kid(kid: Option<&str>) -> Result<usize, KeyError> {
    let kid = kid.ok_or(KeyError::MissingKid)?;
    kid.parse::<usize>()
        .map_err(|_| KeyError::InvalidKid(kid.to_string()))
}

/// Resolves the verification secret for a token's `kid`.
pub trait KeyLookup: Send + Sync {
    fn lookup(&self, kid: Option<&str>) -> Result<Secret, KeyError>;
}

impl KeyLookup for KeyRegistry {
    fn lookup(&self, kid: Option<&str>) -> Result<Secret, KeyError> {
        let index = parse_kid(kid)?;
        self.get(index).cloned()
    }
}

impl<F> KeyLookup for F
where
    F: Fn(Option<&str>) -> Result<Secret, KeyError> + Send + Sync,
{
    fn lookup(&self, kid: Option<&str>) -> Result<Secret, KeyError> {
        self(kid)
    }
}

/// Hot-swappable key registry.
///
/// Readers take a snapshot with [`KeyRing::load`]; rotation swaps the whole
/// registry atomically, so an in-flight validation always sees one consistent
/// set of keys.
pub struct KeyRing {
    current: ArcSwap<KeyRegistry>,
}

impl KeyRing {
    pub fn new(registry: KeyRegistry) -> Self {
        Self {
            current: ArcSwap::from_pointee(registry),
        }
    }

    /// Snapshot of the current registry.
    pub fn load(&self) -> Arc<KeyRegistry> {
        self.current.load_full()
    }

    /// Replace the registry wholesale.
    pub fn store(&self, registry: KeyRegistry) {
        self.current.store(Arc::new(registry));
    }

    /// Append a new active key and return its index.
    pub fn add_key(&self, secret: impl Into<Secret>) -> usize {
        let secret = secret.into();
        let mut index = 0;
        self.current.rcu(|current| {
            let (next, i) = current.push(secret.clone());
            index = i;
            next
        });
        info!(kid = index, "added signing key");
        index
    }

    /// Retire a key from issuance.
    pub fn retire(&self, index: usize) -> Result<(), KeyError> {
        self.update(|current| current.retire(index))?;
        info!(kid = index, "retired signing key");
        Ok(())
    }

    /// Remove a retired key once its tokens can no longer be presented.
    pub fn remove(&self, index: usize) -> Result<(), KeyError> {
        self.update(|current| current.remove(index))?;
        info!(kid = index, "removed signing key");
        Ok(())
    }

    /// Compare-and-swap loop over the current registry. On error the
    /// registry is left as it was.
    fn update<F>(&self, f: F) -> Result<(), KeyError>
    where
        F: Fn(&KeyRegistry) -> Result<KeyRegistry, KeyError>,
    {
        let mut outcome = Ok(());
        self.current.rcu(|current| match f(current) {
            Ok(next) => {
                outcome = Ok(());
                Arc::new(next)
            }
            Err(err) => {
                outcome = Err(err);
                Arc::clone(current)
            }
        });
        outcome
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("keys", &self.load().len())
            .finish()
    }
}

impl KeyLookup for KeyRing {
    fn lookup(&self, kid: Option<&str>) -> Result<Secret, KeyError> {
        self.load().lookup(kid)
    }
}
