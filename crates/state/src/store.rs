//! Prefix-keyed deterministic state store with block and transaction scopes.
//!
//! The store is an ordered map from byte keys to encoded values. All
//! mutation happens through a [`BlockScope`] obtained from
//! [`StateStore::begin_block`]; the scope stages writes and applies them
//! atomically on commit. A nested [`TxScope`] gives each ordered input its
//! own staging layer so a failed input leaves the block untouched.
//!
//! Iteration is lexicographic over keys at every layer, so replicas that
//! apply the same inputs observe identical iteration order.

use crate::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Height and block time of the batch currently being applied.
///
/// Block time is the sole clock of the replicated core; nothing in the
/// state machine may consult the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    /// Block height.
    pub height: u64,
    /// Block time in nanoseconds since the unix epoch.
    pub block_time_ns: u64,
}

impl BlockContext {
    /// Create a context for the given height and block time.
    pub fn new(height: u64, block_time_ns: u64) -> Self {
        Self {
            height,
            block_time_ns,
        }
    }
}

/// Read access to state, committed or staged.
///
/// Implemented by [`StateStore`] (committed reads and snapshots) and by
/// the staging scopes.
pub trait StateRead {
    /// Get the value under `key`.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    /// All entries whose key starts with `prefix`, in lexicographic key
    /// order.
    fn iter_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;
}

/// Read/write access to staged state within a block.
///
/// Implemented by [`BlockScope`] and [`TxScope`]; module code is written
/// against this trait so it cannot tell which staging layer it runs in.
pub trait StateView: StateRead {
    /// Stage a write of `value` under `key`.
    fn set(&mut self, key: &[u8], value: Vec<u8>);
    /// Stage a deletion of `key`.
    fn delete(&mut self, key: &[u8]);
    /// The block context this view runs under.
    fn ctx(&self) -> BlockContext;
}

/// Decode a typed value, if present.
///
/// Decoding failure means the stored bytes are corrupt and is fatal.
pub fn get_typed<T: DeserializeOwned, S: StateRead + ?Sized>(
    state: &S,
    key: &[u8],
) -> Result<Option<T>, StoreError> {
    match state.get(key) {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and stage a typed value under `key`.
pub fn set_typed<T: Serialize, S: StateView + ?Sized>(
    state: &mut S,
    key: &[u8],
    value: &T,
) -> Result<(), StoreError> {
    let bytes = encode(value)?;
    state.set(key, bytes);
    Ok(())
}

/// Canonical value encoding for the state store.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Inverse of [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

/// The committed key/value state of the orchestration plane.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl StateRead for StateStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl StateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the store holds no committed entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Open a block scope. All writes for one ordered batch go through the
    /// returned scope and land atomically on [`BlockScope::commit`].
    pub fn begin_block(&mut self, ctx: BlockContext) -> BlockScope<'_> {
        BlockScope {
            base: self,
            staged: BTreeMap::new(),
            ctx,
        }
    }

    /// An immutable point-in-time copy for concurrent readers.
    pub fn snapshot(&self) -> StateStore {
        self.clone()
    }

    fn apply(&mut self, staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>) {
        for (key, value) in staged {
            match value {
                Some(bytes) => {
                    self.map.insert(key, bytes);
                }
                None => {
                    self.map.remove(&key);
                }
            }
        }
    }
}

fn overlay_get(
    staged: &BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    key: &[u8],
) -> Option<Option<Vec<u8>>> {
    staged.get(key).cloned()
}

fn overlay_merge(
    mut base: Vec<(Vec<u8>, Vec<u8>)>,
    staged: &BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    prefix: &[u8],
) -> Vec<(Vec<u8>, Vec<u8>)> {
    for (key, value) in staged.range(prefix.to_vec()..) {
        if !key.starts_with(prefix) {
            break;
        }
        let pos = base.binary_search_by(|(k, _)| k.as_slice().cmp(key.as_slice()));
        match (pos, value) {
            (Ok(i), Some(bytes)) => base[i].1 = bytes.clone(),
            (Ok(i), None) => {
                base.remove(i);
            }
            (Err(i), Some(bytes)) => base.insert(i, (key.clone(), bytes.clone())),
            (Err(_), None) => {}
        }
    }
    base
}

/// Staging layer for one ordered batch.
#[derive(Debug)]
pub struct BlockScope<'a> {
    base: &'a mut StateStore,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ctx: BlockContext,
}

impl<'a> BlockScope<'a> {
    /// Open a nested transaction scope for a single ordered input.
    pub fn begin_tx(&mut self) -> TxScope<'a, '_> {
        TxScope {
            block: self,
            staged: BTreeMap::new(),
        }
    }

    /// Apply all staged writes to the committed store.
    pub fn commit(self) {
        self.base.apply(self.staged);
    }

    /// Drop all staged writes.
    pub fn discard(self) {}
}

impl StateRead for BlockScope<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match overlay_get(&self.staged, key) {
            Some(staged) => staged,
            None => self.base.get(key),
        }
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        overlay_merge(self.base.iter_prefix(prefix), &self.staged, prefix)
    }
}

impl StateView for BlockScope<'_> {
    fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.staged.insert(key.to_vec(), Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.staged.insert(key.to_vec(), None);
    }

    fn ctx(&self) -> BlockContext {
        self.ctx
    }
}

/// Staging layer for a single ordered input within a block.
///
/// Committing merges into the enclosing block scope; discarding leaves the
/// block exactly as it was, which is how non-fatal errors keep the state
/// machine unchanged.
#[derive(Debug)]
pub struct TxScope<'a, 'b> {
    block: &'b mut BlockScope<'a>,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl TxScope<'_, '_> {
    /// Merge this input's writes into the block.
    pub fn commit(self) {
        for (key, value) in self.staged {
            self.block.staged.insert(key, value);
        }
    }

    /// Drop this input's writes.
    pub fn discard(self) {}
}

impl StateRead for TxScope<'_, '_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match overlay_get(&self.staged, key) {
            Some(staged) => staged,
            None => self.block.get(key),
        }
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        overlay_merge(self.block.iter_prefix(prefix), &self.staged, prefix)
    }
}

impl StateView for TxScope<'_, '_> {
    fn set(&mut self, key: &[u8], value: Vec<u8>) {
        self.staged.insert(key.to_vec(), Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.staged.insert(key.to_vec(), None);
    }

    fn ctx(&self) -> BlockContext {
        self.block.ctx
    }
}
