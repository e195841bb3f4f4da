//! Deterministic state store for the Atlas orchestration plane.
//!
//! Provides the append-only transactional KV map that backs every
//! replicated component, the block/transaction staging scopes that give
//! inputs atomic commit semantics, and the module registry that orders
//! per-block hooks.
//!
//! The store itself never suspends and never consults a clock; block time
//! arrives from outside through [`BlockContext`].

pub mod module;
pub mod store;

pub use module::{Module, ModuleRegistry};
pub use store::{
    decode, encode, get_typed, set_typed, BlockContext, BlockScope, StateRead, StateStore,
    StateView, TxScope,
};

use thiserror::Error;

/// Errors raised by the state layer. All variants indicate corruption or
/// misuse and are fatal to the input being processed.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Value bytes failed to encode or decode.
    #[error("codec failure: {0}")]
    Codec(String),

    /// A genesis document did not match the expected shape.
    #[error("invalid genesis document: {0}")]
    Genesis(String),
}
