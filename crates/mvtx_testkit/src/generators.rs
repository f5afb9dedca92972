//! Property-based test generators using proptest.
//!
//! Provides strategies for generating keys, values, map names and
//! sequences of transactional operations.

use mvtx_codec::Value;
use proptest::prelude::*;

/// Strategy for keys drawn from a small range, so operations collide.
pub fn key_strategy() -> impl Strategy<Value = i64> {
    0i64..32
}

/// Strategy for map names a transaction may open.
pub fn map_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for arbitrary stored values, including nested arrays.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ];
    leaf.prop_recursive(2, 16, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(Value::Array)
    })
}

/// An operation inside one transaction.
#[derive(Debug, Clone)]
pub enum TxOperation {
    /// Put a value
    Put {
        /// Key
        key: i64,
        /// Value
        value: i64,
    },
    /// Remove a key
    Remove {
        /// Key
        key: i64,
    },
    /// Read a key
    Get {
        /// Key
        key: i64,
    },
    /// Take a savepoint
    Savepoint,
    /// Roll back to the most recent savepoint still valid
    RollbackToSavepoint,
}

/// Strategy for generating transactional operations.
pub fn tx_operation_strategy() -> impl Strategy<Value = TxOperation> {
    prop_oneof![
        4 => (key_strategy(), any::<i64>())
            .prop_map(|(key, value)| TxOperation::Put { key, value }),
        2 => key_strategy().prop_map(|key| TxOperation::Remove { key }),
        2 => key_strategy().prop_map(|key| TxOperation::Get { key }),
        1 => Just(TxOperation::Savepoint),
        1 => Just(TxOperation::RollbackToSavepoint),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<TxOperation>> {
    prop::collection::vec(tx_operation_strategy(), min_ops..max_ops)
}

/// How a generated transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Commit
    Commit,
    /// Roll back
    Rollback,
    /// Prepare, then commit
    PrepareCommit,
}

/// Strategy for transaction outcomes.
pub fn outcome_strategy() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        3 => Just(Outcome::Commit),
        2 => Just(Outcome::Rollback),
        1 => Just(Outcome::PrepareCommit),
    ]
}

/// Strategy for a batch of transactions, each with its outcome.
pub fn transaction_batch_strategy(
    max_transactions: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<(Vec<TxOperation>, Outcome)>> {
    prop::collection::vec(
        (operation_sequence_strategy(0, max_ops), outcome_strategy()),
        1..max_transactions,
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
