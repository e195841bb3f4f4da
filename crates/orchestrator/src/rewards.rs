//! Contribution ledger and reward engine.
//!
//! Per-round gradient contributions (store namespace `gradient:`) feed
//! fair-share reward computation. Payouts flow through an injected [`Bank`]
//! capability; a failed transfer aborts the whole input.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::keys;
use crate::nodes::NodeRegistry;
use atlas_state::{get_typed, set_typed, StateRead, StateView};
use atlas_types::GradientContribution;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Wallet address holding the reward pool.
pub const REWARD_POOL_ADDRESS: &str = "atlas-reward-pool";

#[derive(Debug, Error)]
pub enum BankError {
    #[error("insufficient funds in {account}: have {available}, need {required}")]
    InsufficientFunds {
        account: String,
        available: u128,
        required: u128,
    },

    #[error("transfer failed: {0}")]
    Transfer(String),
}

/// Token transfer capability, implemented by the surrounding chain's bank
/// module.
pub trait Bank: Send {
    /// Move `amount` from `from` to `to`.
    fn send(&mut self, from: &str, to: &str, amount: u128) -> Result<(), BankError>;
}

/// In-memory bank for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryBank {
    balances: BTreeMap<String, u128>,
}

impl MemoryBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `amount` to `account` out of thin air.
    pub fn mint(&mut self, account: &str, amount: u128) {
        *self.balances.entry(account.to_string()).or_default() += amount;
    }

    pub fn balance(&self, account: &str) -> u128 {
        self.balances.get(account).copied().unwrap_or(0)
    }
}

impl Bank for MemoryBank {
    fn send(&mut self, from: &str, to: &str, amount: u128) -> Result<(), BankError> {
        let available = self.balance(from);
        if available < amount {
            return Err(BankError::InsufficientFunds {
                account: from.to_string(),
                available,
                required: amount,
            });
        }
        *self.balances.entry(from.to_string()).or_default() -= amount;
        *self.balances.entry(to.to_string()).or_default() += amount;
        Ok(())
    }
}

/// A [`MemoryBank`] behind a shared handle, so the caller can inspect
/// balances while the orchestrator owns the `Bank` capability.
#[derive(Debug, Clone, Default)]
pub struct SharedBank {
    inner: std::sync::Arc<std::sync::Mutex<MemoryBank>>,
}

impl SharedBank {
    pub fn new(bank: MemoryBank) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::Mutex::new(bank)),
        }
    }

    pub fn mint(&self, account: &str, amount: u128) {
        self.inner.lock().expect("bank lock poisoned").mint(account, amount);
    }

    pub fn balance(&self, account: &str) -> u128 {
        self.inner.lock().expect("bank lock poisoned").balance(account)
    }
}

impl Bank for SharedBank {
    fn send(&mut self, from: &str, to: &str, amount: u128) -> Result<(), BankError> {
        self.inner
            .lock()
            .expect("bank lock poisoned")
            .send(from, to, amount)
    }
}

/// Append-only per-round contribution records.
#[derive(Debug, Clone, Default)]
pub struct ContributionLedger;

impl ContributionLedger {
    pub fn new() -> Self {
        Self
    }

    /// Record a gradient contribution.
    ///
    /// Idempotent on `(job, node, round, cid)`: a repeat of an existing
    /// record is dropped and the stored record returned unchanged.
    pub fn track_contribution<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        job_id: &str,
        node_id: &str,
        round: u64,
        gradient_cid: &str,
        contribution: f64,
    ) -> OrchestratorResult<GradientContribution> {
        if gradient_cid.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "gradient cid cannot be empty".to_string(),
            ));
        }
        if !contribution.is_finite() || contribution < 0.0 {
            return Err(OrchestratorError::InvalidArgument(format!(
                "contribution weight out of range: {contribution}"
            )));
        }

        let key = keys::gradient_key(job_id, node_id, round, gradient_cid);
        if let Some(existing) = get_typed::<GradientContribution, S>(state, &key)? {
            return Ok(existing);
        }

        let record = GradientContribution {
            job_id: job_id.to_string(),
            node_id: node_id.to_string(),
            round,
            gradient_cid: gradient_cid.to_string(),
            contribution,
            timestamp_ns: state.ctx().block_time_ns,
        };
        set_typed(state, &key, &record)?;

        debug!(
            job_id = %job_id,
            node_id = %node_id,
            round = round,
            "Gradient contribution recorded"
        );
        Ok(record)
    }

    /// All contributions of one `(job, round)`, in node id order.
    pub fn contributions_for_round<S: StateRead + ?Sized>(
        &self,
        state: &S,
        job_id: &str,
        round: u64,
    ) -> OrchestratorResult<Vec<GradientContribution>> {
        let mut records = Vec::new();
        for (_, bytes) in state.iter_prefix(&keys::gradient_job_prefix(job_id)) {
            let record: GradientContribution = atlas_state::decode(&bytes)?;
            if record.round == round {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Normalized contribution shares for `(job, round)`.
    ///
    /// Shares sum to one when any contribution exists; an empty map is
    /// returned otherwise. A node with several records accumulates.
    pub fn fair_rewards<S: StateRead + ?Sized>(
        &self,
        state: &S,
        job_id: &str,
        round: u64,
    ) -> OrchestratorResult<BTreeMap<String, f64>> {
        let records = self.contributions_for_round(state, job_id, round)?;
        let total: f64 = records.iter().map(|r| r.contribution).sum();
        if records.is_empty() || total <= 0.0 {
            return Ok(BTreeMap::new());
        }

        let mut shares = BTreeMap::new();
        for record in records {
            *shares.entry(record.node_id).or_insert(0.0) += record.contribution / total;
        }
        Ok(shares)
    }
}

/// Reward computation and distribution.
#[derive(Debug, Clone)]
pub struct RewardEngine {
    nodes: NodeRegistry,
}

impl RewardEngine {
    pub fn new(nodes: NodeRegistry) -> Self {
        Self { nodes }
    }

    /// `floor(base * clamp(work_completed) * clamp(reputation / 100))`.
    ///
    /// Unknown nodes earn nothing (reputation zero).
    pub fn calculate_reward<S: StateRead + ?Sized>(
        &self,
        state: &S,
        node_id: &str,
        work_completed: f64,
        base_reward: u128,
    ) -> OrchestratorResult<u128> {
        let reputation = match self.nodes.try_get_node(state, node_id)? {
            Some(node) => node.reputation,
            None => 0.0,
        };

        let rep_multiplier = (reputation / 100.0).clamp(0.0, 1.0);
        let work = if work_completed.is_nan() {
            0.0
        } else {
            work_completed.clamp(0.0, 1.0)
        };

        let reward = (base_reward as f64 * work * rep_multiplier).floor();
        Ok(if reward <= 0.0 { 0 } else { reward as u128 })
    }

    /// Transfer `amount` from the reward pool to `node_address`.
    ///
    /// Transfer failure is fatal: the caller must abort the input so no
    /// partial credit is recorded.
    pub fn distribute_reward(
        &self,
        bank: &mut dyn Bank,
        node_address: &str,
        amount: u128,
        reason: &str,
    ) -> OrchestratorResult<()> {
        if amount == 0 {
            return Ok(());
        }
        bank.send(REWARD_POOL_ADDRESS, node_address, amount)
            .map_err(|e| OrchestratorError::Transfer(e.to_string()))?;

        debug!(
            node_address = %node_address,
            amount = amount,
            reason = %reason,
            "Reward distributed"
        );
        Ok(())
    }

    /// Pay a round's rewards: each contributor's fair share of the round,
    /// scaled by reputation, drawn against `base_reward`.
    pub fn pay_round_rewards<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        bank: &mut dyn Bank,
        ledger: &ContributionLedger,
        job_id: &str,
        round: u64,
        base_reward: u128,
    ) -> OrchestratorResult<BTreeMap<String, u128>> {
        let shares = ledger.fair_rewards(state, job_id, round)?;

        let mut paid = BTreeMap::new();
        for (node_id, share) in shares {
            let amount = self.calculate_reward(state, &node_id, share, base_reward)?;
            if amount == 0 {
                continue;
            }
            let node = self.nodes.get_node(state, &node_id)?;
            self.distribute_reward(
                bank,
                &node.address,
                amount,
                &format!("job {job_id} round {round}"),
            )?;
            paid.insert(node_id, amount);
        }
        Ok(paid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_state::{BlockContext, StateStore};
    use atlas_types::{NodeResources, OrchestratorConfig};

    fn setup() -> (StateStore, NodeRegistry, ContributionLedger, RewardEngine) {
        let nodes = NodeRegistry::new(OrchestratorConfig::default());
        let ledger = ContributionLedger::new();
        let rewards = RewardEngine::new(nodes.clone());
        (StateStore::new(), nodes, ledger, rewards)
    }

    #[test]
    fn test_fair_rewards_shares() {
        let (mut store, _nodes, ledger, _rewards) = setup();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        ledger
            .track_contribution(&mut scope, "j", "n1", 1, "cid-1", 0.5)
            .unwrap();
        ledger
            .track_contribution(&mut scope, "j", "n2", 1, "cid-2", 0.3)
            .unwrap();
        ledger
            .track_contribution(&mut scope, "j", "n3", 1, "cid-3", 0.2)
            .unwrap();

        let shares = ledger.fair_rewards(&scope, "j", 1).unwrap();
        assert!((shares["n1"] - 0.5).abs() < 1e-12);
        assert!((shares["n2"] - 0.3).abs() < 1e-12);
        assert!((shares["n3"] - 0.2).abs() < 1e-12);
        let total: f64 = shares.values().sum();
        assert!((total - 1.0).abs() < 1e-12);

        // No records for round 2.
        assert!(ledger.fair_rewards(&scope, "j", 2).unwrap().is_empty());
    }

    #[test]
    fn test_track_is_idempotent() {
        let (mut store, _nodes, ledger, _rewards) = setup();
        let mut scope = store.begin_block(BlockContext::new(1, 50));

        let first = ledger
            .track_contribution(&mut scope, "j", "n1", 0, "cid-1", 0.7)
            .unwrap();
        let repeat = ledger
            .track_contribution(&mut scope, "j", "n1", 0, "cid-1", 0.9)
            .unwrap();
        assert_eq!(repeat, first);
        assert_eq!(repeat.contribution, 0.7);

        let records = ledger.contributions_for_round(&scope, "j", 0).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_rounds_are_isolated() {
        let (mut store, _nodes, ledger, _rewards) = setup();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        ledger
            .track_contribution(&mut scope, "j", "n1", 0, "cid-a", 1.0)
            .unwrap();
        ledger
            .track_contribution(&mut scope, "j", "n1", 1, "cid-b", 1.0)
            .unwrap();
        ledger
            .track_contribution(&mut scope, "other", "n1", 0, "cid-c", 1.0)
            .unwrap();

        assert_eq!(
            ledger.contributions_for_round(&scope, "j", 0).unwrap().len(),
            1
        );
        assert_eq!(
            ledger.contributions_for_round(&scope, "j", 1).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_calculate_reward_clamps() {
        let (mut store, nodes, _ledger, rewards) = setup();
        let mut scope = store.begin_block(BlockContext::new(1, 0));
        nodes
            .register_node(&mut scope, "n1", "a1", NodeResources::default())
            .unwrap();
        nodes.update_reputation(&mut scope, "n1", 80.0).unwrap();

        // work > 1 behaves as 1; work < 0 behaves as 0.
        assert_eq!(
            rewards.calculate_reward(&scope, "n1", 2.0, 1000).unwrap(),
            800
        );
        assert_eq!(
            rewards.calculate_reward(&scope, "n1", -0.5, 1000).unwrap(),
            0
        );
        assert_eq!(
            rewards.calculate_reward(&scope, "n1", 0.5, 1000).unwrap(),
            400
        );

        // Unknown node earns nothing.
        assert_eq!(
            rewards.calculate_reward(&scope, "ghost", 1.0, 1000).unwrap(),
            0
        );
    }

    #[test]
    fn test_distribute_reward_moves_funds() {
        let (_store, _nodes, _ledger, rewards) = setup();
        let mut bank = MemoryBank::new();
        bank.mint(REWARD_POOL_ADDRESS, 1_000);

        rewards
            .distribute_reward(&mut bank, "wallet-1", 400, "test")
            .unwrap();
        assert_eq!(bank.balance("wallet-1"), 400);
        assert_eq!(bank.balance(REWARD_POOL_ADDRESS), 600);
    }

    #[test]
    fn test_distribute_reward_failure_is_fatal() {
        let (_store, _nodes, _ledger, rewards) = setup();
        let mut bank = MemoryBank::new();

        let err = rewards
            .distribute_reward(&mut bank, "wallet-1", 400, "test")
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_pay_round_rewards() {
        let (mut store, nodes, ledger, rewards) = setup();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        for (id, uptime) in [("n1", 100.0), ("n2", 100.0)] {
            nodes
                .register_node(&mut scope, id, &format!("wallet-{id}"), NodeResources::default())
                .unwrap();
            nodes.update_reputation(&mut scope, id, uptime).unwrap();
        }
        ledger
            .track_contribution(&mut scope, "j", "n1", 0, "cid-1", 3.0)
            .unwrap();
        ledger
            .track_contribution(&mut scope, "j", "n2", 0, "cid-2", 1.0)
            .unwrap();

        let mut bank = MemoryBank::new();
        bank.mint(REWARD_POOL_ADDRESS, 10_000);

        let paid = rewards
            .pay_round_rewards(&mut scope, &mut bank, &ledger, "j", 0, 1_000)
            .unwrap();
        assert_eq!(paid["n1"], 750);
        assert_eq!(paid["n2"], 250);
        assert_eq!(bank.balance("wallet-n1"), 750);
        assert_eq!(bank.balance("wallet-n2"), 250);
    }
}
