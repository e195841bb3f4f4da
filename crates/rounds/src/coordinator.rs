//! Per-job round state machine.
//!
//! Drives `COLLECTING -> AGGREGATING -> PUBLISHING -> COLLECTING(round+1)`
//! for every tracked job. The coordinator is synchronous and deterministic:
//! it consumes submissions and block-time ticks and tells the caller what
//! to do next. All clocks are block time in nanoseconds.

use std::collections::HashMap;
use thiserror::Error;

/// Phase of a job's current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// Accepting gradient submissions.
    Collecting,
    /// Quorum or deadline reached; aggregation in flight.
    Aggregating,
    /// Aggregate produced; waiting for the broadcast confirmation.
    Publishing,
}

/// One accepted gradient submission.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientSubmission {
    pub node_id: String,
    pub gradient_cid: String,
    pub weight: f64,
}

/// Round bookkeeping for one job.
#[derive(Debug, Clone)]
pub struct RoundState {
    /// Current round, 0-indexed.
    pub round: u64,
    /// Current phase.
    pub phase: RoundPhase,
    /// Nodes expected to contribute each round.
    pub participants: Vec<String>,
    /// Accepted submissions, in arrival order. Bounded by `participants`.
    pub received: Vec<GradientSubmission>,
    /// Absolute block-time deadline of the current round.
    pub deadline_ns: u64,
    /// Per-round deadline interval for this job.
    pub deadline_interval_ns: u64,
    /// Whether the job's round protocol has failed terminally.
    pub failed: bool,
}

impl RoundState {
    fn has_received_from(&self, node_id: &str) -> bool {
        self.received.iter().any(|s| s.node_id == node_id)
    }
}

/// Coordinator tunables.
#[derive(Debug, Clone, Copy)]
pub struct RoundConfig {
    /// Fraction of participants required before aggregation.
    pub quorum_fraction: f64,
    /// Round deadline relative to round start, in nanoseconds.
    pub round_deadline_ns: u64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            quorum_fraction: atlas_types::config::DEFAULT_QUORUM_FRACTION,
            round_deadline_ns: atlas_types::config::DEFAULT_ROUND_DEADLINE_SECS * 1_000_000_000,
        }
    }
}

/// Outcome of offering a submission to the FSM.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    /// Counted toward quorum.
    Accepted {
        received: usize,
        quorum: usize,
    },
    /// This node already contributed this round; dropped.
    DuplicateDropped,
    /// Submission for a round other than the current one; dropped.
    StaleRound { expected: u64 },
    /// Sender is not a participant of this job; dropped.
    NotParticipant,
    /// The round is no longer collecting; dropped.
    PhaseClosed,
}

/// What the caller must do after a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundAction {
    /// Run aggregation over the accepted submissions.
    Aggregate {
        job_id: String,
        round: u64,
        submissions: Vec<GradientSubmission>,
    },
    /// Deadline passed with nothing received: round and job fail.
    FailRound { job_id: String, round: u64 },
}

#[derive(Debug, Error, PartialEq)]
pub enum RoundError {
    #[error("job not tracked: {0}")]
    UnknownJob(String),

    #[error("job already tracked: {0}")]
    JobAlreadyTracked(String),

    #[error("job {0} has no participants")]
    NoParticipants(String),

    #[error("job {0} round protocol already failed")]
    RoundFailed(String),

    #[error("aggregation result for job {job_id} round {round} no longer matches the FSM")]
    StaleAggregation { job_id: String, round: u64 },
}

/// Per-job round coordination.
#[derive(Debug, Default)]
pub struct RoundCoordinator {
    config: RoundConfig,
    jobs: HashMap<String, RoundState>,
}

impl RoundCoordinator {
    pub fn new(config: RoundConfig) -> Self {
        Self {
            config,
            jobs: HashMap::new(),
        }
    }

    /// Begin tracking a job at round zero.
    ///
    /// `deadline_override_ns` replaces the configured per-round deadline
    /// (per-job configuration).
    pub fn start_job(
        &mut self,
        job_id: &str,
        participants: Vec<String>,
        now_ns: u64,
        deadline_override_ns: Option<u64>,
    ) -> Result<&RoundState, RoundError> {
        if self.jobs.contains_key(job_id) {
            return Err(RoundError::JobAlreadyTracked(job_id.to_string()));
        }
        if participants.is_empty() {
            return Err(RoundError::NoParticipants(job_id.to_string()));
        }

        let interval = deadline_override_ns.unwrap_or(self.config.round_deadline_ns);
        let state = RoundState {
            round: 0,
            phase: RoundPhase::Collecting,
            participants,
            received: Vec::new(),
            deadline_ns: now_ns + interval,
            deadline_interval_ns: interval,
            failed: false,
        };
        Ok(self.jobs.entry(job_id.to_string()).or_insert(state))
    }

    /// Stop tracking a job.
    pub fn stop_job(&mut self, job_id: &str) -> Option<RoundState> {
        self.jobs.remove(job_id)
    }

    /// The tracked state of a job, if any.
    pub fn job_state(&self, job_id: &str) -> Option<&RoundState> {
        self.jobs.get(job_id)
    }

    /// Ids of all tracked jobs.
    pub fn tracked_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Submissions required before the round may advance.
    pub fn quorum(&self, state: &RoundState) -> usize {
        let required = (state.participants.len() as f64 * self.config.quorum_fraction).ceil();
        (required as usize).max(1)
    }

    /// Offer a gradient submission to the FSM.
    pub fn submit(
        &mut self,
        job_id: &str,
        round: u64,
        node_id: &str,
        gradient_cid: &str,
        weight: f64,
    ) -> Result<SubmissionOutcome, RoundError> {
        let quorum_fraction = self.config.quorum_fraction;
        let state = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RoundError::UnknownJob(job_id.to_string()))?;
        if state.failed {
            return Err(RoundError::RoundFailed(job_id.to_string()));
        }

        if round != state.round {
            return Ok(SubmissionOutcome::StaleRound {
                expected: state.round,
            });
        }
        if state.phase != RoundPhase::Collecting {
            return Ok(SubmissionOutcome::PhaseClosed);
        }
        if !state.participants.iter().any(|p| p == node_id) {
            return Ok(SubmissionOutcome::NotParticipant);
        }
        if state.has_received_from(node_id) {
            return Ok(SubmissionOutcome::DuplicateDropped);
        }

        state.received.push(GradientSubmission {
            node_id: node_id.to_string(),
            gradient_cid: gradient_cid.to_string(),
            weight,
        });

        let quorum =
            ((state.participants.len() as f64 * quorum_fraction).ceil() as usize).max(1);
        Ok(SubmissionOutcome::Accepted {
            received: state.received.len(),
            quorum,
        })
    }

    /// Advance the FSM against block time.
    ///
    /// At most one action per job per call; the transition into
    /// `Aggregating` happens here, so the returned submission set is the
    /// frozen prefix that aggregation must use.
    pub fn poll(&mut self, job_id: &str, now_ns: u64) -> Result<Option<RoundAction>, RoundError> {
        let quorum_fraction = self.config.quorum_fraction;
        let state = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RoundError::UnknownJob(job_id.to_string()))?;
        if state.failed || state.phase != RoundPhase::Collecting {
            return Ok(None);
        }

        let quorum =
            ((state.participants.len() as f64 * quorum_fraction).ceil() as usize).max(1);
        let quorum_met = state.received.len() >= quorum;
        let deadline_hit = now_ns >= state.deadline_ns;

        if quorum_met || (deadline_hit && !state.received.is_empty()) {
            state.phase = RoundPhase::Aggregating;
            return Ok(Some(RoundAction::Aggregate {
                job_id: job_id.to_string(),
                round: state.round,
                submissions: state.received.clone(),
            }));
        }

        if deadline_hit {
            state.failed = true;
            return Ok(Some(RoundAction::FailRound {
                job_id: job_id.to_string(),
                round: state.round,
            }));
        }

        Ok(None)
    }

    /// Accept an aggregation result.
    ///
    /// The result is only accepted while the FSM is still `Aggregating`
    /// the same round and `input_cids` matches the frozen submission set;
    /// anything else is stale and rejected.
    pub fn complete_aggregation(
        &mut self,
        job_id: &str,
        round: u64,
        input_cids: &[String],
    ) -> Result<(), RoundError> {
        let state = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RoundError::UnknownJob(job_id.to_string()))?;

        let recorded: Vec<&str> = state
            .received
            .iter()
            .map(|s| s.gradient_cid.as_str())
            .collect();
        let matches = state.phase == RoundPhase::Aggregating
            && state.round == round
            && recorded.len() == input_cids.len()
            && recorded
                .iter()
                .zip(input_cids.iter())
                .all(|(a, b)| *a == b.as_str());
        if !matches {
            return Err(RoundError::StaleAggregation {
                job_id: job_id.to_string(),
                round,
            });
        }

        state.phase = RoundPhase::Publishing;
        Ok(())
    }

    /// Confirm the aggregate broadcast and open the next round.
    pub fn confirm_published(
        &mut self,
        job_id: &str,
        round: u64,
        now_ns: u64,
    ) -> Result<u64, RoundError> {
        let state = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| RoundError::UnknownJob(job_id.to_string()))?;
        if state.phase != RoundPhase::Publishing || state.round != round {
            return Err(RoundError::StaleAggregation {
                job_id: job_id.to_string(),
                round,
            });
        }

        state.round += 1;
        state.phase = RoundPhase::Collecting;
        state.received.clear();
        state.deadline_ns = now_ns + state.deadline_interval_ns;
        Ok(state.round)
    }
}
