//! Atlas unified node binary.
//!
//! Runs the replicated orchestration core single-process: a block producer
//! loop feeds queued transactions into the state machine, the round
//! service coordinates gradient rounds over an in-process pub/sub, and a
//! blob store (memory or local directory) carries artifacts.
//!
//! The consensus layer is external in a real deployment; here the block
//! producer stands in for it, which is enough to exercise the whole
//! orchestration and round pipeline end to end.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use atlas_orchestrator::{Orchestrator, Transaction, REWARD_POOL_ADDRESS};
use atlas_protocol::{MemoryPubSub, PubSub};
use atlas_rounds::{
    announce_gradient, encode_gradient, BlockTick, ContributionSink, GradientListener,
    RoundControl, RoundService, RoundServiceConfig,
};
use atlas_state::BlockContext;
use atlas_storage::{BlobBackendConfig, BlobManager, StorageMetrics};
use atlas_types::{NodeResources, OrchestratorConfig};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "atlas-node")]
#[command(about = "Atlas orchestration node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single-process node with an empty state.
    Run {
        /// Block production interval in milliseconds.
        #[arg(long, default_value = "1000")]
        block_interval_ms: u64,

        /// Blob storage backend.
        #[arg(long, value_enum, default_value = "memory")]
        storage: StorageMode,

        /// Root directory for local blob storage.
        #[arg(long, default_value = "/var/lib/atlas/blobs")]
        storage_path: PathBuf,
    },
    /// Run a scripted demo fleet through jobs and gradient rounds.
    Demo {
        /// Block production interval in milliseconds.
        #[arg(long, default_value = "200")]
        block_interval_ms: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StorageMode {
    Memory,
    Local,
}

/// Pending ordered inputs for the next block.
#[derive(Clone, Default)]
struct TxQueue {
    inner: Arc<Mutex<Vec<Transaction>>>,
}

impl TxQueue {
    fn push(&self, tx: Transaction) {
        self.inner.lock().expect("tx queue poisoned").push(tx);
    }

    fn drain(&self) -> Vec<Transaction> {
        std::mem::take(&mut *self.inner.lock().expect("tx queue poisoned"))
    }
}

/// Routes round-service proposals into the transaction queue.
struct QueueSink {
    queue: TxQueue,
}

#[async_trait]
impl ContributionSink for QueueSink {
    async fn register_contribution(
        &self,
        job_id: &str,
        round: u64,
        node_id: &str,
        gradient_cid: &str,
        weight: f64,
    ) -> Result<(), String> {
        self.queue.push(Transaction::SubmitGradient {
            job_id: job_id.to_string(),
            round,
            node_id: node_id.to_string(),
            gradient_cid: gradient_cid.to_string(),
            contribution_weight: weight,
        });
        Ok(())
    }

    async fn complete_round(
        &self,
        job_id: &str,
        round: u64,
        aggregate_cid: &str,
    ) -> Result<(), String> {
        self.queue.push(Transaction::CompleteRound {
            job_id: job_id.to_string(),
            round,
            aggregate_cid: aggregate_cid.to_string(),
        });
        self.queue.push(Transaction::DistributeRoundRewards {
            job_id: job_id.to_string(),
            round,
            base_reward: 1_000,
        });
        Ok(())
    }

    async fn fail_round(&self, job_id: &str, round: u64) -> Result<(), String> {
        warn!(job_id = %job_id, round = round, "Round failed, failing job");
        self.queue.push(Transaction::FailJob {
            job_id: job_id.to_string(),
        });
        Ok(())
    }
}

fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(anyhow!("invalid log level: {other}")),
    };

    if cli.json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let metrics = Arc::new(StorageMetrics::new().context("creating storage metrics")?);
    match cli.command {
        Command::Run {
            block_interval_ms,
            storage,
            storage_path,
        } => {
            let config = match storage {
                StorageMode::Memory => BlobBackendConfig::Memory,
                StorageMode::Local => BlobBackendConfig::Local {
                    root: storage_path.clone(),
                },
            };
            let blobs = BlobManager::new(config)
                .with_context(|| format!("opening blob store at {storage_path:?}"))?
                .with_metrics(metrics);
            run_node(block_interval_ms, blobs, None).await
        }
        Command::Demo { block_interval_ms } => {
            let blobs = BlobManager::memory().with_metrics(metrics);
            run_node(block_interval_ms, blobs, Some(DemoFleet::default())).await
        }
    }
}

/// A scripted three-node fleet used by the demo subcommand.
#[derive(Default)]
struct DemoFleet {
    job_id: Option<String>,
    work_dispatched: bool,
    work_completed: bool,
}

async fn run_node(
    block_interval_ms: u64,
    blobs: BlobManager,
    mut demo: Option<DemoFleet>,
) -> Result<()> {
    let (mut orchestrator, bank) = Orchestrator::new_in_memory(OrchestratorConfig::default());
    bank.mint(REWARD_POOL_ADDRESS, 1_000_000_000);

    let pubsub: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
    let queue = TxQueue::default();
    let sink = Arc::new(QueueSink {
        queue: queue.clone(),
    });

    let (mut round_service, handles) = RoundService::new(
        RoundServiceConfig::default(),
        blobs.backend(),
        pubsub.clone(),
        sink,
    );
    let mut service_handle = tokio::spawn(async move { round_service.run().await });

    info!(
        block_interval_ms = block_interval_ms,
        "Starting Atlas node"
    );

    if demo.is_some() {
        seed_demo_fleet(&queue);
    }

    // Per-job gradient listeners are spawned as jobs appear.
    let mut tracked_jobs: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut listener_shutdowns: Vec<mpsc::Sender<()>> = Vec::new();

    let mut height = 0u64;
    let mut interval = tokio::time::interval(Duration::from_millis(block_interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                height += 1;
                let now_ns = unix_now_ns();
                let txs = queue.drain();
                let outcome = orchestrator
                    .apply_block(BlockContext::new(height, now_ns), txs)
                    .map_err(|e| anyhow!("fatal orchestration error: {e}"))?;

                for (i, result) in outcome.results.iter().enumerate() {
                    if let Err(e) = result {
                        warn!(height, tx = i, error = %e, "Transaction rejected");
                    }
                }
                if let Err(e) =
                    publish_events(&orchestrator, pubsub.as_ref(), height, now_ns, &outcome.events)
                        .await
                {
                    warn!(height, error = %e, "Event publication failed");
                }

                // New jobs get a gradient listener and round tracking.
                for job in orchestrator.list_jobs()? {
                    if tracked_jobs.contains(&job.id) || job.status.is_terminal() {
                        continue;
                    }
                    let participants: Vec<String> = orchestrator
                        .list_nodes()?
                        .into_iter()
                        .filter(|n| n.is_online())
                        .map(|n| n.id)
                        .collect();
                    if participants.is_empty() {
                        continue;
                    }
                    let deadline = job
                        .round_deadline_secs()
                        .map(|secs| secs * 1_000_000_000);
                    let start = RoundControl::StartJob {
                        job_id: job.id.clone(),
                        participants,
                        now_ns,
                        deadline_override_ns: deadline,
                    };
                    if handles.control_tx.send(start).await.is_err() {
                        break;
                    }
                    tracked_jobs.insert(job.id.clone());

                    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
                    listener_shutdowns.push(shutdown_tx);
                    let listener = GradientListener::new(
                        job.id.clone(),
                        pubsub.clone(),
                        handles.announcement_tx.clone(),
                        shutdown_rx,
                    );
                    tokio::spawn(listener.run());
                }

                if handles.tick_tx.send(BlockTick { now_ns }).await.is_err() {
                    break;
                }
                if let Some(demo) = demo.as_mut() {
                    drive_demo(demo, &orchestrator, &queue, &blobs, pubsub.as_ref()).await?;
                }
            }
            result = &mut service_handle => {
                result
                    .map_err(|e| anyhow!("round service panicked: {e}"))?
                    .map_err(|e| anyhow!("round service failed: {e}"))?;
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                for shutdown in &listener_shutdowns {
                    let _ = shutdown.send(()).await;
                }
                let _ = handles.shutdown_tx.send(()).await;
                break;
            }
        }
    }
    Ok(())
}

/// Log block events and publish rollback notices on the per-job recovery
/// channel so the affected nodes can stop local work.
///
/// A rollback transition always follows the `node_offline` event of the
/// node that held the task, which is why tracking the most recent offline
/// node per block is enough to attribute the notice.
async fn publish_events(
    orchestrator: &Orchestrator,
    pubsub: &dyn PubSub,
    height: u64,
    now_ns: u64,
    events: &[atlas_types::Event],
) -> Result<()> {
    use atlas_protocol::{rollback_topic, RollbackNotice};
    use atlas_types::Event;

    let mut offline_node: Option<String> = None;
    for event in events {
        info!(height, event = %event.name(), "Event");
        match event {
            Event::NodeOffline { node_id } => offline_node = Some(node_id.clone()),
            Event::TaskStatusUpdated { task_id, status } if status == "rollback" => {
                let Some(node_id) = offline_node.clone() else {
                    continue;
                };
                let job_id = orchestrator.get_task(task_id)?.job_id;
                let notice = RollbackNotice {
                    task_id: task_id.clone(),
                    node_id,
                    ts: now_ns,
                };
                let payload = serde_json::to_vec(&notice)
                    .map_err(|e| anyhow!("encoding rollback notice: {e}"))?;
                pubsub
                    .publish(&rollback_topic(&job_id), payload)
                    .await
                    .map_err(|e| anyhow!("publishing rollback notice: {e}"))?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn seed_demo_fleet(queue: &TxQueue) {
    for node_id in ["n1", "n2", "n3"] {
        queue.push(Transaction::RegisterNode {
            node_id: node_id.to_string(),
            address: format!("wallet-{node_id}"),
            resources: NodeResources {
                cpu_cores: 8,
                gpu_count: 1,
                memory_gb: 32,
                storage_gb: 500,
            },
        });
        queue.push(Transaction::UpdateReputation {
            node_id: node_id.to_string(),
            uptime_percent: 100.0,
        });
    }
    queue.push(Transaction::RegisterModel {
        name: "demo".to_string(),
        version: "v1".to_string(),
        cid: "a".repeat(64),
        metadata: BTreeMap::new(),
    });
    queue.push(Transaction::SubmitJob {
        model_id: "model-demo-v1".to_string(),
        dataset_cid: "b".repeat(64),
        config: BTreeMap::new(),
    });
}

/// Advance the scripted fleet: heartbeats every block, and the current
/// round's gradients re-announced until three rounds have completed.
/// Duplicate and stale announcements are dropped by the round service, so
/// re-announcing every block is harmless and self-healing.
async fn drive_demo(
    demo: &mut DemoFleet,
    orchestrator: &Orchestrator,
    queue: &TxQueue,
    blobs: &BlobManager,
    pubsub: &dyn PubSub,
) -> Result<()> {
    for node_id in ["n1", "n2", "n3"] {
        queue.push(Transaction::UpdateHeartbeat {
            node_id: node_id.to_string(),
        });
    }

    if demo.job_id.is_none() {
        demo.job_id = orchestrator.list_jobs()?.first().map(|job| job.id.clone());
    }
    let Some(job_id) = demo.job_id.clone() else {
        return Ok(());
    };

    // Split the "dataset" into three shards, create their tasks, and let
    // the scheduler place them. Done once, as soon as the job exists.
    if !demo.work_dispatched {
        let dataset: Vec<u8> = (0..3072u32).map(|i| (i % 251) as u8).collect();
        let shards = blobs
            .store_dataset(&dataset, 3)
            .await
            .map_err(|e| anyhow!("storing demo dataset: {e}"))?;
        for shard in shards {
            let shard_id = format!("{job_id}-shard-{}", shard.index);
            queue.push(Transaction::RegisterShard {
                shard_id: shard_id.clone(),
                job_id: job_id.clone(),
                cid: shard.cid,
                hash: shard.hash,
                size: shard.size,
            });
            queue.push(Transaction::CreateTask {
                job_id: job_id.clone(),
                shard_id,
                node_id: None,
            });
        }
        queue.push(Transaction::DispatchJob {
            job_id: job_id.clone(),
        });
        demo.work_dispatched = true;
    }

    let round = orchestrator.current_round(&job_id)?;
    if round < 3 {
        for (i, node_id) in ["n1", "n2", "n3"].into_iter().enumerate() {
            let gradient: Vec<f64> = vec![round as f64, i as f64, 1.0];
            let cid = blobs
                .put(&encode_gradient(&gradient))
                .await
                .map_err(|e| anyhow!("storing demo gradient: {e}"))?;
            announce_gradient(pubsub, node_id, &job_id, round, &cid)
                .await
                .map_err(|e| anyhow!("announcing demo gradient: {e}"))?;
        }
    } else if !demo.work_completed {
        // Training rounds are done: report every assigned task finished so
        // the job reaches its terminal state.
        for task in orchestrator.get_tasks_by_job(&job_id)? {
            if task.status == atlas_types::TaskStatus::Assigned {
                for status in ["in_progress", "completed"] {
                    queue.push(Transaction::UpdateTaskStatus {
                        task_id: task.id.clone(),
                        status: status.to_string(),
                        progress: Some(if status == "completed" { 1.0 } else { 0.5 }),
                        checkpoint_cid: None,
                    });
                }
            }
        }
        demo.work_completed = true;
    }
    Ok(())
}
