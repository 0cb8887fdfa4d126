use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration, Utc};
use clap::Parser;
use cr_common::compare::{ComparisonClient, ComparisonConfig, HttpComparisonClient};
use cr_common::db::{PgStore, PgWorkQueue, create_pool_from_url};
use cr_common::logging;
use cr_common::queue::{ProcessingType, QueueMessage, WorkQueue};
use cr_common::recon::{ReconStore, ReconcileConfig, Reconciler, StoreError};
use cr_common::schema::DocumentStatus;
use cr_common::stages::{
    EmbeddingRequest, ExtractionRequest, HttpStageClient, LibraryMatchRequest, StageClient,
    StageEndpoints, StageError, ensure_success,
};
use dotenvy::dotenv;
use tokio::time::{Duration as StdDuration, sleep};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "cr-worker",
    about = "Drive queued contract documents through the reconciliation pipeline"
)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    db_url: String,

    /// Worker id recorded on queue leases
    #[arg(long, default_value = "cr-worker")]
    worker_id: String,

    /// Poll interval while the queue is empty, in milliseconds
    #[arg(long, default_value_t = 3000)]
    poll_interval_ms: u64,

    /// Messages leased per poll
    #[arg(long, default_value_t = 5)]
    dequeue_batch: usize,

    /// Minutes before a processing lease is considered stale and recovered
    #[arg(long, default_value_t = 15)]
    stale_lease_minutes: i64,

    /// Optional cap on messages processed in one run
    #[arg(long)]
    max_messages: Option<usize>,

    /// Exit when the queue is empty instead of continuing to poll
    #[arg(long, default_value_t = false)]
    exit_on_empty: bool,
}

#[derive(Debug, Clone)]
struct WorkerConfig {
    worker_id: String,
    poll_interval_ms: u64,
    dequeue_batch: usize,
    max_messages: Option<usize>,
    exit_on_empty: bool,
}

impl WorkerConfig {
    fn from_cli(args: &Cli) -> Self {
        Self {
            worker_id: args.worker_id.clone(),
            poll_interval_ms: args.poll_interval_ms,
            dequeue_batch: args.dequeue_batch.max(1),
            max_messages: args.max_messages,
            exit_on_empty: args.exit_on_empty,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum PipelineError {
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Run one message through the pipeline. Stage order is strict — each stage
/// depends on the previous one's durable output — and any stage failure is
/// fatal to the document. Reconciliation alone is non-fatal: the library
/// stage already produced a baseline verdict.
async fn process_message<S, St, C>(
    store: &S,
    stages: &St,
    reconciler: &Reconciler<'_, S, C>,
    message: &QueueMessage,
) -> Result<(), PipelineError>
where
    S: ReconStore,
    St: StageClient,
    C: ComparisonClient,
{
    let document_id = message.document_id;
    info!(
        document_id,
        tenant_id = message.tenant_id,
        processing_type = message.processing_type.as_str(),
        "processing queue message"
    );

    store
        .set_document_status(document_id, DocumentStatus::Processing, None)
        .await?;

    if message.processing_type == ProcessingType::Full {
        let extraction = stages
            .extract(&ExtractionRequest {
                document_id,
                tenant_id: message.tenant_id,
                object_path: message.object_path.clone(),
            })
            .await?;
        ensure_success("extraction", extraction.success, extraction.error)?;
        info!(document_id, clauses = extraction.clauses_extracted, "extraction finished");

        let embedding = stages.embed(&EmbeddingRequest { document_id }).await?;
        ensure_success("embedding", embedding.success, embedding.error)?;

        let library = stages
            .match_library(&LibraryMatchRequest {
                document_id,
                tenant_id: message.tenant_id,
            })
            .await?;
        ensure_success("library_matching", library.success, library.error)?;
        info!(document_id, clauses = library.clauses_reconciled, "library matching finished");
    }

    match reconciler.run(document_id).await {
        Ok(summary) => info!(
            document_id,
            results = summary.results_written,
            discrepancies = summary.discrepancies_created,
            reviews = summary.review_items_created,
            "reconciliation stage finished"
        ),
        Err(err) => warn!(
            document_id,
            error = %err,
            "reconciliation failed; keeping library verdicts and completing the document"
        ),
    }

    store
        .set_document_status(document_id, DocumentStatus::Completed, None)
        .await?;
    Ok(())
}

/// Poll loop. Checks the run flag once per iteration boundary; a batch in
/// flight always runs to completion.
async fn run_worker_loop<Q, S, St, C>(
    queue: &Q,
    store: &S,
    stages: &St,
    reconciler: &Reconciler<'_, S, C>,
    config: &WorkerConfig,
    running: &AtomicBool,
) -> usize
where
    Q: WorkQueue,
    S: ReconStore,
    St: StageClient,
    C: ComparisonClient,
{
    let mut processed = 0usize;
    let max_messages = config.max_messages.unwrap_or(usize::MAX);

    'poll: while running.load(Ordering::SeqCst) && processed < max_messages {
        let batch = match queue.dequeue(&config.worker_id, config.dequeue_batch).await {
            Ok(batch) => batch,
            Err(err) => {
                error!(error = %err, "queue dequeue failed");
                sleep(StdDuration::from_millis(config.poll_interval_ms)).await;
                continue;
            }
        };

        if batch.is_empty() {
            if config.exit_on_empty {
                break;
            }
            sleep(StdDuration::from_millis(config.poll_interval_ms)).await;
            continue;
        }

        for message in batch {
            match process_message(store, stages, reconciler, &message).await {
                Ok(()) => {
                    if let Err(err) = queue.delete(message.id).await {
                        // The document was already processed; losing the ack
                        // is an operational alert, not a correctness issue.
                        error!(
                            message_id = message.id,
                            document_id = message.document_id,
                            error = %err,
                            "failed to delete processed queue message"
                        );
                    }
                }
                Err(err) => {
                    let failure = err.to_string();
                    error!(
                        message_id = message.id,
                        document_id = message.document_id,
                        error = %failure,
                        "pipeline failed; archiving message"
                    );
                    if let Err(err) = store
                        .set_document_status(
                            message.document_id,
                            DocumentStatus::Failed,
                            Some(&failure),
                        )
                        .await
                    {
                        error!(document_id = message.document_id, error = %err, "failed to record document failure");
                    }
                    if let Err(err) = queue.archive(message.id, &failure).await {
                        error!(message_id = message.id, error = %err, "failed to archive message");
                    }
                }
            }

            processed += 1;
            if processed >= max_messages {
                break 'poll;
            }
        }
    }

    processed
}

fn comparison_client_from_env() -> HttpComparisonClient {
    let endpoint = std::env::var("CR_COMPARE_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:8104/compare".into());
    let api_key = std::env::var("CR_COMPARE_API_KEY").ok();
    HttpComparisonClient::new(endpoint, api_key)
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    logging::init("cr-worker");

    let args = Cli::parse();
    let config = WorkerConfig::from_cli(&args);

    let pool = create_pool_from_url(&args.db_url)?;
    let store = PgStore::new(pool.clone());
    let queue = PgWorkQueue::new(pool);
    let stages = HttpStageClient::new(StageEndpoints::from_env());
    let comparator = comparison_client_from_env();
    let reconciler = Reconciler::new(
        &store,
        &comparator,
        ReconcileConfig::default(),
        ComparisonConfig::from_env(),
    );

    match queue
        .recover_stale(Utc::now(), Duration::minutes(args.stale_lease_minutes))
        .await
    {
        Ok(0) => {}
        Ok(recovered) => info!(recovered, "recovered stale queue leases at startup"),
        Err(err) => warn!(error = %err, "stale lease recovery failed"),
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received; finishing the current batch");
                running.store(false, Ordering::SeqCst);
            }
        });
    }

    info!(
        worker_id = %config.worker_id,
        poll_interval_ms = config.poll_interval_ms,
        dequeue_batch = config.dequeue_batch,
        "worker started"
    );

    let processed = run_worker_loop(&queue, &store, &stages, &reconciler, &config, &running).await;
    info!(processed, "worker loop exited");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("cr-worker failed: {err}");
        std::process::exit(1);
    }
}
