//! CLI command definitions for ackqueue.
//!
//! Every command talks to Redis directly; queue and task names map to keys
//! exactly as the library maps them, so the CLI can inspect and operate on
//! queues owned by running services.

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

use crate::config::{QueueConfig, StoreConfig, TaskConfig};
use crate::metrics::{export_metrics, init_metrics};
use crate::queue::{AckQueue, LoggingEvents, Message};
use crate::store::{QueueStore, RedisStore, TaskStore};
use crate::task::DelayedTask;

/// Acknowledged work queues and delayed tasks on Redis.
#[derive(Parser)]
#[command(name = "ackqueue")]
#[command(about = "Operate acknowledged Redis work queues and delayed tasks")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Redis connection URL [default: $REDIS_URL, else redis://localhost:6379].
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// Key prefix for queues [default: $ACKQUEUE_QUEUE_PREFIX, else redisson_ack_queue].
    #[arg(long, global = true)]
    pub queue_prefix: Option<String>,

    /// Key prefix for delayed tasks [default: $ACKQUEUE_TASK_PREFIX, else redisson_delay_task].
    #[arg(long, global = true)]
    pub task_prefix: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Output JSON to stdout instead of plain text.
    #[arg(short = 'j', long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Push payloads onto a queue.
    Push(PushArgs),

    /// Pop messages and start their visibility timeout.
    Pop(PopArgs),

    /// Acknowledge in-flight messages.
    Ack(IdsArgs),

    /// Return in-flight messages for redelivery.
    Unack(IdsArgs),

    /// Show queue sizes.
    Stats(QueueArgs),

    /// List (and optionally purge) dead-lettered messages.
    #[command(name = "dead-letters", alias = "dlq")]
    DeadLetters(DeadLettersArgs),

    /// Redeliver messages whose visibility timeout passed.
    Sweep(QueueArgs),

    /// Schedule a delayed task.
    Offer(OfferArgs),

    /// Cancel a delayed task that has not run yet.
    Cancel(CancelArgs),

    /// Listen to a queue, keep its timeouts swept and log its events.
    Watch(WatchArgs),

    /// Run a logging consumer for a delayed task name.
    #[command(name = "run-tasks")]
    RunTasks(RunTasksArgs),
}

/// Queue selection and policy shared by queue commands.
#[derive(Args, Debug, Clone)]
pub struct QueueArgs {
    /// Logical queue name.
    pub queue: String,

    /// Visibility timeout in seconds for popped messages.
    #[arg(long, default_value_t = 300)]
    pub visibility_timeout: u64,

    /// Retry budget: -1 retries forever, 0 dead-letters on first failure.
    #[arg(long, default_value_t = 5, allow_negative_numbers = true)]
    pub retry_budget: i64,
}

impl QueueArgs {
    fn config(&self) -> QueueConfig {
        QueueConfig::default()
            .with_visibility_timeout(Duration::from_secs(self.visibility_timeout))
            .with_retry_budget(self.retry_budget)
    }
}

#[derive(Args, Debug)]
pub struct PushArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Payloads; each is parsed as JSON, falling back to a plain string.
    #[arg(required = true)]
    pub payloads: Vec<String>,
}

#[derive(Args, Debug)]
pub struct PopArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Maximum number of messages to pop.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: usize,

    /// Pop this specific id instead of the oldest messages.
    #[arg(long, conflicts_with = "count")]
    pub id: Option<String>,
}

#[derive(Args, Debug)]
pub struct IdsArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Message ids.
    #[arg(required = true)]
    pub ids: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DeadLettersArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Maximum number of entries to list.
    #[arg(long, default_value_t = 100)]
    pub limit: usize,

    /// Remove the listed entries from the dead-letter set.
    #[arg(long)]
    pub purge: bool,
}

#[derive(Args, Debug)]
pub struct OfferArgs {
    /// Logical task name.
    pub task: String,

    /// Task id; offering an existing id reschedules it.
    pub task_id: String,

    /// Payload, parsed as JSON, falling back to a plain string.
    pub payload: String,

    /// Due time in epoch milliseconds.
    #[arg(long, conflicts_with = "delay")]
    pub at: Option<i64>,

    /// Delay in seconds from now.
    #[arg(long = "in", default_value_t = 0)]
    pub delay: u64,
}

#[derive(Args, Debug)]
pub struct CancelArgs {
    /// Logical task name.
    pub task: String,

    /// Task id.
    pub task_id: String,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Print Prometheus metrics on exit.
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Args, Debug)]
pub struct RunTasksArgs {
    /// Logical task name.
    pub task: String,

    /// Visibility timeout in seconds for claimed tasks.
    #[arg(long, default_value_t = 180)]
    pub visibility_timeout: u64,

    /// Delay in seconds before a failed task runs again.
    #[arg(long, default_value_t = 300)]
    pub retry_delay: u64,

    /// Retry budget: -1 retries forever.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub retry_budget: i64,

    /// Print Prometheus metrics on exit.
    #[arg(long)]
    pub metrics: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Resolves store settings: explicit flags win over the environment, which
/// wins over the built-in defaults.
fn store_config(cli: &Cli) -> StoreConfig {
    let mut config = StoreConfig::from_env();
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(prefix) = &cli.queue_prefix {
        config = config.with_queue_prefix(prefix.clone());
    }
    if let Some(prefix) = &cli.task_prefix {
        config = config.with_task_prefix(prefix.clone());
    }
    config
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = store_config(&cli);
    let store: Arc<RedisStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let out = Output { json: cli.json };

    match cli.command {
        Commands::Push(args) => {
            let queue = open_queue(&store, &config, &args.queue);
            let payloads: Vec<Value> = args.payloads.iter().map(|p| parse_payload(p)).collect();
            let ids = queue.push(&payloads).await?;
            out.ids("pushed", &ids);
        }
        Commands::Pop(args) => {
            let queue = open_queue(&store, &config, &args.queue);
            let messages = match &args.id {
                Some(id) => queue.pop_id(id).await?.into_iter().collect(),
                None => queue.pop(args.count).await?,
            };
            out.messages(&messages);
        }
        Commands::Ack(args) => {
            let queue = open_queue(&store, &config, &args.queue);
            let acked = queue.ack(&args.ids).await?;
            out.ids("acked", &acked);
        }
        Commands::Unack(args) => {
            let queue = open_queue(&store, &config, &args.queue);
            let outcome = queue.unack(&args.ids).await?;
            out.value(json!({
                "requeued": outcome.requeued,
                "dead_lettered": outcome.dead_lettered,
            }));
        }
        Commands::Stats(args) => {
            let queue = open_queue(&store, &config, &args);
            let stats = queue.stats().await?;
            out.value(json!({
                "queue": queue.name(),
                "pending": stats.pending,
                "in_flight": stats.in_flight,
                "dead_lettered": stats.dead_lettered,
                "payloads": stats.payloads,
            }));
        }
        Commands::DeadLetters(args) => {
            let queue = open_queue(&store, &config, &args.queue);
            let entries = queue.dead_letters(args.limit).await?;
            let purged = if args.purge {
                let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
                queue.purge_dead_letters(&ids).await?
            } else {
                0
            };
            out.value(json!({
                "dead_letters": entries
                    .iter()
                    .map(|e| json!({ "id": e.id, "dead_at": e.dead_at }))
                    .collect::<Vec<_>>(),
                "purged": purged,
            }));
        }
        Commands::Sweep(args) => {
            let queue = open_queue(&store, &config, &args);
            let next = queue.sweep_timeouts().await?;
            out.value(json!({ "next_deadline": next }));
        }
        Commands::Offer(args) => {
            let tasks = DelayedTask::<Value>::builder(store as Arc<dyn TaskStore>, &args.task)
                .with_prefix(&config.task_prefix)
                .producer();
            let payload = parse_payload(&args.payload);
            match args.at {
                Some(at) => tasks.offer(&args.task_id, &payload, at).await?,
                None => {
                    tasks
                        .offer_in(&args.task_id, &payload, Duration::from_secs(args.delay))
                        .await?
                }
            }
            out.value(json!({ "offered": args.task_id }));
        }
        Commands::Cancel(args) => {
            let tasks = DelayedTask::<Value>::builder(store as Arc<dyn TaskStore>, &args.task)
                .with_prefix(&config.task_prefix)
                .producer();
            let cancelled = tasks.try_cancel(&args.task_id).await?;
            out.value(json!({ "task_id": args.task_id, "cancelled": cancelled }));
        }
        Commands::Watch(args) => {
            if args.metrics {
                init_metrics()?;
            }
            let queue = open_queue(&store, &config, &args.queue);
            let guard = queue.listen(LoggingEvents);
            info!(queue = %queue.name(), "Watching queue, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            guard.close();
            if args.metrics {
                print!("{}", export_metrics());
            }
        }
        Commands::RunTasks(args) => {
            if args.metrics {
                init_metrics()?;
            }
            let task_config = TaskConfig::default()
                .with_visibility_timeout(Duration::from_secs(args.visibility_timeout))
                .with_retry_delay(Duration::from_secs(args.retry_delay))
                .with_retry_budget(args.retry_budget);
            let tasks = DelayedTask::<Value>::builder(store as Arc<dyn TaskStore>, &args.task)
                .with_prefix(&config.task_prefix)
                .with_config(task_config)
                .start(|task_id: &str, payload: Value| -> anyhow::Result<()> {
                    info!(task_id = %task_id, payload = %payload, "Task due");
                    Ok(())
                });
            info!(task = %tasks.name(), "Running tasks, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            tasks.close();
            if args.metrics {
                print!("{}", export_metrics());
            }
        }
    }
    Ok(())
}

fn open_queue(store: &Arc<RedisStore>, config: &StoreConfig, args: &QueueArgs) -> AckQueue<Value> {
    let store: Arc<dyn QueueStore> = store.clone();
    AckQueue::new(store, &args.queue)
        .with_prefix(&config.queue_prefix)
        .with_config(args.config())
}

/// Parses a payload argument as JSON, falling back to a JSON string.
fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Prints results as plain text or JSON.
struct Output {
    json: bool,
}

impl Output {
    fn ids(&self, key: &str, ids: &[String]) {
        if self.json {
            println!("{}", json!({ key: ids }));
        } else {
            for id in ids {
                println!("{}", id);
            }
        }
    }

    fn messages(&self, messages: &[Message<Value>]) {
        if self.json {
            let list: Vec<Value> = messages
                .iter()
                .map(|m| json!({ "id": m.id, "payload": m.payload }))
                .collect();
            println!("{}", Value::Array(list));
        } else {
            for message in messages {
                println!("{}\t{}", message.id, message.payload);
            }
        }
    }

    fn value(&self, value: Value) {
        if self.json {
            println!("{}", value);
            return;
        }
        match value {
            Value::Object(map) => {
                for (key, value) in map {
                    println!("{}: {}", key, value);
                }
            }
            other => println!("{}", other),
        }
    }
}
