//! AsyncOp CLI - submit, run and inspect asynchronous operations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use asyncop_core::{ExecutionContext, OperationId, OperationRecord, OperationStatus, RecordFilter};
use asyncop_executor::{ProcessTaskExecutor, TaskDefinition};
use asyncop_functions::{CommandFunction, FunctionRegistry};
use asyncop_operations::{
    CompletionWaiter, OperationLauncher, OperationRunner, Payload, RunnerConfig, StartRequest,
    WaiterConfig,
};
use asyncop_storage::{open_record_store, FsPayloadStore, PayloadRouter, RecordStore, StoreLocation};

#[derive(Parser)]
#[command(name = "asyncop")]
#[command(about = "Asynchronous operation orchestration", long_about = None)]
struct Cli {
    /// Record store location (json:<dir>, sqlite:<path>, or a directory)
    #[arg(long, global = true, env = "ASYNCOP_STORE", default_value = "json:.asyncop/records")]
    store: String,

    /// Directory for inline payloads
    #[arg(long, global = true, env = "ASYNCOP_PAYLOAD_DIR", default_value = ".asyncop/payloads")]
    payload_dir: PathBuf,

    /// Register an external command as a function: NAME=PROGRAM [ARGS...]
    #[arg(long = "command", global = true, value_name = "NAME=COMMAND")]
    commands: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit an operation and launch its execution context
    Start {
        /// Target function ID
        #[arg(long)]
        function: String,
        /// Inline JSON payload
        #[arg(long, conflicts_with = "payload_uri")]
        payload: Option<String>,
        /// URI of an already stored payload
        #[arg(long)]
        payload_uri: Option<String>,
        /// Execution cluster ID
        #[arg(long, default_value = "default")]
        cluster: String,
        /// Task definition ID
        #[arg(long, default_value = "runner")]
        task_definition: String,
        /// Description stored on the record
        #[arg(long, default_value = "")]
        description: String,
        /// Operation type stored on the record
        #[arg(long = "type", default_value = "")]
        operation_type: String,
        /// Maximum concurrently running contexts on the cluster
        #[arg(long)]
        max_running: Option<usize>,
        /// Block until the operation completes
        #[arg(long)]
        wait: bool,
        /// Wait timeout in seconds
        #[arg(long, default_value = "900")]
        timeout: u64,
        /// Mark the operation RUNNER_FAILED if its context dies without a result
        #[arg(long)]
        reconcile: bool,
    },
    /// Run the operation described by ASYNC_OPERATION_CONTEXT (execution context entry)
    Run {
        /// Payload fetch timeout in seconds
        #[arg(long, default_value = "60")]
        fetch_timeout: u64,
        /// Function timeout in seconds
        #[arg(long, default_value = "900")]
        invoke_timeout: u64,
        /// Result write timeout in seconds
        #[arg(long, default_value = "30")]
        write_timeout: u64,
    },
    /// Wait for an operation's record to become terminal
    Wait {
        /// Operation ID
        id: String,
        /// Timeout in seconds
        #[arg(long, default_value = "900")]
        timeout: u64,
        /// Poll interval in milliseconds
        #[arg(long, default_value = "500")]
        interval: u64,
    },
    /// Show an operation record
    Show {
        /// Operation ID
        id: String,
    },
    /// List operations
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by operation type
        #[arg(long = "type")]
        operation_type: Option<String>,
        /// Maximum results
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            function,
            payload,
            payload_uri,
            cluster,
            task_definition,
            description,
            operation_type,
            max_running,
            wait,
            timeout,
            reconcile,
        } => {
            let payload = match (payload, payload_uri) {
                (Some(json), None) => {
                    Payload::Inline(serde_json::from_str(&json).context("--payload is not valid JSON")?)
                }
                (None, Some(uri)) => Payload::Reference(uri),
                (None, None) => Payload::Inline(serde_json::Value::Null),
                (Some(_), Some(_)) => bail!("--payload and --payload-uri are exclusive"),
            };

            ensure_shared_location(&cli.store)?;
            // Fail before launching anything if a --command is malformed.
            function_registry(&cli.commands)?;

            let records = open_record_store(&cli.store).await?;
            let payloads = Arc::new(FsPayloadStore::new(&cli.payload_dir)?);

            let program = std::env::current_exe().context("cannot locate the asyncop binary")?;
            let mut args = Vec::new();
            for command in &cli.commands {
                args.push("--command".to_string());
                args.push(command.clone());
            }
            args.push("run".to_string());
            let runner = TaskDefinition::new(program.to_string_lossy(), args);
            let mut executor = ProcessTaskExecutor::new().with_task_definition("runner", runner);
            if let Some(limit) = max_running {
                executor = executor.with_cluster_capacity(cluster.clone(), limit);
            }
            let executor = Arc::new(executor);

            let launcher = OperationLauncher::new(records.clone(), payloads, executor.clone(), cli.store.clone());
            let response = launcher
                .start(StartRequest {
                    target_function_id: function,
                    execution_cluster_id: cluster,
                    task_definition_id: task_definition,
                    description,
                    operation_type,
                    payload,
                })
                .await?;

            if !wait {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }

            let waiter = CompletionWaiter::new(records, executor)
                .with_config(WaiterConfig::default().with_reconcile_unexpected_stop(reconcile));
            let record = waiter
                .wait(response.id, &response.task_handle, Duration::from_secs(timeout))
                .await?;
            print_record(&record)?;
        }
        Commands::Run {
            fetch_timeout,
            invoke_timeout,
            write_timeout,
        } => {
            let context = ExecutionContext::from_process_env()?;
            let config = RunnerConfig::default()
                .with_fetch_timeout(Duration::from_secs(fetch_timeout))
                .with_invoke_timeout(Duration::from_secs(invoke_timeout))
                .with_write_timeout(Duration::from_secs(write_timeout));

            let fetcher = Arc::new(PayloadRouter::standard(config.fetch_timeout)?);
            let runner = OperationRunner::new(fetcher, Arc::new(function_registry(&cli.commands)?))
                .with_config(config);
            let record = runner.run(&context).await?;
            info!("Operation {} recorded as {}", record.id, record.status);
        }
        Commands::Wait { id, timeout, interval } => {
            let id = parse_id(&id)?;
            let records = open_record_store(&cli.store).await?;
            let record = wait_for_record(
                records.as_ref(),
                id,
                Duration::from_secs(timeout),
                Duration::from_millis(interval),
            )
            .await?;
            print_record(&record)?;
        }
        Commands::Show { id } => {
            let id = parse_id(&id)?;
            let records = open_record_store(&cli.store).await?;
            print_record(&records.get(id).await?)?;
        }
        Commands::List {
            status,
            operation_type,
            limit,
        } => {
            let status = status
                .map(|s| s.parse::<OperationStatus>())
                .transpose()?;
            let filter = RecordFilter {
                status,
                operation_type,
                limit,
            };
            let records = open_record_store(&cli.store).await?;
            let operations = records.list(&filter).await?;

            println!("Operations ({})", operations.len());
            for record in operations {
                println!(
                    "  {} | {} | {} | {}",
                    record.id,
                    record.status,
                    record.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.description,
                );
            }
        }
    }

    Ok(())
}

/// Built-in functions plus any `NAME=PROGRAM [ARGS...]` commands.
fn function_registry(commands: &[String]) -> Result<FunctionRegistry> {
    let mut registry = FunctionRegistry::with_builtins();
    for spec in commands {
        let Some((name, command)) = spec.split_once('=') else {
            bail!("Invalid --command {:?}: expected NAME=PROGRAM [ARGS...]", spec);
        };
        let mut words = command.split_whitespace().map(str::to_string);
        let (name, Some(program)) = (name.trim(), words.next()) else {
            bail!("Invalid --command {:?}: missing program", spec);
        };
        if name.is_empty() {
            bail!("Invalid --command {:?}: missing name", spec);
        }
        registry.register(Arc::new(CommandFunction::new(name, program, words.collect())));
    }
    Ok(registry)
}

/// The runner opens the store from its own process, so it must be shared.
fn ensure_shared_location(location: &str) -> Result<()> {
    if let StoreLocation::Memory(name) = StoreLocation::parse(location)? {
        bail!(
            "memory:{} is private to this process; use a json: or sqlite: store for start",
            name
        );
    }
    Ok(())
}

fn parse_id(id: &str) -> Result<OperationId> {
    id.parse()
        .map_err(|_| anyhow::anyhow!("Invalid operation ID: {}", id))
}

fn print_record(record: &OperationRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

/// Poll the record store until the record is terminal.
async fn wait_for_record(
    records: &dyn RecordStore,
    id: OperationId,
    timeout: Duration,
    interval: Duration,
) -> Result<OperationRecord> {
    let start = Instant::now();
    loop {
        let record = records.get(id).await?;
        if record.is_terminal() {
            return Ok(record);
        }
        if start.elapsed() >= timeout {
            warn!("Operation {} still {} after {:?}", id, record.status, timeout);
            bail!("Operation {} did not complete within {:?}", id, timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_rejected_for_start() {
        let err = ensure_shared_location("memory:ops").unwrap_err();
        assert!(err.to_string().contains("memory:ops"));

        ensure_shared_location("json:.asyncop/records").unwrap();
        ensure_shared_location("sqlite:ops.db").unwrap();
        ensure_shared_location(".asyncop/records").unwrap();
    }

    #[test]
    fn test_function_registry_with_commands() {
        let registry = function_registry(&["upper=tr a-z A-Z".to_string()]).unwrap();
        assert_eq!(registry.names(), vec!["echo", "fail", "sleep", "upper"]);

        assert!(function_registry(&["no-equals".to_string()]).is_err());
        assert!(function_registry(&["name=".to_string()]).is_err());
        assert!(function_registry(&["=cat".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_repeated_commands() {
        let cli = Cli::try_parse_from([
            "asyncop",
            "--command",
            "a=cat",
            "run",
            "--command",
            "b=cat",
        ])
        .unwrap();
        assert_eq!(cli.commands, vec!["a=cat", "b=cat"]);
        assert!(matches!(cli.command, Commands::Run { .. }));
    }
}
