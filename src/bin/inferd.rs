//! `inferd` CLI: wires a `BenchConfig` to one of the three driver modes.
//! Model code is out of scope for this crate; the CLI drives the
//! always-available echo model (see `inferd::model::demo`) so the
//! scheduling and dispatch paths can be exercised end to end without a
//! real tenant model plugged in.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use inferd::config::{BenchConfig, PolicyKind, RunnerMode};
use inferd::drivers::mlperf::{MlperfQuery, SystemUnderTest};
use inferd::drivers::nshot::{append_report, run_async, run_sync, NShotRequest};
use inferd::drivers::Dispatcher;
use inferd::model::demo::echo_model_spec;
use inferd::policy::balance::PolicyBalance;
use inferd::policy::exclusive::PolicyExclusive;
use inferd::policy::round_robin::PolicyRR;
use inferd::policy::Policy;
use inferd::pool::RunnerPool;
use inferd::store::{InMemoryObjectStore, StoredValue};
use inferd::worker::EchoKaasEngine;

#[derive(Parser, Debug)]
#[command(name = "inferd", about = "Multi-tenant inference dispatcher")]
struct Cli {
    #[arg(long, value_enum, default_value = "actor")]
    mode: ModeArg,

    #[arg(long, value_enum, default_value = "round-robin")]
    policy: PolicyArg,

    #[arg(long, default_value_t = default_n_runners())]
    n_runners: usize,

    #[arg(long)]
    inline: bool,

    #[arg(long, default_value_t = 1)]
    num_clients: usize,

    #[arg(long)]
    warmup_passes: Option<usize>,

    #[arg(long, default_value = "results.json")]
    report_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Task,
    Actor,
    Kaas,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    RoundRobin,
    Balance,
    Exclusive,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synchronous n-shot batch run against `n` synthetic requests.
    NshotSync {
        #[arg(long, default_value_t = 16)]
        n: usize,
    },
    /// Concurrent n-shot batch run across `--num-clients` threads.
    NshotAsync {
        #[arg(long, default_value_t = 16)]
        n: usize,
    },
    /// MLPerf-style single-batch latency harness run.
    Mlperf {
        #[arg(long, default_value_t = 16)]
        n: usize,
    },
    /// Serve requests over TCP at the given address.
    Serve {
        #[arg(long, default_value = "127.0.0.1:5555")]
        addr: String,
    },
}

/// One worker per physical core by default, leaving hyperthreads for the
/// completion handler and client-facing I/O.
fn default_n_runners() -> usize {
    num_cpus::get_physical().max(1)
}

fn build_config(cli: &Cli) -> anyhow::Result<BenchConfig> {
    let mode = match cli.mode {
        ModeArg::Task => RunnerMode::Task,
        ModeArg::Actor => RunnerMode::Actor,
        ModeArg::Kaas => RunnerMode::Kaas,
    };
    let policy = match cli.policy {
        PolicyArg::RoundRobin => PolicyKind::RoundRobin,
        PolicyArg::Balance => PolicyKind::Balance,
        PolicyArg::Exclusive => PolicyKind::Exclusive,
    };
    let mut config = BenchConfig::new(mode, policy, cli.n_runners)?;
    config.inline = cli.inline;
    config.num_clients = cli.num_clients;
    config.report_path = cli.report_path.clone();
    if let Some(w) = cli.warmup_passes {
        config.warmup_passes = w;
    }
    config.validate()?;
    Ok(config)
}

fn build_dispatcher(config: BenchConfig) -> Dispatcher {
    let store = Arc::new(InMemoryObjectStore::new());
    let model_spec = echo_model_spec();
    let kaas_engine = Arc::new(EchoKaasEngine);

    let pool = match config.runner_mode {
        RunnerMode::Task => RunnerPool::for_task_mode(store.clone(), model_spec.clone(), kaas_engine),
        mode => {
            let policy: Box<dyn Policy> = match config.runner_policy {
                PolicyKind::RoundRobin => Box::new(PolicyRR::new(config.n_runners, kaas_engine.clone())),
                PolicyKind::Balance => Box::new(PolicyBalance::new(config.n_runners, store.clone(), kaas_engine.clone())),
                PolicyKind::Exclusive => Box::new(PolicyExclusive::new(
                    config.n_runners,
                    store.clone(),
                    kaas_engine.clone(),
                    std::time::Duration::from_secs(5),
                )),
            };
            RunnerPool::with_policy(mode, policy, store.clone(), model_spec.clone(), kaas_engine)
        }
    };
    Dispatcher::new(config, pool, store, model_spec)
}

fn synthetic_requests(n: usize) -> Vec<NShotRequest> {
    (0..n)
        .map(|i| NShotRequest {
            tenant_id: format!("tenant-{}", i % 3),
            input: vec![i as u8],
            model_arg: StoredValue::Bytes(Arc::new(Vec::new())),
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    match &cli.command {
        Command::NshotSync { n } => {
            let dispatcher = build_dispatcher(config);
            let requests = synthetic_requests(*n);
            let report = run_sync(&dispatcher, &requests);
            append_report(&dispatcher.config().report_path.clone(), &report)?;
            tracing::info!(n = report.records.len(), "nshot sync run complete");
        }
        Command::NshotAsync { n } => {
            let report_path = config.report_path.clone();
            let dispatcher = Arc::new(build_dispatcher(config));
            let requests = synthetic_requests(*n);
            let report = run_async(dispatcher, requests);
            append_report(&report_path, &report)?;
            tracing::info!(n = report.records.len(), "nshot async run complete");
        }
        Command::Mlperf { n } => {
            let dispatcher = Arc::new(build_dispatcher(config));
            let sut = SystemUnderTest::new(dispatcher);
            let queries: Vec<MlperfQuery> = (0..*n)
                .map(|i| MlperfQuery {
                    id: i as u64,
                    tenant_id: format!("tenant-{}", i % 3),
                    input: vec![i as u8],
                })
                .collect();
            let handle = sut.run_batch(queries, Box::new(|id, _r| tracing::debug!(query_id = id, "query complete")));
            let processed = handle.join().map_err(|_| anyhow::anyhow!("completion handler thread panicked"))?;
            tracing::info!(processed, "mlperf batch complete");
        }
        Command::Serve { addr } => {
            let dispatcher = Arc::new(build_dispatcher(config));
            let handler: Arc<dyn inferd::server::RequestHandler> = Arc::new(DispatcherHandler(dispatcher));
            inferd::server::serve_requests(addr, handler).await?;
        }
    }
    Ok(())
}

struct DispatcherHandler(Arc<Dispatcher>);

impl inferd::server::RequestHandler for DispatcherHandler {
    fn handle(&self, tenant_id: &str, input: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let out_ref = self
            .0
            .dispatch(tenant_id, StoredValue::Bytes(Arc::new(Vec::new())), input, None)
            .map_err(|e| anyhow::anyhow!(e))?;
        match self.0.store().get(&out_ref)? {
            StoredValue::Bytes(b) => Ok((*b).clone()),
            other => anyhow::bail!("unexpected stored value shape: {other:?}"),
        }
    }
}
