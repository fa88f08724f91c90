//! gexec - sandboxed code execution service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use gexec_sandbox::{
    api::{ApiServer, ApiState},
    benchmark::{load_problems, run_evaluation},
    config::Config,
    limiter::AdmissionLimiter,
    llm::OllamaClient,
    metrics::Metrics,
    sandbox::{ContainerRuntime, DockerRuntime, InstanceRegistry, SandboxExecutor, connect_docker},
    shutdown::{ShutdownCoordinator, termination_signal},
};

#[derive(Parser, Debug)]
#[command(name = "gexec")]
#[command(about = "Run untrusted code in short-lived, network-isolated containers")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (default)
    Serve,

    /// Score an Ollama model on a problem set with pass@k
    Evaluate {
        /// JSON file containing an array of problems
        #[arg(short, long)]
        problems: PathBuf,

        /// Generation attempts per problem
        #[arg(short, default_value_t = 1)]
        k: u32,

        /// Also write the report to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Pull the model first if the server does not have it
        #[arg(long)]
        pull: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gexec_sandbox=info,gexec=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::from_env()?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Evaluate {
            problems,
            k,
            output,
            pull,
        } => evaluate(config, problems, k, output, pull).await,
    }
}

/// Docker runtime, reusing the startup connection when the daemon answers.
async fn docker_runtime() -> Arc<dyn ContainerRuntime> {
    match connect_docker().await {
        Ok(docker) => {
            tracing::info!("Connected to Docker");
            Arc::new(DockerRuntime::with_client(docker))
        }
        Err(e) => {
            tracing::warn!(
                "Docker not reachable ({}); executions will fail until it is",
                e
            );
            Arc::new(DockerRuntime::new())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting gexec sandbox server...");

    let registry = Arc::new(InstanceRegistry::new());
    let runtime = docker_runtime().await;
    let executor = Arc::new(SandboxExecutor::new(
        runtime,
        Arc::clone(&registry),
        config.sandbox.clone(),
    ));
    tracing::info!(
        languages = config.sandbox.languages.len(),
        memory_mb = config.sandbox.memory_limit_mb,
        default_timeout_ms = config.sandbox.default_timeout.as_millis() as u64,
        "Sandbox executor initialized"
    );

    let limiter = Arc::new(AdmissionLimiter::new(config.rate_limit.clone()));
    let eviction = limiter.spawn_eviction(config.rate_limit.idle_ttl.min(Duration::from_secs(60)));

    let coordinator = Arc::new(ShutdownCoordinator::new(
        Arc::clone(&registry),
        &config.shutdown,
        config.sandbox.teardown_timeout,
    ));

    let state = ApiState {
        executor,
        metrics: Arc::new(Metrics::new()),
        limiter,
        coordinator: Arc::clone(&coordinator),
    };

    let addr = config.http.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let mut server = tokio::spawn(ApiServer::serve(
        listener,
        state,
        coordinator.drain_signal(),
    ));

    let early_exit = tokio::select! {
        _ = termination_signal() => None,
        result = &mut server => Some(result),
    };

    tracing::info!("Shutting down server...");
    coordinator.begin_drain();

    let report = match early_exit {
        None => {
            coordinator
                .finish(async {
                    match server.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::error!("Server error during drain: {}", e),
                        Err(e) => tracing::error!("Server task failed: {}", e),
                    }
                })
                .await
        }
        Some(result) => {
            match result {
                Ok(Ok(())) => tracing::warn!("Server stopped unexpectedly"),
                Ok(Err(e)) => tracing::error!("Server failed: {}", e),
                Err(e) => tracing::error!("Server task failed: {}", e),
            }
            coordinator.finish(async {}).await
        }
    };

    eviction.abort();
    tracing::info!(
        drained = report.drained,
        swept = report.swept,
        "Server exited"
    );
    Ok(())
}

async fn evaluate(
    config: Config,
    problems_path: PathBuf,
    k: u32,
    output: Option<PathBuf>,
    pull: bool,
) -> anyhow::Result<()> {
    let client = OllamaClient::from_config(&config.llm)?;
    client
        .wait_until_ready(Duration::from_secs(120), Duration::from_secs(2))
        .await?;

    if !client.has_model().await? {
        if pull {
            client.pull_model().await?;
        } else {
            tracing::warn!(
                model = %client.model(),
                "Model not present on the Ollama server; pass --pull to fetch it"
            );
        }
    }

    let problems = load_problems(&problems_path)?;
    tracing::info!(
        problems = problems.len(),
        k,
        model = %client.model(),
        "Starting evaluation"
    );

    let registry = Arc::new(InstanceRegistry::new());
    let executor = SandboxExecutor::new(
        docker_runtime().await,
        Arc::clone(&registry),
        config.sandbox.clone(),
    );

    let report = tokio::select! {
        report = run_evaluation(&problems, k, &client, &executor) => Some(report),
        _ = termination_signal() => None,
    };

    // Interrupted runs may leave containers behind.
    let swept = registry.cleanup_all(config.sandbox.teardown_timeout).await;
    if swept > 0 {
        tracing::info!(swept, "Removed leftover containers");
    }

    let Some(report) = report else {
        anyhow::bail!("evaluation interrupted");
    };

    let json = serde_json::to_string_pretty(&report)?;
    println!("{}", json);
    if let Some(path) = output {
        std::fs::write(&path, &json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
    }
    Ok(())
}
