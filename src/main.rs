use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use contextloom::config::Config;
use contextloom::db::Db;
use contextloom::db::models::ChunkKind;
use contextloom::embedder::{Embedder, mock::MockEmbedder};
use contextloom::engine::Engine;
use contextloom::model::{ModelClient, http::OpenAiCompatClient, mock::MockModel};
use contextloom::orchestrator::GenerateRequest;
use contextloom::sandbox::{CommandSandbox, Sandbox};
use contextloom::tokenizer::TokenizerRegistry;

#[derive(Parser)]
#[command(name = "contextloom", about = "Context assembly engine", version)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a file into a project's corpus.
    Ingest {
        #[arg(long)]
        project: String,
        /// Path of the artifact, relative to the project root.
        path: String,
        /// Artifact kind: code, conversation or log.
        #[arg(long, default_value = "code")]
        kind: String,
    },
    /// Assemble a context bundle for a query and print it as JSON.
    Assemble {
        #[arg(long)]
        project: String,
        query: String,
        #[arg(long)]
        budget: Option<usize>,
        /// Paths to boost, repeatable.
        #[arg(long = "hot")]
        hot_paths: Vec<String>,
    },
    /// Run a full plan/expand/verify generation request.
    Generate {
        #[arg(long)]
        project: String,
        prompt: String,
        #[arg(long)]
        max_context_tokens: Option<usize>,
        /// Workspace the sandbox copies for verification.
        #[arg(long, default_value = ".")]
        workspace: String,
        /// Test command run inside the sandbox.
        #[arg(long, default_value = "cargo test")]
        test_command: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    config.validate()?;

    let db = Db::open(&config.db_path, config.model.embedding_dimensions)
        .context("failed to open database")?;
    let embedder: Arc<dyn Embedder> =
        Arc::new(MockEmbedder::new(config.model.embedding_dimensions));
    let tokenizers = TokenizerRegistry::with_builtin_families();

    let model: Arc<dyn ModelClient> = match &config.model.endpoint {
        Some(endpoint) => Arc::new(OpenAiCompatClient::new(
            endpoint,
            config.model.api_key.clone(),
        )),
        None => {
            info!("No model endpoint configured, using the mock client");
            Arc::new(MockModel::new())
        }
    };

    let sandbox_timeout = config.sandbox.test_timeout_secs;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling in-flight work");
            shutdown.cancel();
        }
    });

    match cli.command {
        Command::Ingest {
            project,
            path,
            kind,
        } => {
            let kind = ChunkKind::parse(&kind)
                .with_context(|| format!("unknown artifact kind: {kind}"))?;
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {path}"))?;

            let sandbox: Arc<dyn Sandbox> = Arc::new(CommandSandbox::new(
                ".",
                vec!["cargo".to_string(), "test".to_string()],
                sandbox_timeout,
            ));
            let engine = Engine::new(config, db, embedder, tokenizers, model, sandbox);
            let report = engine.ingest(&project, &path, &raw, kind, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Assemble {
            project,
            query,
            budget,
            hot_paths,
        } => {
            let sandbox: Arc<dyn Sandbox> = Arc::new(CommandSandbox::new(
                ".",
                vec!["cargo".to_string(), "test".to_string()],
                sandbox_timeout,
            ));
            let engine = Engine::new(config, db, embedder, tokenizers, model, sandbox);
            let response = engine
                .assemble(&project, &query, budget, &hot_paths, None)
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Generate {
            project,
            prompt,
            max_context_tokens,
            workspace,
            test_command,
        } => {
            let test_command: Vec<String> =
                test_command.split_whitespace().map(str::to_string).collect();
            let sandbox: Arc<dyn Sandbox> =
                Arc::new(CommandSandbox::new(workspace, test_command, sandbox_timeout));
            let default_budget = config.assembly.default_token_budget;
            let engine = Engine::new(config, db, embedder, tokenizers, model, sandbox);

            let session_id = engine.create_session(&project);
            let outcome = engine
                .generate(
                    GenerateRequest {
                        request_id: format!("cli-{}", uuid::Uuid::new_v4().simple()),
                        project_id: project,
                        session_id: session_id.clone(),
                        prompt,
                        max_context_tokens: max_context_tokens.unwrap_or(default_budget),
                        hot_paths: Vec::new(),
                    },
                    &cancel,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            engine.expire_session(&session_id);
        }
    }

    Ok(())
}
