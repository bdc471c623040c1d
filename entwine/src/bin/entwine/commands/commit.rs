use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use entwine::{
    Actor, AllowAll, Authorizer, Backend, CommitNotifier, Document, GraphEngine, LogNotifier, MemoryBackend,
    RedisBackend, redis::aio::ConnectionManager,
};
use serde_json::Value;

use crate::context::ProjectContext;
use crate::help::ExampleGroup;
use crate::output::{IssueReport, OutputManager};

pub const EXAMPLES: &[ExampleGroup] = &[
    ExampleGroup {
        title: "Commit",
        commands: &[
            "entwine commit module.json                          # Commit one document tree",
            "entwine commit a.json b.json                        # Commit several roots atomically",
            "entwine commit module.json --actor ada --role editor # Commit on behalf of an actor",
        ],
    },
    ExampleGroup {
        title: "Dry Run",
        commands: &["entwine commit module.json --dry-run   # Resolve against an empty in-memory store"],
    },
];

#[derive(Args)]
pub struct CommitArgs {
    /// JSON files, each holding one document or an array of documents
    #[arg(required = true)]
    pub documents: Vec<PathBuf>,

    /// Resolve the graph against an empty in-memory store instead of Redis
    #[arg(long)]
    pub dry_run: bool,

    /// Actor id passed to the authorizer
    #[arg(long, default_value = "cli")]
    pub actor: String,

    /// Role held by the actor (repeatable)
    #[arg(long = "role")]
    pub roles: Vec<String>,
}

pub async fn handle_commit(args: CommitArgs, output: &OutputManager) -> Result<()> {
    let ctx = ProjectContext::find()?;
    let schema = ctx.load_schema()?;
    let documents = load_documents(&args.documents)?;
    output.verbose(&format!("loaded {} root documents", documents.len()));

    let actor = args
        .roles
        .iter()
        .fold(Actor::new(&args.actor), |actor, role| actor.with_role(role));

    let engine = GraphEngine::new(schema).with_notifier(LogNotifier);
    match ctx.authorizer() {
        Some(authorizer) => {
            output.verbose(&format!("using {} configured grants", ctx.config.grants.len()));
            run(&ctx, engine.with_authorizer(authorizer), &actor, documents, args.dry_run, output).await
        }
        None => {
            output.warning("No grants configured in entwine.toml; every actor may write");
            run(&ctx, engine.with_authorizer(AllowAll), &actor, documents, args.dry_run, output).await
        }
    }
}

async fn run<A, N>(
    ctx: &ProjectContext,
    engine: GraphEngine<A, N>,
    actor: &Actor,
    documents: Vec<Document>,
    dry_run: bool,
    output: &OutputManager,
) -> Result<()>
where
    A: Authorizer,
    N: CommitNotifier,
{
    if dry_run {
        output.info("Dry run: committing to an in-memory store");
        let mut backend = MemoryBackend::new();
        return commit_with(&engine, &mut backend, actor, documents, output).await;
    }

    let redis_url = ctx
        .redis_url()
        .context("REDIS_URL environment variable not set. Set it or use --dry-run.")?;
    output.progress("Connecting to Redis");
    let client = redis::Client::open(redis_url.as_str()).context("Failed to create Redis client")?;
    let conn = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    output.clear_line();
    output.success("Connected to Redis");

    let mut backend = RedisBackend::new(conn, ctx.prefix());
    commit_with(&engine, &mut backend, actor, documents, output).await
}

async fn commit_with<A, N, B>(
    engine: &GraphEngine<A, N>,
    backend: &mut B,
    actor: &Actor,
    mut documents: Vec<Document>,
    output: &OutputManager,
) -> Result<()>
where
    A: Authorizer,
    N: CommitNotifier,
    B: Backend,
{
    let result = if documents.len() == 1 {
        let document = documents.remove(0);
        engine.commit(backend, actor, document).await
    } else {
        engine.commit_all(backend, actor, documents).await
    };

    match result {
        Ok(receipt) => {
            output.heading("Committed Records");
            output.display(&receipt)?;
            output.key_value("Root", &format!("{}/{}", receipt.root.kind, receipt.root.id));
            output.key_value("Passes", &receipt.passes.to_string());
            Ok(())
        }
        Err(error) => {
            output.error(&error.to_string());
            output.display(&IssueReport { issues: error.issues() })?;
            Err(error).context("Commit rolled back")
        }
    }
}

/// Reads every file as one document or an array of documents, in argument order.
pub fn load_documents(paths: &[PathBuf]) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    for path in paths {
        documents.extend(read_documents(path)?);
    }
    Ok(documents)
}

fn read_documents(path: &Path) -> Result<Vec<Document>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {} as JSON", path.display()))?;
    let documents = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Document>, _>>(),
        other => serde_json::from_value(other).map(|document| vec![document]),
    };
    documents.with_context(|| format!("{} does not hold entwine documents", path.display()))
}
