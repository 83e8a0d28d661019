use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dialectic::anthropic::AnthropicClient;
use dialectic::artifact::{FileManager, FsStorage};
use dialectic::cli::{Cli, Command};
use dialectic::config::DialecticConfig;
use dialectic::model::{ModelCaller, ModelCatalog, StubModel};
use dialectic::notify::LogNotifier;
use dialectic::planner::{GenerationRequest, JobPlanner};
use dialectic::progression::{force_fail, session_details};
use dialectic::recipe::{RecipeBook, RecipeRepository};
use dialectic::session::{Project, Session};
use dialectic::store::Store;
use dialectic::ui::{StageProgress, print_details, print_recipes};
use dialectic::worker::{Worker, WorkerPool};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DialecticConfig::load()?;
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(state) = cli.state {
        config.state_path = state;
    }
    init_tracing(&config, cli.verbose);

    let store = Arc::new(Store::open(&config.state_path)?.with_notifier(Arc::new(LogNotifier)));
    let recipes: Arc<RecipeBook> = Arc::new(match &config.recipes_path {
        Some(path) => RecipeBook::from_path(path)
            .with_context(|| format!("loading recipes from {}", path.display()))?,
        None => RecipeBook::builtin()?,
    });
    let catalog = Arc::new(config.catalog());

    match cli.command {
        Command::Init {
            name,
            prompt,
            models,
            owner,
        } => {
            if let Some(unknown) = models.iter().find(|m| catalog.get(m).is_none()) {
                bail!("unknown model '{unknown}'");
            }
            let project = Project::new(&owner, &name, &prompt);
            let session = Session::new(project.id, models);
            println!("project {}", project.id);
            println!("session {} ({})", session.id, session.status);
            store.transaction(|tx| {
                tx.insert_project(project);
                tx.insert_session(session);
                Ok(())
            })?;
        }
        Command::Generate {
            session,
            wallet,
            auth_token,
            test,
            no_continue,
        } => {
            let session_id = resolve_session(&store, session)?;
            let session = store.read(|t| t.session(session_id).cloned())??;
            let request = GenerationRequest {
                project_id: session.project_id,
                session_id,
                stage_slug: session.current_stage.slug().to_string(),
                iteration_number: session.iteration_count,
                selected_model_ids: session.selected_model_ids.clone(),
                wallet_id: wallet,
                auth_token,
                continue_until_complete: Some(!no_continue),
                max_retries: Some(config.max_retries),
                is_test_job: Some(test),
            };

            let planner = JobPlanner::new(
                store.clone(),
                recipes.clone(),
                catalog.clone(),
                config.max_retries,
            );
            let planned = match planner.plan(&request) {
                Ok(planned) => planned,
                Err(e) => {
                    eprintln!("{}", serde_json::to_string_pretty(&e.to_api_error())?);
                    bail!("could not plan stage {}: {e}", session.current_stage);
                }
            };
            info!(roots = planned.job_ids.len(), stage = %session.current_stage, "stage planned");

            let worker = build_worker(&config, &store, &recipes, &catalog)?;
            let label = format!(
                "{} (iteration {}, {} model(s))",
                session.current_stage,
                session.iteration_count,
                planned.job_ids.len()
            );
            run_pool(worker, &config, &store, session_id, &label).await?;
        }
        Command::Resume { session } => {
            let session_id = resolve_session(&store, session)?;
            let worker = build_worker(&config, &store, &recipes, &catalog)?;
            // Nothing else runs against this state file, so every claim left
            // in `processing` belongs to an interrupted run.
            let recovered = worker.recover_stale(Duration::ZERO)?;
            info!(recovered, "resuming queued jobs");
            run_pool(worker, &config, &store, session_id, "resume").await?;
        }
        Command::Status { session } => {
            let session_id = resolve_session(&store, session)?;
            print_details(&session_details(&store, &catalog, session_id)?);
        }
        Command::Recipes => print_recipes(&recipes),
        Command::FailJob { job_id, reason } => {
            let job = force_fail(&store, job_id, &reason)?;
            println!("job {} is now {}", job.id, job.status);
        }
    }

    Ok(())
}

fn build_worker(
    config: &DialecticConfig,
    store: &Arc<Store>,
    recipes: &Arc<RecipeBook>,
    catalog: &Arc<ModelCatalog>,
) -> Result<Arc<Worker>> {
    let settings = config.worker_settings();
    let model: Arc<dyn ModelCaller> = if config.api_key.is_empty() {
        warn!("no API key configured, using the offline stub model");
        Arc::new(StubModel)
    } else {
        Arc::new(AnthropicClient::new(config.api_key.clone(), settings.model_timeout)?)
    };
    let storage = Arc::new(FsStorage::new(&config.storage_root));
    let files = Arc::new(FileManager::new(
        storage,
        store.clone(),
        &config.storage_bucket,
        config.storage_timeout(),
    ));
    let recipes: Arc<dyn RecipeRepository> = recipes.clone();
    Ok(Arc::new(Worker::new(
        store.clone(),
        files,
        recipes,
        catalog.clone(),
        model,
        settings,
    )))
}

async fn run_pool(
    worker: Arc<Worker>,
    config: &DialecticConfig,
    store: &Store,
    session_id: Uuid,
    label: &str,
) -> Result<()> {
    let progress = StageProgress::start(label);
    match WorkerPool::new(worker, config.workers).run_until_idle().await {
        Ok(report) => {
            let status = store.read(|t| t.session(session_id).map(|s| s.status))??;
            progress.complete(&report, status);
            Ok(())
        }
        Err(e) => {
            progress.abort(&e.to_string());
            Err(e.into())
        }
    }
}

fn init_tracing(config: &DialecticConfig, verbose: bool) {
    let default = if verbose {
        "dialectic=debug"
    } else {
        config.log_filter.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// The given session, or the most recently created one.
fn resolve_session(store: &Store, session: Option<Uuid>) -> Result<Uuid> {
    if let Some(id) = session {
        return Ok(id);
    }
    store
        .read(|t| {
            t.sessions
                .values()
                .max_by_key(|s| s.created_at)
                .map(|s| s.id)
        })?
        .context("no session yet, run `dialectic init` first")
}
