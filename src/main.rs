//! caregap
//!
//! Entry point: serves decision support and runs the nightly scheduler, or
//! performs a single batch run.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use caregap::api::{self, AppState};
use caregap::cds::{DecisionSupportAdapter, EngineEvaluator};
use caregap::clock;
use caregap::config::{self, Config};
use caregap::core::{
    ContextBuilder, DefinitionRegistry, HttpNarrativeService, InMemoryDataSource, MeasureEngine, NarrativeService,
    RiskScoringModule, RulesEngine,
};
use caregap::db::sqlite::SqliteResultStore;
use caregap::db::{InMemoryResultStore, ResultStore};
use caregap::scheduler::{InMemoryJobStore, Pipeline, Scheduler};
use caregap::telemetry;
use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_actix_web::TracingLogger;

#[derive(Debug, Parser)]
#[command(name = "caregap", version, about = "Care-gap evaluation engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve decision-support hooks and run the nightly scheduler (default).
    Serve,
    /// Run one batch recomputation, wait for it and print a summary.
    RunNightly,
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config().context("failed to load configuration")?;
    telemetry::init(&config.logging);

    let engine = Engine::assemble(&config).await?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, engine).await,
        Command::RunNightly => run_nightly(config, engine).await,
    }
}

/// Everything both commands share.
struct Engine {
    pipeline: Pipeline,
    scheduler: Arc<Scheduler>,
}

impl Engine {
    async fn assemble(config: &Config) -> Result<Self> {
        let clock = clock::system();

        let registry = DefinitionRegistry::load_dir(&config.definitions.dir)
            .with_context(|| format!("failed to load definitions from {}", config.definitions.dir.display()))?;
        let source = InMemoryDataSource::load_dir(&config.context.bundles_dir)
            .with_context(|| format!("failed to load bundles from {}", config.context.bundles_dir.display()))?;
        let risk = RiskScoringModule::new(config.risk_model.clone(), clock.clone()).context("invalid risk model")?;

        let results: Arc<dyn ResultStore> = match &config.database.url {
            Some(url) => Arc::new(
                SqliteResultStore::connect(url, config.database.max_connections)
                    .await
                    .context("failed to connect to result database")?,
            ),
            None => {
                info!("no database configured, keeping results in memory");
                Arc::new(InMemoryResultStore::new())
            }
        };

        let narratives: Option<Arc<dyn NarrativeService>> = match (&config.insights.endpoint, config.insights.enabled) {
            (Some(endpoint), true) => Some(Arc::new(
                HttpNarrativeService::new(
                    endpoint.clone(),
                    config.insights.model.clone(),
                    config.insights.api_key.clone(),
                    Duration::from_millis(config.insights.timeout_ms),
                )
                .context("failed to build narrative client")?,
            )),
            (None, true) => anyhow::bail!("insights are enabled but no endpoint is configured"),
            _ => None,
        };

        let pipeline = Pipeline {
            registry: Arc::new(registry),
            contexts: Arc::new(ContextBuilder::new(Arc::new(source), clock.clone())),
            measures: Arc::new(MeasureEngine::new(
                clock.clone(),
                ChronoDuration::seconds(config.engine.staleness_secs),
            )),
            rules: Arc::new(RulesEngine::new(clock.clone())),
            risk: Arc::new(risk),
            results,
            narratives,
            clock: clock.clone(),
            period_months: config.engine.period_months,
        };

        let mut scheduler_config = config.scheduler.clone();
        scheduler_config.insights_enabled = config.insights.enabled;
        let scheduler = Arc::new(Scheduler::new(
            scheduler_config,
            pipeline.clone(),
            Arc::new(InMemoryJobStore::new()),
            clock,
        ));

        Ok(Self { pipeline, scheduler })
    }
}

async fn serve(config: Config, engine: Engine) -> Result<()> {
    let Engine { pipeline, scheduler } = engine;
    scheduler.start().await;

    let evaluator = EngineEvaluator::new(
        pipeline.contexts.clone(),
        pipeline.registry.clone(),
        pipeline.rules.clone(),
        pipeline.risk.clone(),
        ChronoDuration::seconds(config.context.warm_ttl_secs),
    );
    let state = web::Data::new(AppState {
        adapter: Arc::new(DecisionSupportAdapter::new(config.cds.clone(), Arc::new(evaluator))),
        scheduler: Some(scheduler.clone()),
    });

    let bind = (config.server.host.clone(), config.server.port);
    info!(host = %bind.0, port = bind.1, "starting HTTP server");

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(state.clone())
            .configure(api::configure)
    })
    .bind(bind)
    .context("failed to bind HTTP listener")?
    .run()
    .await
    .context("HTTP server failed")?;

    scheduler.shutdown().await;
    Ok(())
}

async fn run_nightly(config: Config, engine: Engine) -> Result<()> {
    let Engine { pipeline, scheduler } = engine;
    scheduler.start().await;

    let report = scheduler.run_nightly().await.context("failed to enqueue nightly run")?;
    let summary = scheduler.wait_for_run(&report).await;
    scheduler.shutdown().await;

    if let Some(keep) = config.database.keep_versions {
        let pruned = pipeline.results.prune_superseded(keep).await?;
        info!(pruned, keep, "superseded measure results pruned");
    }

    let mut measures = Vec::new();
    for definition in pipeline.registry.measures() {
        let results = pipeline.results.latest_measure_results(definition.id()).await?;
        measures.extend(MeasureEngine::summarize(results.iter()));
    }

    let out = serde_json::json!({
        "run": report,
        "summary": summary,
        "measures": measures,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
