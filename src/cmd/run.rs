//! In-process attribution run: `eventsense run <TICKER> <DAY>`.

use anyhow::{Context, Result};
use console::style;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;

use eventsense::attribution::db::{DbHandle, RunDb};
use eventsense::attribution::events::RunEvent;
use eventsense::attribution::pipeline::PipelineDefinition;
use eventsense::attribution::providers::{OfflineProviders, Providers};
use eventsense::attribution::query::{QueryFacade, ResultView, StatusView};
use eventsense::attribution::runner::{ExecutionPolicy, RunOrchestrator};
use eventsense::attribution::store::RunStore;
use eventsense::attribution::submission::SubmitRequest;
use eventsense::config::Config;
use eventsense::ui::RunProgressUI;
use eventsense_common::{AttributionOptions, RunId, RunStatus};

pub struct RunArgs {
    pub ticker: String,
    pub day: String,
    pub query: Option<String>,
    pub second_pass: bool,
    pub hybrid_retrieval: bool,
    pub related_entities: bool,
    pub db_path: Option<PathBuf>,
    pub json: bool,
    pub latency: Duration,
}

impl RunArgs {
    fn request(&self) -> SubmitRequest {
        let request = SubmitRequest::new(&self.ticker, &self.day).with_options(AttributionOptions {
            hybrid_retrieval: self.hybrid_retrieval,
            second_pass: self.second_pass,
            related_entities: self.related_entities,
        });
        match &self.query {
            Some(query) => request.with_query(query),
            None => request,
        }
    }
}

async fn open_store(db_path: Option<&PathBuf>) -> Result<RunStore> {
    match db_path {
        Some(path) => {
            let db = RunDb::new(path)
                .with_context(|| format!("Failed to open run database {}", path.display()))?;
            Ok(RunStore::open(DbHandle::new(db)).await?)
        }
        None => Ok(RunStore::in_memory()),
    }
}

pub async fn cmd_run(config: &Config, args: RunArgs) -> Result<()> {
    let store = open_store(args.db_path.as_ref()).await?;
    let pipeline = PipelineDefinition::attribution();
    let labels = pipeline.steps().iter().map(|s| s.label.clone()).collect();
    let orchestrator = RunOrchestrator::new(
        store.clone(),
        pipeline,
        Providers::from_offline(OfflineProviders::with_latency(args.latency)),
        ExecutionPolicy::from(&config.pipeline),
    );

    let ui = if args.json {
        RunProgressUI::hidden(labels)
    } else {
        RunProgressUI::new(labels)
    };

    // Subscribe before submitting so the creation event is seen.
    let mut events = store.subscribe();
    let run = orchestrator.submit(args.request()).await?;
    let run_id = run.run_id.clone();
    if !args.json {
        println!("Run {}", style(&run_id).bold());
    }

    follow(&orchestrator, &store, &run_id, &mut events, &ui).await?;
    let run = orchestrator.wait(&run_id).await?;
    ui.finish(&run);

    let facade = QueryFacade::new(store);
    let status = facade.status(&run_id)?;
    let result = facade.result(&run_id)?;
    if args.json {
        let output = serde_json::json!({"status": status, "result": result});
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_result(&status, &result);
    }

    if run.status != RunStatus::Done {
        let detail = run
            .error
            .as_ref()
            .map(|e| format!("{}: {}", e.kind, e.detail))
            .unwrap_or_else(|| run.status.to_string());
        anyhow::bail!("Run {} did not complete ({})", run_id, detail);
    }
    Ok(())
}

/// Feed run events to the UI until the run finishes. Ctrl+C requests
/// cancellation and keeps following so the cancelled outcome is shown.
async fn follow(
    orchestrator: &RunOrchestrator,
    store: &RunStore,
    run_id: &RunId,
    events: &mut broadcast::Receiver<RunEvent>,
    ui: &RunProgressUI,
) -> Result<()> {
    let mut interrupted = false;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("Failed to listen for Ctrl+C")?;
                interrupted = true;
                tracing::warn!(run_id = %run_id, "Interrupted; cancelling run");
                orchestrator.cancel(run_id).await?;
            }
            received = events.recv() => {
                match received {
                    Ok(event) if event.run_id() == run_id => {
                        ui.apply(&event);
                        if matches!(event, RunEvent::RunFinished { .. }) {
                            return Ok(());
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if store.get(run_id).is_some_and(|r| r.is_terminal()) {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

fn print_result(status: &StatusView, result: &ResultView) {
    println!();
    for step in &status.steps {
        println!(
            "  {:>2}. {:<46} {}",
            step.id,
            step.label,
            style(step.status).dim()
        );
    }
    if result.results.is_empty() {
        return;
    }
    println!();
    println!("{}", style("Top causes").bold());
    for cause in &result.results {
        println!(
            "  {}. {} {}",
            cause.rank,
            cause.headline,
            style(format!("({:.2})", cause.score)).cyan()
        );
        for line in &cause.evidence {
            println!("     - {}", line);
        }
        if !cause.why_ranks.is_empty() {
            println!("     {} {}", style("why:").dim(), cause.why_ranks.join(", "));
        }
    }
    println!();
    println!(
        "{} {} documents",
        style("Evidence timeline:").bold(),
        result.evidence_timeline.len()
    );
    for item in &result.evidence_timeline {
        println!(
            "  {} [{}] {} {}",
            item.time_et,
            item.source.as_str(),
            style(&item.domain).dim(),
            item.headline
        );
    }
}
