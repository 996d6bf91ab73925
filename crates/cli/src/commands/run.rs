//! `stepwise run` — Plan and execute a task over WebSocket.

use std::path::Path;
use std::sync::Arc;

use stepwise_agent::{Orchestrator, RunStatus};
use stepwise_core::event::EngineEvent;
use stepwise_core::message::{Message, Role};
use stepwise_transport::WsTransport;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use super::load_config;

pub async fn run(
    config_path: Option<&Path>,
    task: &str,
    url: Option<String>,
    max_iterations: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(config_path).map_err(|e| format!("Failed to load config: {e}"))?;
    if let Some(url) = url {
        config.transport.url = url;
    }
    if let Some(max) = max_iterations {
        config.max_iterations = max;
    }
    config.validate()?;

    println!();
    println!("  Endpoint:    {}", config.transport.url);
    println!("  Model:       {}", config.model);
    println!("  Iterations:  {}", config.max_iterations);
    println!();

    info!(url = %config.transport.url, model = %config.model, "Starting run");
    let transport = Arc::new(WsTransport::new(config.transport.url.clone()));
    let orchestrator = Orchestrator::builder(config, transport).build();

    let progress = tokio::spawn(print_progress(orchestrator.subscribe()));

    let stopper = orchestrator.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  Stopping...");
            stopper.stop();
        }
    });

    let outcome = orchestrator.run_task(task).await;
    ctrl_c.abort();
    progress.abort();

    println!();
    for message in orchestrator.messages() {
        print_message(&message);
    }
    println!();

    let outcome = outcome?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    match outcome.status {
        RunStatus::Completed | RunStatus::Partial | RunStatus::Paused | RunStatus::Stopped => Ok(()),
        RunStatus::Failed => Err(outcome.summary.into()),
    }
}

async fn print_progress(mut events: tokio::sync::broadcast::Receiver<Arc<EngineEvent>>) {
    loop {
        match events.recv().await {
            Ok(event) => match event.as_ref() {
                EngineEvent::PlanCreated { plan_id, steps, .. } => {
                    eprintln!("  ▸ plan {plan_id} with {steps} step(s)");
                }
                EngineEvent::StepStarted {
                    step_id, iteration, ..
                } => eprintln!("  ▸ [{iteration}] {step_id}"),
                EngineEvent::Evaluated {
                    step_id,
                    quality,
                    confidence,
                    is_complete,
                    ..
                } => eprintln!(
                    "  ▸ {step_id}: quality {quality:.2}, confidence {confidence:.2}{}",
                    if *is_complete { ", complete" } else { "" }
                ),
                EngineEvent::ToolCallsTruncated {
                    step_id, ignored, ..
                } => eprintln!("  ⚠️  {step_id}: {ignored} tool call(s) ignored"),
                _ => {}
            },
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "Progress display fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_message(message: &Message) {
    let label = match message.role {
        Role::User => "You",
        Role::Assistant => "Assistant",
        Role::Agent => "Agent",
        Role::System => "System",
    };
    for line in message.content.lines() {
        println!("  {label:>9} > {line}");
    }
}
