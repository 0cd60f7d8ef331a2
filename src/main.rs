use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use redpilot::broker::EventKind;
use redpilot::cli::{Cli, Commands, ConfigAction, Display};
use redpilot::config::{RedpilotConfig, StateDir};
use redpilot::error::Result;
use redpilot::guidance::NullGuidance;
use redpilot::intervention::InterventionAction;
use redpilot::llm::HttpLlmClient;
use redpilot::operation::{OperationManager, OperationOpts, OutputMode};
use redpilot::persist::{CheckpointStore, EventLog};
use redpilot::tools::HttpToolHost;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("redpilot=debug")
    } else {
        EnvFilter::new("redpilot=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

fn state_dir(cli_dir: &Option<PathBuf>) -> StateDir {
    StateDir::new(
        cli_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".redpilot")),
    )
}

async fn run(cli: Cli) -> Result<()> {
    let display = Display::new();
    let state = state_dir(&cli.state_dir);

    match cli.command {
        Commands::Init => cmd_init(&display, &state).await,
        Commands::Run {
            goal,
            hitl,
            max_parallel,
            step_budget,
            planner_model,
            executor_model,
            reflector_model,
            output,
        } => {
            let opts = OperationOpts {
                max_parallel,
                step_budget,
                hitl: Some(hitl),
                planner_model,
                executor_model,
                reflector_model,
                output_mode: output.into(),
            };
            cmd_run(&display, &state, &goal, opts).await
        }
        Commands::Status { op_id } => cmd_status(&display, &state, op_id).await,
        Commands::List => cmd_status(&display, &state, None).await,
        Commands::Events { op_id, from_seq } => {
            cmd_events(&display, &state, &op_id, from_seq).await
        }
        Commands::Snapshot { op_id, which } => {
            let checkpoints = CheckpointStore::new(state.operations_dir());
            let checkpoint = checkpoints.load(&op_id).await?;
            let view = match which {
                redpilot::cli::GraphArg::Task => serde_json::json!({
                    "root_id": checkpoint.graph.root_id,
                    "tasks": checkpoint.graph.tasks,
                }),
                redpilot::cli::GraphArg::Causal => serde_json::json!({
                    "nodes": checkpoint.graph.causal_nodes,
                    "edges": checkpoint.graph.causal_edges,
                }),
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Commands::Config { action } => cmd_config(&display, &state, action).await,
    }
}

async fn cmd_init(display: &Display, state: &StateDir) -> Result<()> {
    if state.config_path().exists() {
        display.print_warning("redpilot is already initialized here.");
        return Ok(());
    }
    state.ensure_dirs().await?;
    RedpilotConfig::default().save(&state.root).await?;
    display.print_success("Initialized redpilot.");
    display.print_info(&format!("Configuration: {}", state.config_path().display()));
    Ok(())
}

async fn cmd_run(
    display: &Display,
    state: &StateDir,
    goal: &str,
    opts: OperationOpts,
) -> Result<()> {
    let config = RedpilotConfig::load(&state.root).await?;
    let output_mode = opts.output_mode;
    let hitl = opts.hitl.unwrap_or(config.operation.hitl);

    let llm = Arc::new(HttpLlmClient::new(config.llm.clone(), config.models.clone())?);
    let tools = Arc::new(HttpToolHost::new(config.tools.clone())?);
    let manager =
        OperationManager::new(config, state, llm, tools, Arc::new(NullGuidance)).await?;

    let op_id = manager.start_operation(goal, opts).await?;
    display.print_success(&format!("Started operation {}", op_id));

    let mut stream = manager.subscribe(&op_id, Some(0))?;
    while let Some(event) = stream.recv().await {
        display.print_event(&event, output_mode);

        if hitl && event.event == EventKind::InterventionRequired {
            if let Some(request_id) = event.data["request_id"].as_str() {
                if event.data["auto"].as_bool() != Some(true)
                    && event.data["injected"].as_bool() != Some(true)
                    && event.data["kind"].as_str() != Some("stall")
                {
                    handle_intervention(display, &manager, request_id, &event.data["batch"])
                        .await;
                }
            }
        }
    }

    let status = manager.status(&op_id).await?;
    display.print_status(&op_id, goal, &status);
    Ok(())
}

/// Read the operator's decision line and submit it; re-prompts on invalid
/// input until the request resolves.
async fn handle_intervention(
    display: &Display,
    manager: &OperationManager,
    request_id: &str,
    batch: &serde_json::Value,
) {
    loop {
        display.print_intervention_prompt(request_id, batch);

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await
        .unwrap_or_else(|e| Err(std::io::Error::other(e)));

        let line = match line {
            Ok(line) => line.trim().to_string(),
            Err(_) => return,
        };

        let result = if line == "a" || line.is_empty() {
            manager.submit_intervention(request_id, InterventionAction::Approve, None)
        } else if let Some(reason) = line.strip_prefix("r ").or(if line == "r" {
            Some("rejected by operator")
        } else {
            None
        }) {
            manager.submit_intervention(
                request_id,
                InterventionAction::Reject,
                Some(serde_json::json!({ "reason": reason })),
            )
        } else if let Some(path) = line.strip_prefix("m ") {
            match std::fs::read_to_string(path.trim())
                .map_err(redpilot::RedpilotError::Io)
                .and_then(|content| serde_json::from_str(&content).map_err(Into::into))
            {
                Ok(replacement) => manager.submit_intervention(
                    request_id,
                    InterventionAction::Modify,
                    Some(replacement),
                ),
                Err(e) => Err(e),
            }
        } else {
            display.print_warning("Unrecognized input.");
            continue;
        };

        match result {
            Ok(()) => return,
            Err(e) => display.print_error(&format!("Decision not accepted: {}", e)),
        }
    }
}

async fn cmd_status(display: &Display, state: &StateDir, op_id: Option<String>) -> Result<()> {
    let checkpoints = CheckpointStore::new(state.operations_dir());
    match op_id {
        Some(op_id) => {
            let checkpoint = checkpoints.load(&op_id).await?;
            display.print_status(&checkpoint.op_id, &checkpoint.goal, &checkpoint.status);
            if let Some(pending) = &checkpoint.pending_intervention {
                display.print_warning(&format!(
                    "Pending intervention {} awaits a decision.",
                    pending.id
                ));
            }
        }
        None => {
            let rows: Vec<_> = checkpoints
                .list()
                .await?
                .into_iter()
                .map(|c| (c.op_id, c.goal, c.status))
                .collect();
            display.print_operations(&rows);
        }
    }
    Ok(())
}

async fn cmd_events(
    display: &Display,
    state: &StateDir,
    op_id: &str,
    from_seq: u64,
) -> Result<()> {
    let config = RedpilotConfig::load(&state.root).await?;
    let log = EventLog::open(state.event_db_path(), config.persist.event_tail)?;
    let events = log.tail(op_id, from_seq).await?;
    if events.is_empty() {
        display.print_info("No events retained for this operation.");
        return Ok(());
    }
    for event in events {
        display.print_event(&event, OutputMode::Debug);
    }
    Ok(())
}

async fn cmd_config(display: &Display, state: &StateDir, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = RedpilotConfig::load(&state.root).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Reset => {
            state.ensure_dirs().await?;
            RedpilotConfig::default().save(&state.root).await?;
            display.print_success("Configuration reset to defaults.");
        }
    }
    Ok(())
}
