use chorus::dispatch::{ChannelDispatcher, PromptRequest};
use chorus::engine::EngineEvent;
use chorus::history::{FileHistory, HistoryStore, MemoryHistory};
use chorus::kernel::Kernel;
use chorus::replay::{replay_transcript, ReplayStats};
use chorus::str_utils::preview;
use chorus::{Args, Conversation, EngineConfig, ProviderId, ResponseStatus, Result, SessionId, Turn};
use clap::Parser;
use colored::*;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _log_guards = match chorus::logging::init_tracing(&args.log_dir) {
        Ok(guards) => Some(guards),
        Err(e) => {
            eprintln!("{} could not set up logging in {:?}: {}", "warning:".yellow(), args.log_dir, e);
            None
        }
    };
    chorus::logging::setup_panic_hook();

    if let Err(e) = run(args).await {
        tracing::error!("Replay failed: {}", e);
        eprintln!("{} {}", "error:".red().bold(), e.inner);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = EngineConfig::from(&args);
    let history: Arc<dyn HistoryStore> = match &args.history_dir {
        Some(dir) => Arc::new(FileHistory::new(dir)),
        None => Arc::new(MemoryHistory::new()),
    };

    let (tx_out, mut rx_out) = mpsc::channel(16);
    let (kernel, handle) = Kernel::new(&config, Arc::new(ChannelDispatcher::new(tx_out)), history);
    let kernel_task = tokio::spawn(kernel.run());

    // Stand-in for the connection layer: outbound requests are only logged.
    tokio::spawn(async move {
        while let Some(request) = rx_out.recv().await {
            match serde_json::to_string(&request) {
                Ok(json) => tracing::info!("[KERNEL] -> ExecuteWorkflowRequest {}", json),
                Err(e) => tracing::warn!("[KERNEL] Unserializable request: {}", e),
            }
        }
    });
    tokio::spawn(report_events(handle.subscribe_events()));

    if let Some(session) = &args.session {
        handle
            .switch_session(Some(SessionId::from(session.as_str())))
            .await?;
    }

    let dispatch = handle
        .submit_prompt(PromptRequest {
            text: args.prompt.clone(),
            providers: args.providers.iter().map(|p| ProviderId::from(p.as_str())).collect(),
            synthesis: args.synthesis.iter().map(|p| ProviderId::from(p.as_str())).collect(),
            ensemble: Vec::new(),
            use_thinking: None,
        })
        .await?;
    tracing::info!("[KERNEL] Round {} dispatched", dispatch.target_turn_id.short());

    let transcript = tokio::fs::File::open(&args.transcript).await?;
    let stats = replay_transcript(&handle, transcript).await?;
    let conversation = handle.teardown().await?;
    let _ = kernel_task.await;

    print_summary(&conversation, &stats);

    if let Some(out) = &args.out {
        let json = serde_json::to_string_pretty(&*conversation)?;
        tokio::fs::write(out, json).await?;
        println!("Snapshot written to {}", out.display());
    }
    Ok(())
}

async fn report_events(mut rx: broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(EngineEvent::AwaitingAction { turn_id }) => {
                println!("{} turn {} complete", "✔".green(), turn_id.short());
            }
            Ok(EngineEvent::DispatchFailed { turn_id, error }) => {
                println!("{} dispatch for {} failed: {}", "✘".red(), turn_id.short(), error);
            }
            Ok(EngineEvent::MessageDropped { reason }) => {
                tracing::debug!("[ROUTER] Dropped: {}", reason);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event reporter lagged by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_summary(conversation: &Conversation, stats: &ReplayStats) {
    println!(
        "\n{} {} lines, {} delivered, {} malformed",
        "Replay:".bold(),
        stats.lines,
        stats.delivered,
        stats.malformed
    );
    for turn in &conversation.turns {
        match turn {
            Turn::User(u) => println!("\n{} {}", "User:".bold().cyan(), u.text),
            Turn::Ai(a) => {
                let label = match &a.derived_from {
                    Some(origin) => format!("AI ({})", origin.kind),
                    None => "AI".to_string(),
                };
                println!("{}", label.bold());
                for (provider, r) in &a.batch_responses {
                    print_entry("batch", provider, r.status, &r.text, r.error.as_deref());
                }
                for (bucket, takes) in [("synthesis", &a.synthesis_responses), ("ensemble", &a.ensemble_responses)] {
                    for (provider, list) in takes {
                        if let Some(r) = list.last() {
                            print_entry(bucket, provider, r.status, &r.text, r.error.as_deref());
                        }
                    }
                }
            }
        }
    }
}

fn print_entry(bucket: &str, provider: &ProviderId, status: ResponseStatus, text: &str, error: Option<&str>) {
    let status = match status {
        ResponseStatus::Completed => status.to_string().green(),
        ResponseStatus::Error => status.to_string().red(),
        _ => status.to_string().yellow(),
    };
    let detail = match error {
        Some(err) => err.red().to_string(),
        None => format!("{:?}", preview(text, 60)),
    };
    println!("  [{}] {:<12} {:<10} {}", bucket, provider.to_string(), status, detail);
}
