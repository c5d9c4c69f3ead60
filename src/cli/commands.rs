//! CLI command implementations

use anyhow::Result;
use chrono::Utc;
use dialoguer::Select;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::session::{Identity, Manager, PendingRequest, RequestOutcome, Resolution};
use crate::stream::ConnectionStatus;

/// Answers offered by the interactive prompt, in display order
const CHOICES: [Resolution; 3] = [
    Resolution::Approved,
    Resolution::Rejected,
    Resolution::Dismissed,
];

/// An open terminal prompt for one request
struct Prompt {
    request_id: String,
    answer: oneshot::Receiver<Result<Option<Resolution>>>,
}

/// Watch incoming dApp requests for a user until Ctrl-C
pub async fn watch(config: &Config, user_id: &str, interactive: bool) -> Result<()> {
    let identity = Identity::new(user_id)?;
    let manager = Manager::with_relay(identity, config.clone())?;

    let mut active_rx = manager.subscribe_active_request();
    let mut status_rx = manager.subscribe_connection_status();
    let mut settled_rx = manager.subscribe_settled();
    let mut sessions_rx = manager.subscribe_sessions();
    let mut prompt: Option<Prompt> = None;

    manager.start()?;
    info!(
        "Watching dApp requests for {} via {}",
        manager.identity(),
        config.relay.http_url
    );
    if !interactive {
        info!("Read-only mode; pending requests will run to expiry");
    }

    loop {
        tokio::select! {
            changed = active_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = active_rx.borrow_and_update().clone();
                let Some(request) = current else { continue };

                println!("{}", describe(&request, Utc::now()));
                if interactive && prompt.is_none() {
                    prompt = Some(open_prompt(request));
                }
            }
            (request_id, answer) = answered(&mut prompt) => {
                prompt = None;
                match answer {
                    Ok(Some(resolution)) => match manager.resolve(&request_id, resolution) {
                        Ok(_) => info!("Request {} {}", request_id, resolution),
                        Err(e) if e.is_benign_race() => {
                            warn!("Request {} expired before it was answered", request_id)
                        }
                        Err(e) => error!("Failed to resolve {}: {}", request_id, e),
                    },
                    Ok(None) => info!("Left request {} pending", request_id),
                    Err(e) => error!("Prompt failed: {}", e),
                }

                // A newer request may have arrived while the prompt was open
                if let Some(next) = manager.active_request() {
                    if next.id != request_id {
                        prompt = Some(open_prompt(next));
                    }
                }
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let record = status_rx.borrow_and_update().clone();
                match record.status {
                    ConnectionStatus::Connected => info!(
                        "Relay connected ({})",
                        record.transport.map(|t| t.to_string()).unwrap_or_default()
                    ),
                    ConnectionStatus::Reconnecting => warn!(
                        "Relay connection lost: {}",
                        record.last_error.as_deref().unwrap_or("unknown")
                    ),
                    ConnectionStatus::Disconnected => {
                        if let Some(e) = record.last_error.as_deref() {
                            error!("Relay unavailable: {}", e);
                        }
                    }
                    ConnectionStatus::Connecting => {}
                }
            }
            settled = settled_rx.recv() => match settled {
                Ok(settled) => {
                    if settled.outcome == RequestOutcome::Expired {
                        println!("Request {} ({}) expired", settled.request.id, settled.request.method);
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Missed {} request outcomes", n),
                Err(RecvError::Closed) => break,
            },
            session = sessions_rx.recv() => match session {
                Ok(session) => println!(
                    "Connected to {} ({})",
                    session.dapp_name.as_deref().unwrap_or("unknown dApp"),
                    session.dapp_url.as_deref().unwrap_or("-")
                ),
                Err(RecvError::Lagged(n)) => warn!("Missed {} session announcements", n),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    manager.stop().await;
    Ok(())
}

/// Show current configuration (URLs masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Ask the user to answer `request` on the terminal.
///
/// The prompt blocks on stdin, so it runs on its own detached thread; an
/// unanswered prompt never holds up shutdown.
fn open_prompt(request: PendingRequest) -> Prompt {
    let (tx, answer) = oneshot::channel();
    let title = format!("{} from {}", request.method, request.dapp_name);

    std::thread::spawn(move || {
        let choice = Select::new()
            .with_prompt(title)
            .items(&CHOICES)
            .default(1)
            .interact_opt()
            .map(|choice| choice.and_then(|i| CHOICES.get(i).copied()))
            .map_err(anyhow::Error::from);
        let _ = tx.send(choice);
    });

    Prompt {
        request_id: request.id,
        answer,
    }
}

/// Resolves when the open prompt is answered; pending while none is open
async fn answered(prompt: &mut Option<Prompt>) -> (String, Result<Option<Resolution>>) {
    match prompt {
        Some(prompt) => {
            let answer = match (&mut prompt.answer).await {
                Ok(answer) => answer,
                Err(_) => Err(anyhow::anyhow!("prompt thread exited without an answer")),
            };
            (prompt.request_id.clone(), answer)
        }
        None => std::future::pending().await,
    }
}

/// One-line summary of a pending request
fn describe(request: &PendingRequest, now: chrono::DateTime<Utc>) -> String {
    let chain = request
        .chain_id
        .as_deref()
        .map(|c| format!(" on chain {}", c))
        .unwrap_or_default();
    format!(
        "[{}] {} wants {}{} (expires in {}s)",
        request.id,
        request.dapp_name,
        request.method,
        chain,
        request.time_to_expiry(now).as_secs()
    )
}
