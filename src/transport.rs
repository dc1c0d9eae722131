//! Line Transport
//!
//! Each input line is either plain text (user `local`) or a JSON object
//! `{"user": "...", "text": "..."}`. Every parsed line becomes its own task,
//! so a slow upstream for one user never holds up another. Replies go out
//! through a channel as one JSON object per line, in completion order.

use crate::conversation::UserId;
use crate::orchestrator::Orchestrator;
use crate::upstream::{ServiceId, Upstream};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct InboundTurn {
    #[serde(default = "default_user")]
    user: String,
    text: String,
}

fn default_user() -> String {
    "local".to_string()
}

#[derive(Debug, Serialize)]
struct OutboundReply<'a> {
    user: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "no_citations")]
    citations: &'a [String],
    service: Option<ServiceId>,
    degraded: bool,
}

fn no_citations(citations: &&[String]) -> bool {
    citations.is_empty()
}

fn parse_line(line: &str) -> InboundTurn {
    if line.starts_with('{') {
        if let Ok(turn) = serde_json::from_str::<InboundTurn>(line) {
            return turn;
        }
        debug!("Input looked like JSON but did not parse, treating as text");
    }
    InboundTurn {
        user: default_user(),
        text: line.to_string(),
    }
}

/// Handle one parsed line: a command or a conversational turn
async fn respond<U: Upstream + 'static>(
    orchestrator: &Orchestrator<U>,
    turn: InboundTurn,
) -> serde_json::Result<String> {
    let user = UserId::new(turn.user.clone());

    match turn.text.trim() {
        "/metrics" => serde_json::to_string(&orchestrator.metrics().snapshot()),
        "/clear" => {
            let removed = orchestrator.store().clear(&user).await;
            Ok(serde_json::json!({ "user": turn.user, "cleared": removed }).to_string())
        }
        command if command.starts_with("/reenable") => {
            let name = command.trim_start_matches("/reenable").trim();
            match ServiceId::ALL.into_iter().find(|s| s.as_str() == name) {
                Some(service) => {
                    orchestrator.reenable(service);
                    Ok(serde_json::json!({ "reenabled": service }).to_string())
                }
                None => {
                    warn!(name, "Unknown service");
                    Ok(serde_json::json!({ "error": format!("unknown service '{name}'") })
                        .to_string())
                }
            }
        }
        _ => match orchestrator.handle_turn(&user, &turn.text).await {
            Ok(reply) => serde_json::to_string(&OutboundReply {
                user: &turn.user,
                text: &reply.text,
                citations: &reply.citations,
                service: reply.service_used,
                degraded: reply.degraded,
            }),
            Err(e) => serde_json::to_string(&OutboundReply {
                user: &turn.user,
                text: e.user_message(),
                citations: &[],
                service: None,
                degraded: false,
            }),
        },
    }
}

/// Read lines until EOF or `stop` resolves, one task per turn.
///
/// At EOF every line already read is answered before the orchestrator shuts
/// down. When `stop` resolves the orchestrator shuts down first, so turns
/// that have not started are refused while running ones finish. Either way
/// all replies have been sent before this returns.
pub async fn serve<U, R, S>(
    orchestrator: Arc<Orchestrator<U>>,
    input: R,
    replies: mpsc::UnboundedSender<String>,
    stop: S,
) -> std::io::Result<()>
where
    U: Upstream + 'static,
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    let mut lines = input.lines();
    let mut turns = JoinSet::new();
    tokio::pin!(stop);

    info!("Ready, waiting for messages");

    let (interrupted, outcome) = loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Input closed (EOF)");
                        break (false, Ok(()));
                    }
                    Err(e) => break (false, Err(e)),
                };

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let turn = parse_line(trimmed);
                let orchestrator = Arc::clone(&orchestrator);
                let replies = replies.clone();
                turns.spawn(async move {
                    match respond(&orchestrator, turn).await {
                        Ok(output) => {
                            if replies.send(output).is_err() {
                                warn!("Reply writer gone, dropping reply");
                            }
                        }
                        Err(e) => error!(error = %e, "Failed to encode reply"),
                    }
                });
            }
            Some(joined) = turns.join_next(), if !turns.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Turn task failed");
                }
            }
            _ = &mut stop => {
                info!("Interrupted");
                break (true, Ok(()));
            }
        }
    };

    if interrupted {
        orchestrator.shutdown().await;
        drain(&mut turns).await;
    } else {
        drain(&mut turns).await;
        orchestrator.shutdown().await;
    }
    outcome
}

async fn drain(turns: &mut JoinSet<()>) {
    while let Some(joined) = turns.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Turn task failed");
        }
    }
}
