//! Line Transport Integration Tests
//!
//! Turns from different users run concurrently, EOF answers everything read,
//! and an interrupt lets running turns finish.

mod common;

use common::{test_config, ScriptedUpstream};
use relaybot::{transport, Orchestrator};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

fn orchestrator(upstream: &Arc<ScriptedUpstream>) -> Arc<Orchestrator<Arc<ScriptedUpstream>>> {
    Arc::new(Orchestrator::new(test_config(), Arc::clone(upstream)))
}

async fn collect(mut outbox: mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    let mut replies = Vec::new();
    while let Some(line) = outbox.recv().await {
        replies.push(serde_json::from_str(&line).unwrap());
    }
    replies
}

#[tokio::test(start_paused = true)]
async fn test_turns_from_different_users_overlap() {
    let upstream = Arc::new(ScriptedUpstream::with_delay(Duration::from_secs(1)));
    let bot = orchestrator(&upstream);
    let input: &[u8] = b"{\"user\": \"alice\", \"text\": \"hello there\"}\n\
                         {\"user\": \"bob\", \"text\": \"how are you\"}\n";
    let (replies, outbox) = mpsc::unbounded_channel();

    let started = Instant::now();
    transport::serve(Arc::clone(&bot), input, replies, std::future::pending())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    let replies = collect(outbox).await;
    assert_eq!(replies.len(), 2);
    assert_eq!(upstream.total_calls(), 2);
    assert!(elapsed < Duration::from_secs(2), "turns ran one after another: {elapsed:?}");
    assert!(replies.iter().all(|r| r["degraded"] == false));
    assert!(!bot.is_accepting());
}

#[tokio::test]
async fn test_commands_and_plain_text() {
    let upstream = Arc::new(ScriptedUpstream::new());
    let bot = orchestrator(&upstream);
    let input: &[u8] = b"hello there\n\n/reenable nowhere\n";
    let (replies, outbox) = mpsc::unbounded_channel();

    transport::serve(bot, input, replies, std::future::pending())
        .await
        .unwrap();

    let replies = collect(outbox).await;
    assert_eq!(replies.len(), 2);

    let answer = replies.iter().find(|r| r["user"] == "local").unwrap();
    assert_eq!(answer["text"], "generalist answer to: hello there");
    assert_eq!(answer["service"], "generalist");

    let error = replies.iter().find(|r| r.get("error").is_some()).unwrap();
    assert_eq!(error["error"], "unknown service 'nowhere'");
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_lets_running_turn_finish() {
    let upstream = Arc::new(ScriptedUpstream::with_delay(Duration::from_secs(1)));
    let bot = orchestrator(&upstream);
    let (mut client, server) = tokio::io::duplex(1024);
    let (replies, outbox) = mpsc::unbounded_channel();
    let (interrupt, interrupted) = oneshot::channel::<()>();

    let serving = tokio::spawn(transport::serve(
        Arc::clone(&bot),
        BufReader::new(server),
        replies,
        async move {
            let _ = interrupted.await;
        },
    ));

    client
        .write_all(b"{\"user\": \"alice\", \"text\": \"hello there\"}\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(upstream.total_calls(), 1);

    interrupt.send(()).unwrap();
    serving.await.unwrap().unwrap();

    let replies = collect(outbox).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["text"], "generalist answer to: hello there");
    assert!(!bot.is_accepting());
    drop(client);
}
