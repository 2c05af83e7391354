//! Consumer loop behaviour against the scripted [`MockConsumer`].
//!
//! Every script ends with the mock's "no more messages" read failure, so a
//! run that processes its whole script returns `ConsumerError::Read`.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use futures::FutureExt;
use relaykit_core::{
    ClientError, ClientRole, Config, ConfigError, Context, FailurePolicy, Message,
    TopicPartitionOffset,
};
use relaykit_runtime::{Consumer, ConsumerError, ConsumerState};
use relaykit_testing::{MockConsumer, MockProducer, ReadStep, init_test_tracing};
use std::sync::{Arc, Mutex};

type Seen = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

fn msg(topic: &str, value: &str, offset: i64) -> Message {
    Message::new(topic, value).with_partition(0).with_offset(offset)
}

/// Config wired to `mock`, with a recording handler for each topic.
fn recording_config(mock: &MockConsumer, topics: &[&str]) -> (Config, Seen) {
    let seen: Seen = Arc::default();
    let mut cfg = Config::new()
        .with_bootstrap_servers("localhost:9092")
        .with_group_id("test-group")
        .with_consumer_client(Arc::new(mock.clone()));

    for topic in topics {
        let seen = Arc::clone(&seen);
        let name = (*topic).to_string();
        cfg = cfg.with_topic_handler(*topic, move |_ctx, payload| {
            let seen = Arc::clone(&seen);
            let name = name.clone();
            async move {
                seen.lock().unwrap().push((name, payload));
                Ok(())
            }
        });
    }

    (cfg, seen)
}

fn tpo(topic: &str, offset: i64) -> TopicPartitionOffset {
    TopicPartitionOffset {
        topic: topic.to_string(),
        partition: 0,
        offset,
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_close_runs_exactly_once_after_read_failure() {
    init_test_tracing();
    let mock = MockConsumer::new().with_messages([msg("topicA", "one", 0)]);
    let (cfg, _seen) = recording_config(&mock, &["topicA"]);

    let consumer = Consumer::new(&cfg).unwrap();
    let result = consumer.run().await;

    assert!(matches!(result, Err(ConsumerError::Read(ClientError::Read(_)))));
    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert_eq!(mock.close_count(), 1);

    consumer.close();
    assert_eq!(mock.close_count(), 1);
}

#[tokio::test]
async fn test_run_twice_is_rejected() {
    let mock = MockConsumer::new();
    let (cfg, _seen) = recording_config(&mock, &["topicA"]);
    let consumer = Consumer::new(&cfg).unwrap();

    let _ = consumer.run().await;
    let second = consumer.run().await;

    assert!(matches!(second, Err(ConsumerError::AlreadyRun(ConsumerState::Closed))));
    assert_eq!(mock.subscriptions().len(), 1);
    assert_eq!(mock.close_count(), 1);
}

#[tokio::test]
async fn test_dropping_run_future_closes_consumer() {
    let mock = MockConsumer::new().with_messages([msg("slow", "x", 0)]);
    let cfg = Config::new()
        .with_consumer_client(Arc::new(mock.clone()))
        .with_topic_handler("slow", |_ctx, _payload| {
            std::future::pending::<anyhow::Result<()>>()
        });
    let consumer = Consumer::new(&cfg).unwrap();

    // One poll gets as far as the handler, which never completes
    assert!(consumer.run().now_or_never().is_none());

    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert_eq!(mock.close_count(), 1);
}

#[tokio::test]
async fn test_subscribe_failure_closes_and_reports() {
    let mock = MockConsumer::new().failing_subscribe(ClientError::Subscription {
        topics: vec!["topicA".to_string()],
        reason: "unknown topic".to_string(),
    });
    let (cfg, seen) = recording_config(&mock, &["topicA"]);
    let consumer = Consumer::new(&cfg).unwrap();

    let result = consumer.run().await;

    assert!(matches!(result, Err(ConsumerError::Subscribe(ClientError::Subscription { .. }))));
    assert_eq!(mock.read_count(), 0);
    assert_eq!(mock.close_count(), 1);
    assert!(seen.lock().unwrap().is_empty());
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn test_producer_override_is_rejected() {
    let cfg = Config::new().with_producer_client(Arc::new(MockProducer::new()));

    let err = Consumer::new(&cfg).unwrap_err();

    assert!(matches!(
        err,
        ConsumerError::Configuration(ConfigError::WrongClientRole {
            expected: ClientRole::Consumer,
            found: ClientRole::Producer,
        })
    ));
}

#[test]
fn test_invalid_bootstrap_servers_fail_construction() {
    let mock = MockConsumer::new();
    let cfg = Config::new()
        .with_consumer_client(Arc::new(mock.clone()))
        .with("bootstrap.servers", 9092_i64);

    let err = Consumer::new(&cfg).unwrap_err();

    assert!(matches!(
        err,
        ConsumerError::Configuration(ConfigError::InvalidBootstrapServers { found: "integer" })
    ));
    assert!(mock.created().is_empty());
}

#[test]
fn test_settings_reach_the_client() {
    let mock = MockConsumer::new();
    let (cfg, _seen) = recording_config(&mock, &["topicA"]);

    let _consumer = Consumer::new(&cfg).unwrap();

    let created = mock.created();
    assert_eq!(created.len(), 1);
    assert_eq!(
        created[0].get("group.id").map(ToString::to_string),
        Some("test-group".to_string())
    );
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_subscribes_to_every_handler_topic() {
    let mock = MockConsumer::new();
    let (cfg, _seen) = recording_config(&mock, &["topicB", "topicA"]);

    let _ = Consumer::new(&cfg).unwrap().run().await;

    assert_eq!(
        mock.subscriptions(),
        vec![vec!["topicA".to_string(), "topicB".to_string()]]
    );
}

#[tokio::test]
async fn test_messages_reach_their_topic_handler_in_order() {
    let mock = MockConsumer::new().with_messages([
        msg("topicA", "a1", 0),
        msg("topicB", "b1", 0),
        msg("topicA", "a2", 1),
    ]);
    let (cfg, seen) = recording_config(&mock, &["topicA", "topicB"]);

    let _ = Consumer::new(&cfg).unwrap().run().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("topicA".to_string(), b"a1".to_vec()),
            ("topicB".to_string(), b"b1".to_vec()),
            ("topicA".to_string(), b"a2".to_vec()),
        ]
    );
}

#[tokio::test]
async fn test_middleware_runs_before_handler() {
    let mock = MockConsumer::new().with_messages([msg("topicA", "test message", 0)]);
    let observed = Arc::new(Mutex::new(Vec::new()));
    let (cfg, seen) = recording_config(&mock, &["topicA"]);
    let cfg = {
        let observed = Arc::clone(&observed);
        cfg.with_middleware(move |payload| {
            observed.lock().unwrap().push(payload.clone());
            Ok(payload.to_ascii_uppercase())
        })
    };

    let _ = Consumer::new(&cfg).unwrap().run().await;

    assert_eq!(*observed.lock().unwrap(), vec![b"test message".to_vec()]);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("topicA".to_string(), b"TEST MESSAGE".to_vec())]
    );
}

#[tokio::test]
async fn test_message_without_handler_is_dropped() {
    let mock = MockConsumer::new().with_messages([msg("unknown", "lost", 0), msg("topicA", "kept", 1)]);
    let (cfg, seen) = recording_config(&mock, &["topicA"]);
    let cfg = cfg.with_auto_commit(false);

    let _ = Consumer::new(&cfg).unwrap().run().await;

    assert_eq!(*seen.lock().unwrap(), vec![("topicA".to_string(), b"kept".to_vec())]);
    assert_eq!(mock.commits(), vec![tpo("topicA", 1)]);
}

#[tokio::test]
async fn test_idle_reads_are_skipped() {
    let mock = MockConsumer::new().with_steps([
        ReadStep::Idle,
        ReadStep::Message(msg("topicA", "one", 0)),
        ReadStep::Idle,
    ]);
    let (cfg, seen) = recording_config(&mock, &["topicA"]);

    let _ = Consumer::new(&cfg).unwrap().run().await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(mock.read_count(), 4);
}

#[tokio::test]
async fn test_configured_context_reaches_handler() {
    let ctx = Context::new();
    ctx.cancel();
    let cancelled = Arc::new(Mutex::new(None));
    let mock = MockConsumer::new().with_messages([msg("topicA", "x", 0)]);
    let cfg = {
        let cancelled = Arc::clone(&cancelled);
        Config::new()
            .with_consumer_client(Arc::new(mock.clone()))
            .with_context(ctx)
            .with_topic_handler("topicA", move |ctx, _payload| {
                let cancelled = Arc::clone(&cancelled);
                async move {
                    *cancelled.lock().unwrap() = Some(ctx.is_cancelled());
                    Ok(())
                }
            })
    };

    let _ = Consumer::new(&cfg).unwrap().run().await;

    assert_eq!(*cancelled.lock().unwrap(), Some(true));
}

// ============================================================================
// Commits
// ============================================================================

#[tokio::test]
async fn test_commits_after_success_when_auto_commit_disabled() {
    let mock = MockConsumer::new().with_messages([msg("topicA", "a", 4), msg("topicA", "b", 5)]);
    let (cfg, _seen) = recording_config(&mock, &["topicA"]);
    let cfg = cfg.with_auto_commit(false);

    let _ = Consumer::new(&cfg).unwrap().run().await;

    assert_eq!(mock.commits(), vec![tpo("topicA", 4), tpo("topicA", 5)]);
}

#[tokio::test]
async fn test_no_explicit_commit_with_auto_commit() {
    let mock = MockConsumer::new().with_messages([msg("topicA", "a", 4)]);
    let (cfg, seen) = recording_config(&mock, &["topicA"]);

    let _ = Consumer::new(&cfg).unwrap().run().await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(mock.commits().is_empty());
}

#[tokio::test]
async fn test_commit_failure_does_not_stop_the_loop() {
    let mock = MockConsumer::new()
        .with_messages([msg("topicA", "a", 0), msg("topicA", "b", 1)])
        .failing_commit(ClientError::Commit("coordinator unavailable".to_string()));
    let (cfg, seen) = recording_config(&mock, &["topicA"]);
    let cfg = cfg.with_auto_commit(false);

    let result = Consumer::new(&cfg).unwrap().run().await;

    assert!(matches!(result, Err(ConsumerError::Read(_))));
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(mock.read_count(), 3);
}

// ============================================================================
// Failures
// ============================================================================

fn failing_on(cfg: Config, bad: &'static [u8]) -> Config {
    cfg.with_topic_handler("topicA", move |_ctx, payload| async move {
        if payload == bad {
            anyhow::bail!("cannot process {}", String::from_utf8_lossy(&payload));
        }
        Ok(())
    })
}

#[tokio::test]
async fn test_handler_failure_skips_message_without_commit() {
    let mock = MockConsumer::new().with_messages([msg("topicA", "bad", 0), msg("topicA", "good", 1)]);
    let cfg = failing_on(
        Config::new()
            .with_consumer_client(Arc::new(mock.clone()))
            .with_auto_commit(false),
        b"bad",
    );

    let result = Consumer::new(&cfg).unwrap().run().await;

    assert!(matches!(result, Err(ConsumerError::Read(_))));
    assert_eq!(mock.commits(), vec![tpo("topicA", 1)]);
}

#[tokio::test]
async fn test_stop_consuming_returns_handler_error() {
    let mock = MockConsumer::new().with_messages([msg("topicA", "bad", 0), msg("topicA", "good", 1)]);
    let cfg = failing_on(
        Config::new()
            .with_consumer_client(Arc::new(mock.clone()))
            .with_auto_commit(false)
            .with_failure_policy(FailurePolicy::StopConsuming),
        b"bad",
    );

    let result = Consumer::new(&cfg).unwrap().run().await;

    match result {
        Err(ConsumerError::Handler { topic, source }) => {
            assert_eq!(topic, "topicA");
            assert_eq!(source.to_string(), "cannot process bad");
        },
        other => unreachable!("expected handler error, got {other:?}"),
    }
    assert_eq!(mock.read_count(), 1);
    assert!(mock.commits().is_empty());
    assert_eq!(mock.close_count(), 1);
}

#[tokio::test]
async fn test_middleware_failure_skips_message() {
    let mock = MockConsumer::new().with_messages([msg("topicA", "", 0), msg("topicA", "ok", 1)]);
    let (cfg, seen) = recording_config(&mock, &["topicA"]);
    let cfg = cfg.with_middleware(|payload| {
        anyhow::ensure!(!payload.is_empty(), "empty payload");
        Ok(payload)
    });

    let _ = Consumer::new(&cfg).unwrap().run().await;

    assert_eq!(*seen.lock().unwrap(), vec![("topicA".to_string(), b"ok".to_vec())]);
}

#[tokio::test]
async fn test_middleware_failure_can_stop_the_loop() {
    let mock = MockConsumer::new().with_messages([msg("topicA", "", 0)]);
    let (cfg, seen) = recording_config(&mock, &["topicA"]);
    let cfg = cfg
        .with_failure_policy(FailurePolicy::StopConsuming)
        .with_middleware(|_payload| Err(anyhow::anyhow!("rejected")));

    let result = Consumer::new(&cfg).unwrap().run().await;

    assert!(matches!(result, Err(ConsumerError::Middleware { ref topic, .. }) if topic == "topicA"));
    assert!(seen.lock().unwrap().is_empty());
}
