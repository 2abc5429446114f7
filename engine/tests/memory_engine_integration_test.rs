//! Integration tests for the conversation memory engine
//!
//! Exercises the engine end to end against the SQLite gateway and the
//! in-memory gateway:
//! - Day-scoped state reuse and rollover
//! - Compaction, including summarizer failures and timeouts
//! - Degraded operation when the store is unreachable
//! - Modality register
//! - Prompt rendering

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use recall_engine::clock::{Clock, ManualClock};
use recall_engine::compaction::{CompactionOutcome, CompactionPolicy};
use recall_engine::db::{Database, InMemoryGateway};
use recall_engine::day_window::DayWindowResolver;
use recall_engine::memory::{ContextOrigin, ConversationMemoryEngine, EngineSettings};
use recall_engine::memory::prompt::build_prompt;
use sdk::errors::{EngineError, SummarizeError};
use sdk::gateway::PersistenceGateway;
use sdk::summarizer::Summarizer;
use sdk::types::{Channel, ContextWindow, Role, StateId, Turn, SUMMARY_SEPARATOR};

/// Summarizes turns as the list of their leading tags, e.g. `summary[t1,t2,t3]`
struct TagSummarizer {
    calls: AtomicUsize,
}

impl TagSummarizer {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn expected(tags: &[usize]) -> String {
        let tags: Vec<String> = tags.iter().map(|i| format!("t{}", i)).collect();
        format!("summary[{}]", tags.join(","))
    }
}

#[async_trait]
impl Summarizer for TagSummarizer {
    fn name(&self) -> &str {
        "tags"
    }

    async fn summarize(&self, turns: &[Turn]) -> Result<String, SummarizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tags: Vec<&str> = turns
            .iter()
            .map(|t| t.content.split_whitespace().next().unwrap_or(""))
            .collect();
        Ok(format!("summary[{}]", tags.join(",")))
    }
}

struct FailingSummarizer;

#[async_trait]
impl Summarizer for FailingSummarizer {
    fn name(&self) -> &str {
        "failing"
    }

    async fn summarize(&self, _turns: &[Turn]) -> Result<String, SummarizeError> {
        Err(SummarizeError::Failed("model overloaded".to_string()))
    }
}

struct StalledSummarizer;

#[async_trait]
impl Summarizer for StalledSummarizer {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn summarize(&self, _turns: &[Turn]) -> Result<String, SummarizeError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok("too late".to_string())
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

/// A 250-character user turn starting with tag `t<i>`
fn tagged_turn(i: usize, at: DateTime<Utc>) -> Turn {
    let mut content = format!("t{} ", i);
    content.push_str(&"x".repeat(250 - content.len()));
    Turn::new(Role::User, content, at)
}

fn settings() -> EngineSettings {
    EngineSettings {
        policy: CompactionPolicy::new(1000, 2),
        ..EngineSettings::default()
    }
}

struct Harness {
    _dir: Option<TempDir>,
    clock: Arc<ManualClock>,
    engine: ConversationMemoryEngine,
}

async fn sqlite_harness(summarizer: Arc<dyn Summarizer>, settings: EngineSettings) -> Harness {
    let dir = TempDir::new().unwrap();
    let db = Database::new(&dir.path().join("recall.db")).await.unwrap();
    let clock = Arc::new(ManualClock::new(start()));
    let engine = ConversationMemoryEngine::new(
        Arc::new(db.gateway()),
        summarizer,
        Arc::clone(&clock) as Arc<dyn Clock>,
        settings,
    );
    Harness {
        _dir: Some(dir),
        clock,
        engine,
    }
}

fn memory_harness(
    gateway: Arc<InMemoryGateway>,
    summarizer: Arc<dyn Summarizer>,
    settings: EngineSettings,
) -> Harness {
    let clock = Arc::new(ManualClock::new(start()));
    let engine = ConversationMemoryEngine::new(
        gateway as Arc<dyn PersistenceGateway>,
        summarizer,
        Arc::clone(&clock) as Arc<dyn Clock>,
        settings,
    );
    Harness {
        _dir: None,
        clock,
        engine,
    }
}

#[tokio::test]
async fn test_first_turn_creates_state() {
    let h = sqlite_harness(Arc::new(TagSummarizer::new()), settings()).await;
    let turn = Turn::new(Role::User, "Can I book for Friday?", start());

    let report = h
        .engine
        .append_turn_with_report("u1", Channel::Web, turn.clone())
        .await
        .unwrap();

    assert!(!report.state_id.is_ephemeral());
    assert_eq!(report.turn_count, 1);
    assert_eq!(report.window.turns, vec![turn.clone()]);
    assert!(report.persisted);

    let stored = h.engine.load_state(report.state_id).await.unwrap();
    assert_eq!(stored.turn_count, 1);
    assert_eq!(stored.context_window.turns, vec![turn]);
    assert!(stored.is_active);
}

#[tokio::test]
async fn test_second_turn_same_day_reuses_state() {
    let h = sqlite_harness(Arc::new(TagSummarizer::new()), settings()).await;

    let first = h
        .engine
        .append_turn_with_report("u1", Channel::Web, Turn::new(Role::User, "hi", start()))
        .await
        .unwrap();

    h.clock.advance(Duration::hours(3));
    let second = h
        .engine
        .append_turn_with_report(
            "u1",
            Channel::Web,
            Turn::new(Role::Assistant, "hello, how can I help?", h.clock.now()),
        )
        .await
        .unwrap();

    assert_eq!(first.state_id, second.state_id);
    assert_eq!(second.turn_count, 2);
    assert_eq!(second.window.turns.len(), 2);

    let stored = h.engine.load_state(second.state_id).await.unwrap();
    assert_eq!(stored.turn_count, 2);
    assert_eq!(stored.updated_at, h.clock.now());
}

#[tokio::test]
async fn test_next_day_creates_new_state_and_freezes_old() {
    let h = sqlite_harness(Arc::new(TagSummarizer::new()), settings()).await;

    let day_one = h
        .engine
        .append_turn_with_report("u1", Channel::Telegram, Turn::new(Role::User, "monday", start()))
        .await
        .unwrap();
    let frozen = h.engine.load_state(day_one.state_id).await.unwrap();

    h.clock.advance(Duration::days(1));
    let day_two = h
        .engine
        .append_turn_with_report(
            "u1",
            Channel::Telegram,
            Turn::new(Role::User, "tuesday", h.clock.now()),
        )
        .await
        .unwrap();

    assert_ne!(day_one.state_id, day_two.state_id);
    assert_eq!(day_two.turn_count, 1);
    assert_eq!(day_two.window.turns.len(), 1);

    // The previous day's state is untouched and still reachable by id
    let after = h.engine.load_state(day_one.state_id).await.unwrap();
    assert_eq!(after, frozen);

    let states = h
        .engine
        .list_states("u1", Some(Channel::Telegram), 10)
        .await
        .unwrap();
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].id, day_two.state_id);
}

#[tokio::test]
async fn test_day_boundary_follows_reference_timezone() {
    let settings = EngineSettings {
        day_window: DayWindowResolver::from_name("Asia/Jerusalem").unwrap(),
        ..settings()
    };
    let h = sqlite_harness(Arc::new(TagSummarizer::new()), settings).await;

    // 21:00 UTC is 23:00 in Jerusalem; 22:30 UTC is already the next day there
    h.clock.set(Utc.with_ymd_and_hms(2025, 3, 1, 21, 0, 0).unwrap());
    let before = h
        .engine
        .append_turn_with_report("u1", Channel::Web, Turn::new(Role::User, "late", h.clock.now()))
        .await
        .unwrap();

    h.clock.set(Utc.with_ymd_and_hms(2025, 3, 1, 22, 30, 0).unwrap());
    let after = h
        .engine
        .append_turn_with_report("u1", Channel::Web, Turn::new(Role::User, "later", h.clock.now()))
        .await
        .unwrap();

    assert_ne!(before.state_id, after.state_id);
}

#[tokio::test]
async fn test_compaction_keeps_last_two_turns() {
    let summarizer = Arc::new(TagSummarizer::new());
    let h = sqlite_harness(Arc::clone(&summarizer) as Arc<dyn Summarizer>, settings()).await;

    let mut last = None;
    for i in 1..=5 {
        last = Some(
            h.engine
                .append_turn_with_report("u1", Channel::Web, tagged_turn(i, h.clock.now()))
                .await
                .unwrap(),
        );
    }
    let last = last.unwrap();
    let window = last.window.clone();

    assert_eq!(window.turns.len(), 2);
    assert!(window.turns[0].content.starts_with("t4 "));
    assert!(window.turns[1].content.starts_with("t5 "));
    assert_eq!(window.summary(), Some(TagSummarizer::expected(&[1, 2, 3]).as_str()));
    assert_eq!(last.turn_count, 5);
    assert!(last.compaction.is_compacted());
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);

    let stored = h.engine.load_state(last.state_id).await.unwrap();
    assert_eq!(stored.context_window, window);
    assert_eq!(stored.turn_count, 5);
    assert_eq!(stored.last_compacted_at, Some(start()));

    let records = h.engine.summary_records("u1", Channel::Web).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state_id, last.state_id);
    assert_eq!(records[0].turns_covered, 3);
    assert_eq!(records[0].summary_text, TagSummarizer::expected(&[1, 2, 3]));
}

#[tokio::test]
async fn test_failed_summarizer_leaves_window_intact() {
    let h = sqlite_harness(Arc::new(FailingSummarizer), settings()).await;

    let mut last = None;
    for i in 1..=5 {
        last = Some(
            h.engine
                .append_turn_with_report("u1", Channel::Web, tagged_turn(i, h.clock.now()))
                .await
                .unwrap(),
        );
    }
    let last = last.unwrap();

    assert!(matches!(last.compaction, CompactionOutcome::Skipped { .. }));
    assert_eq!(last.window.turns.len(), 5);
    assert_eq!(last.window.summary(), None);
    assert_eq!(last.turn_count, 5);
    assert!(last.persisted);

    let stored = h.engine.load_state(last.state_id).await.unwrap();
    assert_eq!(stored.context_window.turns.len(), 5);
    assert_eq!(stored.last_compacted_at, None);
    assert!(h
        .engine
        .summary_records("u1", Channel::Web)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_summarizer_timeout_leaves_window_intact() {
    let gateway = Arc::new(InMemoryGateway::new());
    let h = memory_harness(gateway, Arc::new(StalledSummarizer), settings());

    let mut last = None;
    for i in 1..=5 {
        last = Some(
            h.engine
                .append_turn_with_report("u1", Channel::Web, tagged_turn(i, h.clock.now()))
                .await
                .unwrap(),
        );
    }
    let last = last.unwrap();

    assert_eq!(
        last.compaction,
        CompactionOutcome::Skipped {
            reason: SummarizeError::Timeout.to_string()
        }
    );
    assert_eq!(last.window.turns.len(), 5);
    assert_eq!(last.window.summary(), None);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_summarizer_holds_only_its_own_key() {
    let gateway = Arc::new(InMemoryGateway::new());
    let h = memory_harness(gateway, Arc::new(StalledSummarizer), settings());

    for i in 1..=4 {
        h.engine
            .append_turn("u1", Channel::Web, tagged_turn(i, h.clock.now()))
            .await
            .unwrap();
    }

    // The fifth turn crosses the threshold and blocks in the summarizer
    let engine = h.engine.clone();
    let turn = tagged_turn(5, h.clock.now());
    let compacting = tokio::spawn(async move {
        engine.append_turn_with_report("u1", Channel::Web, turn).await
    });
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    let started = tokio::time::Instant::now();
    h.engine
        .append_turn("u2", Channel::Web, Turn::new(Role::User, "hello", h.clock.now()))
        .await
        .unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(1));

    let report = h
        .engine
        .append_turn_with_report(
            "u1",
            Channel::Web,
            Turn::new(Role::Assistant, "reply", h.clock.now()),
        )
        .await
        .unwrap();
    assert!(started.elapsed() >= std::time::Duration::from_secs(29));
    assert_eq!(report.turn_count, 6);

    let first = compacting.await.unwrap().unwrap();
    assert_eq!(first.turn_count, 5);
    assert!(matches!(first.compaction, CompactionOutcome::Skipped { .. }));
}

#[tokio::test]
async fn test_two_compactions_append_in_order() {
    let h = sqlite_harness(Arc::new(TagSummarizer::new()), settings()).await;

    let mut window = ContextWindow::empty(start());
    for i in 1..=8 {
        window = h
            .engine
            .append_turn("u1", Channel::Web, tagged_turn(i, h.clock.now()))
            .await
            .unwrap();
    }

    let expected = format!(
        "{}{}{}",
        TagSummarizer::expected(&[1, 2, 3]),
        SUMMARY_SEPARATOR,
        TagSummarizer::expected(&[4, 5, 6])
    );
    assert_eq!(window.summary(), Some(expected.as_str()));
    assert_eq!(window.turns.len(), 2);
    assert!(window.turns[0].content.starts_with("t7 "));

    let records = h.engine.summary_records("u1", Channel::Web).await.unwrap();
    let texts: Vec<&str> = records.iter().map(|r| r.summary_text.as_str()).collect();
    assert_eq!(
        texts,
        vec![
            TagSummarizer::expected(&[1, 2, 3]).as_str(),
            TagSummarizer::expected(&[4, 5, 6]).as_str()
        ]
    );
}

#[tokio::test]
async fn test_unreachable_store_degrades_to_ephemeral() {
    let gateway = Arc::new(InMemoryGateway::new());
    gateway.set_available(false);
    let h = memory_harness(Arc::clone(&gateway), Arc::new(TagSummarizer::new()), settings());

    let context = h.engine.get_or_create_context("u1", Channel::Web).await.unwrap();
    assert_eq!(context.state_id, StateId::EPHEMERAL);
    assert_eq!(context.origin, ContextOrigin::Ephemeral);
    assert!(context.window.is_empty());

    let turn = Turn::new(Role::User, "are you there?", start());
    let report = h
        .engine
        .append_turn_with_report("u1", Channel::Web, turn.clone())
        .await
        .unwrap();

    assert_eq!(report.state_id, StateId::EPHEMERAL);
    assert_eq!(report.window.turns, vec![turn]);
    assert!(!report.persisted);

    // Nothing was written behind the outage
    gateway.set_available(true);
    assert!(h.engine.list_states("u1", None, 10).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_store_times_out_to_ephemeral() {
    let gateway = Arc::new(InMemoryGateway::new());
    gateway.set_latency(std::time::Duration::from_secs(60));
    let h = memory_harness(gateway, Arc::new(TagSummarizer::new()), settings());

    let window = h
        .engine
        .append_turn("u1", Channel::Voice, Turn::new(Role::User, "hello?", start()))
        .await
        .unwrap();
    assert_eq!(window.turns.len(), 1);

    let context = h.engine.get_or_create_context("u1", Channel::Voice).await.unwrap();
    assert!(context.is_ephemeral());
}

#[tokio::test]
async fn test_write_back_failure_still_returns_window() {
    let gateway = Arc::new(InMemoryGateway::new());
    let h = memory_harness(Arc::clone(&gateway), Arc::new(TagSummarizer::new()), settings());

    let first = h
        .engine
        .append_turn_with_report("u1", Channel::Web, Turn::new(Role::User, "one", start()))
        .await
        .unwrap();
    assert!(first.persisted);

    gateway.set_writes_failing(true);
    let second = h
        .engine
        .append_turn_with_report("u1", Channel::Web, Turn::new(Role::User, "two", start()))
        .await
        .unwrap();

    assert_eq!(second.state_id, first.state_id);
    assert_eq!(second.window.turns.len(), 2);
    assert!(!second.persisted);

    gateway.set_writes_failing(false);
    let stored = h.engine.load_state(first.state_id).await.unwrap();
    assert_eq!(stored.turn_count, 1);
    assert_eq!(stored.context_window.turns.len(), 1);
}

#[tokio::test]
async fn test_outage_mid_conversation_falls_back_to_ephemeral() {
    let gateway = Arc::new(InMemoryGateway::new());
    let h = memory_harness(Arc::clone(&gateway), Arc::new(TagSummarizer::new()), settings());

    h.engine
        .append_turn("u1", Channel::Web, Turn::new(Role::User, "one", start()))
        .await
        .unwrap();

    gateway.set_available(false);
    let window = h
        .engine
        .append_turn("u1", Channel::Web, Turn::new(Role::User, "two", start()))
        .await
        .unwrap();
    assert_eq!(window.turns.len(), 1, "outage yields a fresh ephemeral window");
    assert_eq!(window.turns[0].content, "two");
}

#[tokio::test]
async fn test_dropped_caller_does_not_lose_turn() {
    let gateway = Arc::new(InMemoryGateway::new());
    gateway.set_latency(std::time::Duration::from_millis(40));
    let h = memory_harness(Arc::clone(&gateway), Arc::new(TagSummarizer::new()), settings());

    let engine = h.engine.clone();
    let call = engine.append_turn("u1", Channel::Web, Turn::new(Role::User, "hang up", start()));
    let gave_up = tokio::time::timeout(std::time::Duration::from_millis(5), call).await;
    assert!(gave_up.is_err());

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    gateway.set_latency(std::time::Duration::ZERO);
    let states = h.engine.list_states("u1", None, 10).await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].turn_count, 1);
}

#[tokio::test]
async fn test_close_active_context_starts_fresh_state() {
    let h = sqlite_harness(Arc::new(TagSummarizer::new()), settings()).await;

    let first = h
        .engine
        .append_turn_with_report("u1", Channel::Slack, Turn::new(Role::User, "done", start()))
        .await
        .unwrap();

    assert!(h.engine.close_active_context("u1", Channel::Slack).await.unwrap());
    assert!(!h.engine.close_active_context("u1", Channel::Slack).await.unwrap());

    let second = h
        .engine
        .append_turn_with_report("u1", Channel::Slack, Turn::new(Role::User, "new topic", start()))
        .await
        .unwrap();

    assert_ne!(first.state_id, second.state_id);
    assert_eq!(second.turn_count, 1);

    let closed = h.engine.load_state(first.state_id).await.unwrap();
    assert!(!closed.is_active);
    assert_eq!(closed.turn_count, 1);
}

#[tokio::test]
async fn test_invalid_input_rejected_without_writes() {
    let h = sqlite_harness(Arc::new(TagSummarizer::new()), settings()).await;

    let blank_content = h
        .engine
        .append_turn("u1", Channel::Web, Turn::new(Role::User, "   ", start()))
        .await;
    assert!(matches!(blank_content, Err(EngineError::InvalidInput(_))));

    let blank_subject = h
        .engine
        .append_turn(" ", Channel::Web, Turn::new(Role::User, "hi", start()))
        .await;
    assert!(matches!(blank_subject, Err(EngineError::InvalidInput(_))));

    assert!(matches!(
        h.engine.set_modality("", Channel::Web).await,
        Err(EngineError::InvalidInput(_))
    ));

    assert!(h.engine.list_states("u1", None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_channels_are_isolated() {
    let h = sqlite_harness(Arc::new(TagSummarizer::new()), settings()).await;

    let web = h
        .engine
        .append_turn_with_report("u1", Channel::Web, Turn::new(Role::User, "web", start()))
        .await
        .unwrap();
    let voice = h
        .engine
        .append_turn_with_report("u1", Channel::Voice, Turn::new(Role::User, "voice", start()))
        .await
        .unwrap();

    assert_ne!(web.state_id, voice.state_id);
    assert_eq!(voice.turn_count, 1);
    assert_eq!(h.engine.list_states("u1", None, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_new_state_bootstraps_subject_link() {
    let gateway = Arc::new(InMemoryGateway::new());
    let h = memory_harness(Arc::clone(&gateway), Arc::new(TagSummarizer::new()), settings());

    h.engine.get_or_create_context("u1", Channel::WhatsApp).await.unwrap();
    h.engine.get_or_create_context("u1", Channel::WhatsApp).await.unwrap();
    h.engine.get_or_create_context("u1", Channel::Web).await.unwrap();

    assert_eq!(gateway.link_count().await, 2);
}

#[tokio::test]
async fn test_modality_last_write_wins() {
    let h = sqlite_harness(Arc::new(TagSummarizer::new()), settings()).await;

    assert!(h.engine.set_modality("u1", Channel::Voice).await.unwrap());
    h.clock.advance(Duration::minutes(1));
    let touched_at = h.clock.now();
    assert!(h.engine.touch("u1").await.unwrap());

    let entry = h.engine.get_modality("u1").await.unwrap().unwrap();
    assert_eq!(entry.channel, Channel::Voice);
    assert!(entry.last_active_at >= touched_at);

    h.engine.set_modality("u1", Channel::Web).await.unwrap();
    let entry = h.engine.get_modality("u1").await.unwrap().unwrap();
    assert_eq!(entry.channel, Channel::Web);

    h.clock.advance(Duration::hours(3));
    assert!(h.engine.get_live_modality("u1").await.unwrap().is_none());
    assert!(h.engine.get_modality("u1").await.unwrap().is_some());

    assert!(!h.engine.touch("nobody").await.unwrap());
    assert!(h.engine.get_modality("nobody").await.unwrap().is_none());
}

#[tokio::test]
async fn test_prompt_from_compacted_window() {
    let h = sqlite_harness(Arc::new(TagSummarizer::new()), settings()).await;

    assert_eq!(h.engine.build_prompt(&ContextWindow::empty(start())), "");

    let mut window = ContextWindow::empty(start());
    for i in 1..=5 {
        window = h
            .engine
            .append_turn("u1", Channel::Web, tagged_turn(i, start()))
            .await
            .unwrap();
    }

    let prompt = h.engine.build_prompt(&window);
    assert_eq!(prompt, build_prompt(&window));
    assert_eq!(prompt, h.engine.build_prompt(&window));

    let expected_head = format!(
        "Previous conversation summary:\n{}\n\nRecent messages:\nuser: t4 ",
        TagSummarizer::expected(&[1, 2, 3])
    );
    assert!(prompt.starts_with(&expected_head));
    assert_eq!(prompt.lines().count(), 6);
}
