//! Integration tests for the watcher.

use std::sync::Arc;
use std::time::Duration;
use winlog_watcher::{
    Bookmark, Event, MemoryProvider, MemoryRecord, RenderOptions, SubscribeOptions, StartMode,
    SubscriptionState, TextKind, Watcher, WatcherConfig,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn setup(channels: &[&str]) -> (Arc<MemoryProvider>, Watcher<MemoryProvider>) {
    init_tracing();
    let provider = Arc::new(MemoryProvider::new());
    for channel in channels {
        provider.create_channel(channel);
    }
    let watcher = Watcher::new(Arc::clone(&provider)).unwrap();
    (provider, watcher)
}

fn next_event(watcher: &Watcher<MemoryProvider>) -> Event {
    watcher.events().recv_timeout(TIMEOUT).unwrap()
}

fn service_record() -> MemoryRecord {
    MemoryRecord::new("Service Control Manager", 7036)
        .level(4)
        .message("The Windows Update service entered the running state.")
}

// --- Realistic Workflow Tests ---

#[test]
fn test_record_from_now_scenario() {
    let (provider, watcher) = setup(&["App"]);
    // Records 1..=41 exist before subscribing.
    for _ in 0..41 {
        provider.append("App", MemoryRecord::new("Old", 1));
    }
    watcher.subscribe_from_now("App", "*").unwrap();

    let record_id = provider.append("App", service_record());
    assert_eq!(record_id, 42);

    let event = next_event(&watcher);
    assert_eq!(event.record_id, Some(42));
    assert_eq!(event.level, Some(4));
    assert!(!event.bookmark.is_empty());
    assert!(Bookmark::create_from_serialized(Arc::clone(&provider), &event.bookmark).is_ok());
    assert!(watcher.errors().try_recv().is_err());
}

#[test]
fn test_events_are_ordered_with_distinct_bookmarks() {
    let (provider, watcher) = setup(&["Application"]);
    watcher.subscribe_from_now("Application", "*").unwrap();

    for _ in 0..3 {
        provider.append("Application", service_record());
    }
    let events: Vec<_> = (0..3).map(|_| next_event(&watcher)).collect();

    let ids: Vec<_> = events.iter().map(|e| e.record_id.unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_ne!(events[1].bookmark, events[0].bookmark);
    assert_ne!(events[1].bookmark, events[2].bookmark);
}

#[test]
fn test_resume_after_bookmark() {
    let (provider, watcher) = setup(&["Application"]);
    watcher.subscribe_from_beginning("Application", "*").unwrap();
    for _ in 0..5 {
        provider.append("Application", service_record());
    }
    let delivered: Vec<_> = (0..3).map(|_| next_event(&watcher)).collect();
    let saved = delivered[2].bookmark.clone();
    drop(watcher);

    // A collector restarting from the saved position.
    let watcher = Watcher::new(Arc::clone(&provider)).unwrap();
    watcher
        .subscribe_from_bookmark("Application", "*", &saved)
        .unwrap();

    assert_eq!(next_event(&watcher).record_id, Some(4));
    assert_eq!(next_event(&watcher).record_id, Some(5));
}

#[test]
fn test_resume_after_purged_record() {
    let (provider, watcher) = setup(&["Application"]);
    watcher.subscribe_from_beginning("Application", "*").unwrap();
    provider.append("Application", service_record());
    let saved = next_event(&watcher).bookmark;
    watcher.unsubscribe("Application").unwrap();

    for _ in 0..4 {
        provider.append("Application", service_record());
    }
    provider.purge("Application", 3);

    watcher
        .subscribe_from_bookmark("Application", "*", &saved)
        .unwrap();
    assert_eq!(next_event(&watcher).record_id, Some(4));
}

#[test]
fn test_unsubscribe_returns_last_delivered_bookmark() {
    let (provider, watcher) = setup(&["Application"]);
    watcher.subscribe_from_now("Application", "*").unwrap();
    provider.append("Application", service_record());
    provider.append("Application", service_record());
    next_event(&watcher);
    let last = next_event(&watcher);

    let teardown = watcher.unsubscribe("Application").unwrap();

    assert!(teardown.is_clean());
    assert_eq!(teardown.bookmark, last.bookmark);
    assert_eq!(watcher.state("Application"), None);
    assert!(watcher.channels().is_empty());
}

#[test]
fn test_multiple_channels_share_streams() {
    let (provider, watcher) = setup(&["Application", "System", "Security"]);
    for channel in ["Application", "System", "Security"] {
        watcher.subscribe_from_now(channel, "*").unwrap();
    }
    assert_eq!(
        watcher.channels(),
        vec!["Application", "Security", "System"]
    );

    provider.append("System", service_record());
    provider.append("Application", service_record());
    provider.append("Security", service_record());

    let mut channels: Vec<_> = (0..3).map(|_| next_event(&watcher).subscribed_channel).collect();
    channels.sort();
    assert_eq!(channels, vec!["Application", "Security", "System"]);

    let report = watcher.shutdown();
    assert!(report.is_clean());
    assert_eq!(report.channels.len(), 3);
    assert!(report.bookmark("System").unwrap().contains("Channel='System'"));
}

#[test]
fn test_event_fields() {
    let (provider, watcher) = setup(&["Application"]);
    watcher.subscribe_from_now("Application", "*").unwrap();
    provider.append(
        "Application",
        MemoryRecord::new("Microsoft-Windows-Kernel-General", 12)
            .level(2)
            .task(1)
            .opcode(1)
            .qualifiers(16384)
            .process(4, 8)
            .computer("host-01")
            .user("S-1-5-18")
            .activity("{b5c1b9a2-3e4f-4e8e-9c1d-2f3a4b5c6d7e}")
            .version(1)
            .message("The operating system started."),
    );

    let event = next_event(&watcher);
    assert_eq!(event.event_id, Some(12));
    assert_eq!(event.qualifiers, Some(16384));
    assert_eq!(event.level_text.as_deref(), Some("Error"));
    assert_eq!(event.task_text.as_deref(), Some("Task 1"));
    assert_eq!(event.opcode_text.as_deref(), Some("Start"));
    assert_eq!(event.process_id, Some(4));
    assert_eq!(event.thread_id, Some(8));
    assert_eq!(event.computer_name.as_deref(), Some("host-01"));
    assert_eq!(event.user_id.as_deref(), Some("S-1-5-18"));
    assert_eq!(
        event.activity_id.as_deref(),
        Some("{b5c1b9a2-3e4f-4e8e-9c1d-2f3a4b5c6d7e}")
    );
    assert_eq!(event.related_activity_id, None);
    assert_eq!(event.version, Some(1));
    assert_eq!(event.channel.as_deref(), Some("Application"));
    assert_eq!(event.text(TextKind::Provider), Some("Microsoft-Windows-Kernel-General"));
    assert!(event.xml.as_deref().unwrap().contains("<Level>2</Level>"));
}

#[test]
fn test_created_time_survives_conversion() {
    let (provider, watcher) = setup(&["Application"]);
    let created = chrono::DateTime::parse_from_rfc3339("2016-03-01T17:18:42.1234567Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    watcher.subscribe_from_now("Application", "*").unwrap();
    provider.append("Application", service_record().created(created));

    let event = next_event(&watcher);
    assert_eq!(event.created, Some(created));
}

#[test]
fn test_disabled_task_text() {
    let (provider, watcher) = setup(&["Application"]);
    watcher.set_render_task(false);
    watcher.subscribe_from_now("Application", "*").unwrap();
    provider.append("Application", service_record().task(3));

    let event = next_event(&watcher);
    assert_eq!(event.task, Some(3));
    assert_eq!(event.task_text, None);
    assert!(event.text_errors.is_empty());
    assert!(event.message.is_some());
    assert!(event.level_text.is_some());
    assert!(event.opcode_text.is_some());
    assert!(event.provider_text.is_some());
    assert!(event.channel_text.is_some());
    assert!(event.id_text.is_some());
    assert!(watcher.errors().try_recv().is_err());
}

#[test]
fn test_per_subscription_render_options() {
    let (provider, watcher) = setup(&["Application", "System"]);
    watcher
        .subscribe_with(
            SubscribeOptions::new("Application", StartMode::Now)
                .with_render(RenderOptions::none().with_level(true)),
        )
        .unwrap();
    watcher.subscribe_from_now("System", "*").unwrap();

    provider.append("Application", service_record());
    let event = next_event(&watcher);
    assert_eq!(event.level_text.as_deref(), Some("Information"));
    assert_eq!(event.message, None);

    provider.append("System", service_record());
    let event = next_event(&watcher);
    assert!(event.message.is_some());
}

#[test]
fn test_query_filter() {
    let (provider, watcher) = setup(&["System"]);
    watcher
        .subscribe("System", "*[System[(Level=2)]]", StartMode::Now)
        .unwrap();

    provider.append("System", service_record().level(4));
    provider.append("System", service_record().level(2));

    let event = next_event(&watcher);
    assert_eq!(event.record_id, Some(2));
    assert_eq!(event.level, Some(2));
}

#[test]
fn test_missing_message_is_recorded_not_fatal() {
    let (provider, watcher) = setup(&["Application"]);
    watcher.subscribe_from_now("Application", "*").unwrap();
    provider.append("Application", MemoryRecord::new("NoMessages", 1000));

    let event = next_event(&watcher);
    assert_eq!(event.message, None);
    assert!(event.text_errors.contains_key(&TextKind::Message));
    assert!(event.level_text.is_some());
}

#[test]
fn test_event_ships_as_json() {
    let (provider, watcher) = setup(&["Application"]);
    watcher.subscribe_from_now("Application", "*").unwrap();
    provider.append("Application", service_record());

    let event = next_event(&watcher);
    let json = event.to_json().unwrap();
    let parsed: Event = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, event);
}

#[test]
fn test_small_buffers_still_deliver_everything() {
    init_tracing();
    let provider = Arc::new(MemoryProvider::new());
    provider.create_channel("Application");
    let watcher = Watcher::with_config(
        Arc::clone(&provider),
        WatcherConfig {
            event_buffer: 0,
            error_buffer: 0,
            render: RenderOptions::none(),
        },
    )
    .unwrap();
    watcher.subscribe_from_now("Application", "*").unwrap();

    for _ in 0..50 {
        provider.append("Application", MemoryRecord::new("Test", 1));
    }
    let ids: Vec<_> = (0..50).map(|_| next_event(&watcher).record_id.unwrap()).collect();
    assert_eq!(ids, (1..=50).collect::<Vec<u64>>());
    assert_eq!(watcher.state("Application"), Some(SubscriptionState::Active));
}
