use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gateway_sdk::{InMemorySessionStore, SessionRecord, SessionState, SessionStore};
use session_gateway::client::{ClientError, ClientEvent};
use session_gateway::media::MediaRequest;
use session_gateway::policy::LifecyclePolicy;
use session_gateway::testing::{ScriptedClientFactory, SentItem, StartupOutcome};
use session_gateway::{ManagerOptions, SessionError, SessionManager};
use tokio::time::{Instant, sleep};

const HOUR: Duration = Duration::from_secs(60 * 60);

struct Fixture {
    manager: SessionManager,
    factory: Arc<ScriptedClientFactory>,
    store: Arc<InMemorySessionStore>,
}

fn fixture(policy: LifecyclePolicy) -> Fixture {
    let store = InMemorySessionStore::new();
    let factory = ScriptedClientFactory::new();
    let manager = SessionManager::new(
        store.clone(),
        factory.clone(),
        ManagerOptions {
            policy,
            ..ManagerOptions::default()
        },
    );
    Fixture {
        manager,
        factory,
        store,
    }
}

async fn wait_until(what: &str, within: Duration, check: impl Fn() -> bool) {
    let deadline = Instant::now() + within;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_state(manager: &SessionManager, id: &str, want: SessionState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(status) = manager.status(id).await {
            if status.state == want {
                return;
            }
        }
        assert!(Instant::now() < deadline, "{id} never reached {want}");
        sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_record(store: &InMemorySessionStore, id: &str, want: SessionState) -> SessionRecord {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(Some(record)) = store.find_by_id(id).await {
            if record.state == want {
                return record;
            }
        }
        assert!(Instant::now() < deadline, "record {id} never reached {want}");
        sleep(Duration::from_millis(5)).await;
    }
}

async fn connect(fx: &Fixture, id: &str) {
    fx.manager.init(id).await.unwrap();
    let client = fx.factory.latest(id).unwrap();
    assert!(client.emit(ClientEvent::Ready));
    wait_for_state(&fx.manager, id, SessionState::Connected).await;
}

fn media() -> MediaRequest {
    MediaRequest {
        phone: "5215512345678".into(),
        base64: Some("aGVsbG8=".into()),
        ..MediaRequest::default()
    }
}

#[tokio::test]
async fn concurrent_init_builds_one_client() {
    let fx = fixture(LifecyclePolicy::default());
    let (a, b) = tokio::join!(fx.manager.init("alice"), fx.manager.init("alice"));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.created ^ b.created);
    assert_eq!(fx.factory.built("alice"), 1);
    assert_eq!(fx.manager.registry().len(), 1);
    wait_for_record(&fx.store, "alice", SessionState::Init).await;
}

#[tokio::test]
async fn alice_pairs_sends_and_closes() {
    let fx = fixture(LifecyclePolicy::default());
    let created = fx.manager.init("alice").await.unwrap();
    assert!(created.created);
    assert_eq!(created.state, SessionState::Init);

    let client = fx.factory.latest("alice").unwrap();
    client.emit(ClientEvent::Qr("XYZ".into()));
    wait_for_state(&fx.manager, "alice", SessionState::QrNeeded).await;
    let status = fx.manager.status("alice").await.unwrap();
    assert_eq!(status.pairing_payload.as_deref(), Some("XYZ"));
    assert!(status.live);
    let record = wait_for_record(&fx.store, "alice", SessionState::QrNeeded).await;
    assert_eq!(record.pairing_payload.as_deref(), Some("XYZ"));

    client.emit(ClientEvent::Ready);
    wait_for_state(&fx.manager, "alice", SessionState::Connected).await;
    let status = fx.manager.status("alice").await.unwrap();
    assert_eq!(status.pairing_payload, None);
    let record = wait_for_record(&fx.store, "alice", SessionState::Connected).await;
    assert_eq!(record.pairing_payload, None);

    let sent = fx
        .manager
        .send_message("alice", "5215512345678", "hola")
        .await
        .unwrap();
    assert!(!sent.message_id.is_empty());
    assert_eq!(
        client.sent(),
        vec![SentItem::Text {
            chat_id: "5215512345678@c.us".into(),
            text: "hola".into(),
        }]
    );

    assert!(fx.manager.close("alice").await.unwrap());
    assert_eq!(client.destroy_calls(), 1);
    let status = fx.manager.status("alice").await.unwrap();
    assert_eq!(status.state, SessionState::Disconnected);
    assert!(!status.live);
    assert_eq!(fx.manager.registry().list().count(), 0);

    let listed = fx.manager.list().await.unwrap();
    let alice = listed.iter().find(|s| s.session_id == "alice").unwrap();
    assert!(!alice.live);
    assert_eq!(alice.state, SessionState::Disconnected);

    // the closed client can no longer reach the manager
    assert!(!client.emit(ClientEvent::Ready));
    assert!(matches!(
        fx.manager.send_message("alice", "5215512345678", "again").await,
        Err(SessionError::SessionNotReady {
            state: SessionState::Disconnected,
            ..
        })
    ));
}

#[tokio::test]
async fn sends_require_connected() {
    let fx = fixture(LifecyclePolicy::default());
    let cases = [
        ("s-init", None),
        ("s-qr", Some(ClientEvent::Qr("QR".into()))),
        ("s-auth", Some(ClientEvent::AuthFailure)),
        ("s-down", Some(ClientEvent::Disconnected)),
    ];
    for (id, event) in cases {
        fx.manager.init(id).await.unwrap();
        let expected = match &event {
            None => SessionState::Init,
            Some(ClientEvent::Qr(_)) => SessionState::QrNeeded,
            Some(ClientEvent::AuthFailure) => SessionState::AuthFailed,
            Some(_) => SessionState::Disconnected,
        };
        if let Some(event) = event {
            fx.factory.latest(id).unwrap().emit(event);
        }
        wait_for_state(&fx.manager, id, expected).await;

        let text = fx.manager.send_message(id, "521", "hi").await;
        assert!(
            matches!(text, Err(SessionError::SessionNotReady { state, .. }) if state == expected),
            "{id}: {text:?}"
        );
        let sent_media = fx.manager.send_media(id, media()).await;
        assert!(
            matches!(sent_media, Err(SessionError::SessionNotReady { .. })),
            "{id}: {sent_media:?}"
        );
        assert!(fx.factory.latest(id).unwrap().sent().is_empty());
    }

    connect(&fx, "s-ok").await;
    fx.manager.send_message("s-ok", "521", "hi").await.unwrap();
    fx.manager.send_media("s-ok", media()).await.unwrap();
    let sent = fx.factory.latest("s-ok").unwrap().sent();
    assert_eq!(sent.len(), 2);
    match &sent[1] {
        SentItem::Media { chat_id, media, .. } => {
            assert_eq!(chat_id, "521@c.us");
            assert_eq!(media.data, b"hello");
            assert_eq!(media.mime_type, "image/jpeg");
        }
        other => panic!("unexpected send {other:?}"),
    }
}

#[tokio::test]
async fn send_failure_leaves_state_alone() {
    let fx = fixture(LifecyclePolicy::default());
    connect(&fx, "alice").await;
    fx.factory.latest("alice").unwrap().fail_sends(true);
    assert!(matches!(
        fx.manager.send_message("alice", "521", "hi").await,
        Err(SessionError::SendFailure(_))
    ));
    assert_eq!(
        fx.manager.status("alice").await.unwrap().state,
        SessionState::Connected
    );
}

#[tokio::test]
async fn close_completes_when_teardown_fails() {
    let fx = fixture(LifecyclePolicy::default());
    fx.factory.fail_destroy(true);
    connect(&fx, "alice").await;
    assert!(fx.manager.close("alice").await.unwrap());

    let client = fx.factory.latest("alice").unwrap();
    assert_eq!(client.destroy_calls(), 1);
    assert!(fx.manager.registry().get("alice").is_none());
    let record = fx.store.find_by_id("alice").await.unwrap().unwrap();
    assert_eq!(record.state, SessionState::Disconnected);

    assert!(!fx.manager.close("alice").await.unwrap());
    assert_eq!(client.destroy_calls(), 1);
}

#[tokio::test]
async fn close_interrupts_startup() {
    let fx = fixture(LifecyclePolicy::default());
    fx.factory.set_default_startup(StartupOutcome::Hang);
    fx.manager.init("alice").await.unwrap();
    let client = fx.factory.latest("alice").unwrap();
    wait_until("initialize to start", Duration::from_secs(5), || {
        client.initialize_calls() == 1
    })
    .await;

    assert!(fx.manager.close("alice").await.unwrap());
    assert_eq!(client.destroy_calls(), 1);
    let record = fx.store.find_by_id("alice").await.unwrap().unwrap();
    assert_eq!(record.state, SessionState::Disconnected);
}

#[tokio::test]
async fn restart_never_reports_stale_connected() {
    let fx = fixture(LifecyclePolicy::default());
    connect(&fx, "alice").await;
    let first = fx.factory.latest("alice").unwrap();

    let restarted = fx.manager.restart("alice").await.unwrap();
    assert_eq!(restarted.state, SessionState::Init);
    let status = fx.manager.status("alice").await.unwrap();
    assert_eq!(status.state, SessionState::Init);
    assert!(status.live);

    assert_eq!(first.destroy_calls(), 1);
    assert_eq!(fx.factory.built("alice"), 2);
    assert_eq!(fx.manager.registry().len(), 1);
}

#[tokio::test]
async fn late_events_do_not_regress_state() {
    let fx = fixture(LifecyclePolicy::default());
    connect(&fx, "alice").await;
    let client = fx.factory.latest("alice").unwrap();
    client.emit(ClientEvent::Qr("late".into()));
    client.emit(ClientEvent::AuthFailure);
    wait_for_state(&fx.manager, "alice", SessionState::AuthFailed).await;
    assert_eq!(
        fx.manager.status("alice").await.unwrap().pairing_payload,
        None
    );
}

#[tokio::test(start_paused = true)]
async fn two_transient_failures_end_disconnected() {
    let fx = fixture(LifecyclePolicy::default());
    fx.factory
        .fail_next_startups(2, ClientError::LaunchFailed("chromium missing".into()));
    fx.manager.init("bob").await.unwrap();

    wait_until("the retry", HOUR, || fx.factory.built("bob") == 2).await;
    wait_until("the session to be retired", HOUR, || {
        fx.manager.registry().get("bob").is_none()
    })
    .await;
    let record = fx.store.find_by_id("bob").await.unwrap().unwrap();
    assert_eq!(record.state, SessionState::Disconnected);
    for client in fx.factory.clients("bob") {
        assert_eq!(client.destroy_calls(), 1);
    }

    sleep(HOUR).await;
    assert_eq!(fx.factory.built("bob"), 2);

    // an explicit init starts over
    fx.manager.init("bob").await.unwrap();
    assert_eq!(fx.factory.built("bob"), 3);
    wait_for_state(&fx.manager, "bob", SessionState::Init).await;
}

#[tokio::test(start_paused = true)]
async fn retry_recovers_after_one_transient_failure() {
    let fx = fixture(LifecyclePolicy::default());
    fx.factory
        .fail_next_startups(1, ClientError::SessionClosed("target closed".into()));
    let started = Instant::now();
    fx.manager.init("bob").await.unwrap();
    wait_until("the retry", HOUR, || fx.factory.built("bob") == 2).await;
    assert!(started.elapsed() >= Duration::from_secs(10));

    let client = fx.factory.latest("bob").unwrap();
    client.emit(ClientEvent::Ready);
    wait_for_state(&fx.manager, "bob", SessionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn startup_failure_after_disconnect_event_is_retried() {
    let fx = fixture(LifecyclePolicy::default());
    fx.factory.script_startups([StartupOutcome::FailAfterDisconnect(
        ClientError::SessionClosed("bridge process exited".into()),
    )]);
    fx.manager.init("gina").await.unwrap();

    wait_until("the retry", HOUR, || fx.factory.built("gina") == 2).await;
    assert_eq!(fx.factory.clients("gina")[0].destroy_calls(), 1);
    wait_for_state(&fx.manager, "gina", SessionState::Init).await;
    let successor = fx.factory.latest("gina").unwrap();
    successor.emit(ClientEvent::Ready);
    wait_for_state(&fx.manager, "gina", SessionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn repeated_exits_during_startup_retire_the_session() {
    let fx = fixture(LifecyclePolicy::default());
    let exit = ClientError::SessionClosed("bridge process exited".into());
    fx.factory.script_startups([
        StartupOutcome::FailAfterDisconnect(exit.clone()),
        StartupOutcome::FailAfterDisconnect(exit),
    ]);
    fx.manager.init("hank").await.unwrap();

    wait_until("the session to be retired", HOUR, || {
        fx.factory.built("hank") == 2 && fx.manager.registry().get("hank").is_none()
    })
    .await;
    sleep(HOUR).await;
    assert_eq!(fx.factory.built("hank"), 2);
    let record = fx.store.find_by_id("hank").await.unwrap().unwrap();
    assert_eq!(record.state, SessionState::Disconnected);

    // a fresh init builds a new client instead of reusing a dead one
    let created = fx.manager.init("hank").await.unwrap();
    assert!(created.created);
    assert_eq!(fx.factory.built("hank"), 3);
}

#[tokio::test(start_paused = true)]
async fn fatal_startup_failure_is_not_retried() {
    let fx = fixture(LifecyclePolicy::default());
    fx.factory
        .fail_next_startups(1, ClientError::Rejected("profile locked".into()));
    fx.manager.init("carol").await.unwrap();
    wait_until("the session to be retired", HOUR, || {
        fx.manager.registry().get("carol").is_none()
    })
    .await;
    sleep(HOUR).await;
    assert_eq!(fx.factory.built("carol"), 1);
    let record = fx.store.find_by_id("carol").await.unwrap().unwrap();
    assert_eq!(record.state, SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn maintenance_restarts_connected_sessions() {
    let fx = fixture(LifecyclePolicy::default());
    connect(&fx, "dave").await;
    let first = fx.factory.latest("dave").unwrap();

    wait_until("the maintenance restart", 48 * HOUR, || {
        fx.factory.built("dave") == 2
    })
    .await;
    wait_for_state(&fx.manager, "dave", SessionState::Init).await;
    assert_eq!(first.destroy_calls(), 1);
    assert_eq!(fx.manager.registry().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn maintenance_can_close_only() {
    let fx = fixture(LifecyclePolicy {
        restart_on_maintenance: false,
        ..LifecyclePolicy::default()
    });
    connect(&fx, "erin").await;
    wait_until("the maintenance close", 48 * HOUR, || {
        fx.manager.registry().get("erin").is_none()
    })
    .await;
    assert_eq!(fx.factory.built("erin"), 1);
    let record = fx.store.find_by_id("erin").await.unwrap().unwrap();
    assert_eq!(record.state, SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_maintenance() {
    let fx = fixture(LifecyclePolicy::default());
    connect(&fx, "frank").await;
    fx.factory
        .latest("frank")
        .unwrap()
        .emit(ClientEvent::Disconnected);
    wait_for_state(&fx.manager, "frank", SessionState::Disconnected).await;

    sleep(48 * HOUR).await;
    assert_eq!(fx.factory.built("frank"), 1);
    assert!(fx.manager.registry().get("frank").is_some());
}

#[tokio::test]
async fn start_reconciles_orphaned_records() {
    let fx = fixture(LifecyclePolicy::default());
    let then = Utc::now() - chrono::Duration::minutes(5);
    for (id, state) in [
        ("old-connected", SessionState::Connected),
        ("old-qr", SessionState::QrNeeded),
        ("old-auth", SessionState::AuthFailed),
    ] {
        fx.store
            .upsert(SessionRecord::new(id, state, Some("stale".into()), then))
            .await
            .unwrap();
    }
    assert_eq!(fx.manager.start().await.unwrap(), 2);

    for id in ["old-connected", "old-qr"] {
        let record = fx.store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.state, SessionState::Disconnected);
        assert_eq!(record.pairing_payload, None);
    }
    let untouched = fx.store.find_by_id("old-auth").await.unwrap().unwrap();
    assert_eq!(untouched.state, SessionState::AuthFailed);
    assert_eq!(fx.factory.built("old-connected"), 0);
}

#[tokio::test]
async fn list_prefers_live_state() {
    let fx = fixture(LifecyclePolicy::default());
    fx.store
        .upsert(SessionRecord::new(
            "zed",
            SessionState::Disconnected,
            None,
            Utc::now(),
        ))
        .await
        .unwrap();
    connect(&fx, "alice").await;

    let listed = fx.manager.list().await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids, vec!["alice", "zed"]);
    assert!(listed[0].live && listed[0].connected);
    assert!(!listed[1].live && !listed[1].connected);
}

#[tokio::test]
async fn unknown_sessions_are_not_found() {
    let fx = fixture(LifecyclePolicy::default());
    assert!(matches!(
        fx.manager.status("nobody").await,
        Err(SessionError::SessionNotFound(_))
    ));
    assert!(!fx.manager.close("nobody").await.unwrap());
    assert!(fx.store.find_by_id("nobody").await.unwrap().is_none());
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let fx = fixture(LifecyclePolicy::default());
    connect(&fx, "alice").await;
    fx.manager.init("bob").await.unwrap();
    wait_for_record(&fx.store, "bob", SessionState::Init).await;

    fx.manager.shutdown().await;
    assert!(fx.manager.registry().is_empty());
    for id in ["alice", "bob"] {
        let record = fx.store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.state, SessionState::Disconnected);
        assert_eq!(fx.factory.latest(id).unwrap().destroy_calls(), 1);
    }
}
