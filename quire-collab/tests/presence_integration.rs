//! Integration tests for presence: awareness replicated through the relay
//! and folded into collaborator rosters.

use std::sync::Arc;

use quire_collab::document::DocRegistry;
use quire_collab::presence::{Collaborator, SelectionRange};
use quire_collab::server::{RelayConfig, RelayServer};
use quire_collab::session::{Session, SessionConfig, SessionOptions};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration, Instant};

async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(RelayServer::new(RelayConfig::default()));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://127.0.0.1:{port}")
}

async fn open_connected(registry: &DocRegistry, endpoint: &str, doc: &str) -> Session {
    let config = SessionConfig {
        initial_backoff: Duration::from_millis(20),
        ..SessionConfig::with_endpoint(endpoint)
    };
    let session = Session::open(registry, &config, doc, SessionOptions::default()).unwrap();
    timeout(Duration::from_secs(5), session.wait_connected())
        .await
        .expect("session should connect within timeout")
        .expect("session should connect");
    session
}

async fn wait_for_roster<F>(roster: impl Fn() -> Vec<Collaborator>, what: &str, condition: F) -> Vec<Collaborator>
where
    F: Fn(&[Collaborator]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let current = roster();
        if condition(&current) {
            return current;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}: {current:?}");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_remote_user_appears_in_roster() {
    let url = start_relay().await;
    let (ra, rb) = (DocRegistry::new(), DocRegistry::new());
    let alice = open_connected(&ra, &url, "team").await;
    let bob = open_connected(&rb, &url, "team").await;

    let tracker = bob.presence(|_| {});
    alice.set_local_user("Ada", "#30bced");
    alice.set_local_cursor(Some(SelectionRange { anchor: 4, head: 9 }));

    let roster = wait_for_roster(|| tracker.roster(), "alice's cursor", |r| {
        r.len() == 1 && r[0].selection.is_some()
    })
    .await;

    let ada = &roster[0];
    assert_eq!(ada.client_id, alice.client_id());
    assert_eq!(ada.name, "Ada");
    assert_eq!(ada.color, "#30bced");
    assert_eq!(ada.selection, Some(SelectionRange { anchor: 4, head: 9 }));
    assert!(ada.is_active);
}

#[tokio::test]
async fn test_roster_never_contains_self() {
    let url = start_relay().await;
    let (ra, rb) = (DocRegistry::new(), DocRegistry::new());
    let alice = open_connected(&ra, &url, "self").await;
    let bob = open_connected(&rb, &url, "self").await;

    let tracker = alice.presence(|_| {});
    alice.set_local_user("Ada", "#30bced");
    bob.set_local_user("Grace", "#ee6352");

    let roster = wait_for_roster(|| tracker.roster(), "bob", |r| !r.is_empty()).await;
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].name, "Grace");
    assert!(roster.iter().all(|c| c.client_id != alice.client_id()));
}

#[tokio::test]
async fn test_late_joiner_gets_roster_replay() {
    let url = start_relay().await;
    let (ra, rb) = (DocRegistry::new(), DocRegistry::new());
    let alice = open_connected(&ra, &url, "replay").await;
    alice.set_local_user("Ada", "#30bced");
    sleep(Duration::from_millis(50)).await;

    let bob = open_connected(&rb, &url, "replay").await;
    let tracker = bob.presence(|_| {});
    // Subscribing seeds the roster from current state.
    let roster = wait_for_roster(|| tracker.roster(), "replayed roster", |r| r.len() == 1).await;
    assert_eq!(roster[0].name, "Ada");
    assert!(!roster[0].is_active);
}

#[tokio::test]
async fn test_missing_name_falls_back_to_client_id() {
    let url = start_relay().await;
    let (ra, rb) = (DocRegistry::new(), DocRegistry::new());
    let alice = open_connected(&ra, &url, "anon").await;
    let bob = open_connected(&rb, &url, "anon").await;

    let tracker = bob.presence(|_| {});
    alice.set_local_user("Anonymous", "#30bced");

    let roster = wait_for_roster(|| tracker.roster(), "nameless alice", |r| r.len() == 1).await;
    assert_eq!(roster[0].name, format!("User-{}", alice.client_id()));
}

#[tokio::test]
async fn test_departed_client_leaves_roster() {
    let url = start_relay().await;
    let (ra, rb) = (DocRegistry::new(), DocRegistry::new());
    let alice = open_connected(&ra, &url, "leave").await;
    let bob = open_connected(&rb, &url, "leave").await;

    let tracker = bob.presence(|_| {});
    alice.set_local_user("Ada", "#30bced");
    wait_for_roster(|| tracker.roster(), "alice to appear", |r| r.len() == 1).await;

    alice.close();
    wait_for_roster(|| tracker.roster(), "alice to leave", |r| r.is_empty()).await;
}
