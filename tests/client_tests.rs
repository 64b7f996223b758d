//! End-to-end client scenarios against an in-process mock discovery server.

use axum::extract::{Form, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use discovery::{Config, Discovery, Error, Instance};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Default)]
struct MockState {
    /// Addresses `/discovery/nodes` advertises.
    nodes: Mutex<Vec<String>>,
    nodes_requests: AtomicUsize,
    registers: Mutex<Vec<HashMap<String, String>>>,
    cancels: Mutex<Vec<HashMap<String, String>>>,
    /// Raw query pairs of every poll received, in order.
    polls: Mutex<Vec<Vec<(String, String)>>>,
    /// Scripted poll replies: (delay before answering, body). When the
    /// script runs dry the handler long-polls and reports no changes.
    poll_replies: Mutex<VecDeque<(u64, Value)>>,
}

async fn register_handler(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    state.registers.lock().push(form);
    Json(json!({"code": 0, "message": ""}))
}

async fn renew_handler(Form(_form): Form<HashMap<String, String>>) -> Json<Value> {
    Json(json!({"code": 0, "message": ""}))
}

async fn cancel_handler(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    state.cancels.lock().push(form);
    Json(json!({"code": 0, "message": ""}))
}

async fn nodes_handler(State(state): State<Arc<MockState>>) -> Json<Value> {
    state.nodes_requests.fetch_add(1, Ordering::SeqCst);
    let addrs: Vec<Value> = state
        .nodes
        .lock()
        .iter()
        .map(|addr| json!({"addr": addr}))
        .collect();
    Json(json!({"code": 0, "data": addrs}))
}

async fn polls_handler(
    State(state): State<Arc<MockState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Json<Value> {
    state.polls.lock().push(params);
    let scripted = state.poll_replies.lock().pop_front();
    match scripted {
        Some((delay_ms, body)) => {
            sleep(Duration::from_millis(delay_ms)).await;
            Json(body)
        }
        None => {
            // default long poll: hold the request, then report no changes
            sleep(Duration::from_secs(60)).await;
            Json(json!({"code": -304}))
        }
    }
}

async fn start_mock(state: Arc<MockState>) -> SocketAddr {
    let app = Router::new()
        .route("/discovery/register", post(register_handler))
        .route("/discovery/renew", post(renew_handler))
        .route("/discovery/cancel", post(cancel_handler))
        .route("/discovery/nodes", get(nodes_handler))
        .route("/discovery/polls", get(polls_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client(addr: SocketAddr) -> Discovery {
    Discovery::new(
        Config::new(addr.to_string())
            .with_zone("sh1")
            .with_env("test")
            .with_host("test-host"),
    )
    .unwrap()
}

fn instance_json(hostname: &str) -> Value {
    json!({
        "appid": "svc",
        "zone": "sh1",
        "env": "test",
        "hostname": hostname,
        "addrs": ["http://10.0.0.1:80"],
        "status": 1,
        "reg_timestamp": 10,
        "dirty_timestamp": 20,
        "latest_timestamp": 30
    })
}

fn delta_reply(last_ts: i64) -> Value {
    json!({
        "code": 0,
        "data": {
            "svc": {
                "zone_instances": {"sh1": [instance_json("peer-1")]},
                "latest_timestamp": last_ts
            }
        }
    })
}

fn pair(key: &str, value: &str) -> (String, String) {
    (key.to_string(), value.to_string())
}

#[tokio::test]
async fn test_register_round_trip() {
    let mock = Arc::new(MockState::default());
    let addr = start_mock(mock.clone()).await;
    let discovery = client(addr);

    let registration = discovery
        .register(
            Instance::new("svc")
                .with_addr("http://10.0.0.1:80")
                .with_color("red"),
        )
        .await
        .unwrap();

    {
        let registers = mock.registers.lock();
        assert_eq!(registers.len(), 1);
        let form = &registers[0];
        assert_eq!(form["appid"], "svc");
        assert_eq!(form["zone"], "sh1");
        assert_eq!(form["env"], "test");
        assert_eq!(form["hostname"], "test-host");
        assert_eq!(form["addrs"], "http://10.0.0.1:80");
        assert_eq!(form["color"], "red");
        assert_eq!(form["status"], "1");
    }

    // a second registration for the same appid on the same client fails
    let err = discovery
        .register(Instance::new("svc"))
        .await
        .expect_err("duplicate registration must be rejected");
    assert!(matches!(err, Error::Duplication));

    registration.cancel().await;
    {
        let cancels = mock.cancels.lock();
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0]["appid"], "svc");
        assert_eq!(cancels[0]["hostname"], "test-host");
    }

    // after an orderly cancel the appid is free again
    let again = discovery.register(Instance::new("svc")).await.unwrap();
    again.cancel().await;
    discovery.close();
}

#[tokio::test]
async fn test_watch_and_incremental_poll() {
    let mock = Arc::new(MockState::default());
    let addr = start_mock(mock.clone()).await;
    mock.nodes.lock().push(addr.to_string());
    mock.poll_replies.lock().push_back((0, delta_reply(100)));
    mock.poll_replies.lock().push_back((50, json!({"code": -304})));

    let discovery = client(addr);
    let mut events = discovery.watch("svc").await;

    timeout(Duration::from_secs(5), events.changed())
        .await
        .expect("first delta fires an event")
        .unwrap();

    // watching again is idempotent and taps the same change channel
    let events_dup = discovery.watch("svc").await;
    assert_eq!(*events_dup.borrow(), *events.borrow());

    let snapshot = discovery.fetch("svc").unwrap();
    assert_eq!(snapshot["sh1"].len(), 1);
    assert_eq!(snapshot["sh1"][0].app_id, "svc");
    assert!(snapshot["sh1"][0].has_ordered_timestamps());

    // give the loop time to issue the follow-up poll and see NotModified
    sleep(Duration::from_millis(400)).await;
    {
        let polls = mock.polls.lock();
        assert!(polls.len() >= 2, "expected a follow-up poll");
        assert!(polls[0].contains(&pair("env", "test")));
        assert!(polls[0].contains(&pair("hostname", "test-host")));
        assert!(polls[0].contains(&pair("appid", "svc")));
        assert!(polls[0].contains(&pair("latest_timestamp", "0")));
        // the baseline advanced to the delivered timestamp
        assert!(polls[1].contains(&pair("latest_timestamp", "100")));
    }

    // NotModified is a silent success: no event, snapshot untouched
    assert!(!events.has_changed().unwrap());
    assert_eq!(discovery.fetch("svc").unwrap()["sh1"].len(), 1);
    discovery.close();
}

#[tokio::test]
async fn test_host_change_resets_baselines() {
    let mock_a = Arc::new(MockState::default());
    let addr_a = start_mock(mock_a.clone()).await;
    let mock_b = Arc::new(MockState::default());
    let addr_b = start_mock(mock_b.clone()).await;
    mock_a
        .nodes
        .lock()
        .extend([addr_a.to_string(), addr_b.to_string()]);

    // whichever node is polled first delivers a delta, then fails so the
    // loop advances to the other node
    for mock in [&mock_a, &mock_b] {
        mock.poll_replies.lock().push_back((0, delta_reply(100)));
        mock.poll_replies.lock().push_back((0, json!({"code": -500})));
    }

    let discovery = client(addr_a);
    let mut events = discovery.watch("svc").await;
    timeout(Duration::from_secs(5), events.changed())
        .await
        .expect("first delta fires an event")
        .unwrap();

    // one-second backoff after the failure, then the poll against the
    // other host
    sleep(Duration::from_millis(2500)).await;

    let polls_a = mock_a.polls.lock();
    let polls_b = mock_b.polls.lock();
    assert!(!polls_a.is_empty() && !polls_b.is_empty(), "both hosts were polled");
    // baselines are per-server: the first poll against each host starts
    // from zero even though a delta had already been delivered
    assert!(polls_a[0].contains(&pair("latest_timestamp", "0")));
    assert!(polls_b[0].contains(&pair("latest_timestamp", "0")));
    // and the host that delivered the delta was re-polled incrementally
    let incremental = polls_a
        .iter()
        .chain(polls_b.iter())
        .any(|poll| poll.contains(&pair("latest_timestamp", "100")));
    assert!(incremental);
    discovery.close();
}

#[tokio::test]
async fn test_new_watch_interrupts_poll() {
    let mock = Arc::new(MockState::default());
    let addr = start_mock(mock.clone()).await;
    mock.nodes.lock().push(addr.to_string());
    // first poll hangs; the reissued poll answers both apps
    mock.poll_replies.lock().push_back((10_000, json!({"code": -304})));
    mock.poll_replies.lock().push_back((
        0,
        json!({
            "code": 0,
            "data": {
                "svc": {
                    "zone_instances": {"sh1": [instance_json("peer-1")]},
                    "latest_timestamp": 100
                },
                "svc2": {
                    "zone_instances": {"sh1": [instance_json("peer-2")]},
                    "latest_timestamp": 200
                }
            }
        }),
    ));

    let discovery = client(addr);
    let mut events = discovery.watch("svc").await;
    // let the first poll go out before adding the second app
    sleep(Duration::from_millis(300)).await;
    let mut events2 = discovery.watch("svc2").await;

    timeout(Duration::from_secs(5), events2.changed())
        .await
        .expect("interrupted poll was reissued with the new app")
        .unwrap();
    events.changed().await.unwrap();
    assert!(discovery.fetch("svc2").is_some());

    {
        let polls = mock.polls.lock();
        assert!(polls.len() >= 2);
        assert!(!polls[0].contains(&pair("appid", "svc2")));
        assert!(polls[1].contains(&pair("appid", "svc")));
        assert!(polls[1].contains(&pair("appid", "svc2")));
    }
    discovery.close();
}

#[tokio::test]
async fn test_unwatch_closes_event_channel() {
    let mock = Arc::new(MockState::default());
    let addr = start_mock(mock.clone()).await;
    mock.nodes.lock().push(addr.to_string());
    // quick no-change replies keep the loop iterating
    for _ in 0..50 {
        mock.poll_replies.lock().push_back((100, json!({"code": -304})));
    }

    let discovery = client(addr);
    let mut events = discovery.watch("svc").await;
    sleep(Duration::from_millis(250)).await;
    discovery.unwatch("svc").await;

    // the loop drains the delete queue on its next iteration, dropping
    // the watcher and closing the channel
    let closed = timeout(Duration::from_secs(5), async {
        while events.changed().await.is_ok() {}
    })
    .await;
    assert!(closed.is_ok(), "event channel closed after unwatch");
    discovery.close();
}

#[tokio::test]
async fn test_empty_node_list_backoff() {
    let mock = Arc::new(MockState::default());
    let addr = start_mock(mock.clone()).await;
    // /discovery/nodes answers successfully but advertises nothing

    let discovery = client(addr);
    let _events = discovery.watch("svc").await;
    sleep(Duration::from_millis(2500)).await;

    // the loop kept retrying with its one-second backoff and never polled
    assert!(mock.nodes_requests.load(Ordering::SeqCst) >= 2);
    assert!(mock.polls.lock().is_empty());
    discovery.close();
}

#[tokio::test]
async fn test_zero_poll_timestamp_is_rejected() {
    let mock = Arc::new(MockState::default());
    let addr = start_mock(mock.clone()).await;
    mock.nodes.lock().push(addr.to_string());
    mock.poll_replies.lock().push_back((
        0,
        json!({
            "code": 0,
            "data": {
                "svc": {
                    "zone_instances": {"sh1": [instance_json("peer-1")]},
                    "latest_timestamp": 0
                }
            }
        }),
    ));

    let discovery = client(addr);
    let mut events = discovery.watch("svc").await;
    sleep(Duration::from_millis(600)).await;

    // a zero timestamp marks a broken server: no snapshot, no event
    assert!(discovery.fetch("svc").is_none());
    assert!(!events.has_changed().unwrap());
    discovery.close();
}
