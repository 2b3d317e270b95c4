use adm_core::stream_ipc::{encode_frame, InboundMessage};
use adm_core::{ApprovalRequest, ConnectionStatus, EventType, HistoryRecord, StreamEvent};
use adm_stream::{DispatchOutcome, Session, SessionUpdate, StreamConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

async fn bind_gateway() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    (listener, format!("ws://{addr}/ws"))
}

async fn accept_client(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.expect("accept");
    accept_async(stream).await.expect("handshake")
}

async fn send(ws: &mut WebSocketStream<TcpStream>, message: &InboundMessage) {
    let frame = encode_frame(message).expect("encode");
    ws.send(Message::Text(frame)).await.expect("send frame");
}

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn history(id: &str) -> InboundMessage {
    InboundMessage::History {
        event: HistoryRecord {
            event_id: id.to_string(),
            event_type: EventType::PlanCreated,
            version: None,
            timestamp: None,
            created_at: Some("2026-02-07T21:00:00+00:00".to_string()),
            producer: "meta_planner".to_string(),
            idempotency_key: None,
            payload: Map::new(),
        },
    }
}

fn live(id: &str, plan_id: &str) -> InboundMessage {
    InboundMessage::Event {
        event: StreamEvent {
            event_id: id.to_string(),
            event_type: EventType::CodeGenerated,
            version: "1.0".to_string(),
            timestamp: "2026-02-07T21:01:00+00:00".to_string(),
            producer: "dev_service".to_string(),
            idempotency_key: format!("key-{id}"),
            payload: payload(json!({"plan_id": plan_id})),
        },
    }
}

fn approval(id: &str) -> ApprovalRequest {
    ApprovalRequest {
        approval_id: id.to_string(),
        plan_id: "p1".to_string(),
        branch_name: "admadc/p1".to_string(),
        files_count: 3,
        security_reasoning: "no hardcoded credentials".to_string(),
        pr_context: Map::new(),
        decision: None,
        reviewer: None,
    }
}

/// Collects updates until `done` matches one, failing after a few seconds.
async fn wait_for(
    updates: &mut broadcast::Receiver<SessionUpdate>,
    mut done: impl FnMut(&SessionUpdate) -> bool,
) -> Vec<SessionUpdate> {
    let mut seen = Vec::new();
    loop {
        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("timed out waiting for session update")
            .expect("update channel closed");
        let finished = done(&update);
        seen.push(update);
        if finished {
            return seen;
        }
    }
}

fn event_ids(session: &Session) -> Vec<String> {
    session
        .events()
        .into_iter()
        .map(|event| event.event_id)
        .collect()
}

#[tokio::test]
async fn backlog_then_approval_round_trip() {
    let (listener, url) = bind_gateway().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_client(&listener).await;
        send(&mut ws, &history("e1")).await;
        send(&mut ws, &history("e2")).await;
        ws.send(Message::Text("{\"type\":".to_string()))
            .await
            .expect("send partial");
        send(&mut ws, &InboundMessage::Approval { approval: approval("a1") }).await;
        send(
            &mut ws,
            &InboundMessage::ApprovalDecided {
                approval: ApprovalRequest {
                    decision: Some("approved".to_string()),
                    reviewer: Some("operator".to_string()),
                    ..approval("a1")
                },
            },
        )
        .await;
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let session = Session::open(StreamConfig::parse(&url).expect("config"));
    let mut updates = session.subscribe();
    let seen = wait_for(&mut updates, |update| {
        matches!(
            update,
            SessionUpdate::Dispatched(DispatchOutcome::ApprovalResolved { .. })
        )
    })
    .await;

    assert!(seen.contains(&SessionUpdate::Status(ConnectionStatus::Connected)));
    assert!(!seen.iter().any(|update| matches!(
        update,
        SessionUpdate::Dispatched(DispatchOutcome::Discarded | DispatchOutcome::Ignored { .. })
    )));
    assert_eq!(event_ids(&session), vec!["e1", "e2"]);
    assert!(session.approvals().is_empty());
    assert_eq!(session.status(), ConnectionStatus::Connected);

    session.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not see the close")
        .expect("server task");
}

#[tokio::test]
async fn reconnects_after_gateway_drops_and_dedups_backlog() {
    let (listener, url) = bind_gateway().await;
    let server = tokio::spawn(async move {
        let mut first = accept_client(&listener).await;
        send(&mut first, &history("h1")).await;
        send(&mut first, &live("l1", "p1")).await;
        first.close(None).await.expect("close first");
        drop(first);

        let mut second = accept_client(&listener).await;
        send(&mut second, &history("h1")).await;
        send(&mut second, &history("h2")).await;
        while let Some(Ok(message)) = second.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let mut config = StreamConfig::parse(&url).expect("config");
    config.reconnect_delay = Duration::from_millis(50);
    let session = Session::open(config);
    let mut updates = session.subscribe();

    let seen = wait_for(&mut updates, |update| {
        matches!(
            update,
            SessionUpdate::Dispatched(DispatchOutcome::HistoryAppended { event_id }) if event_id == "h2"
        )
    })
    .await;

    let statuses: Vec<ConnectionStatus> = seen
        .iter()
        .filter_map(|update| match update {
            SessionUpdate::Status(status) => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
        ]
    );
    assert!(!seen.contains(&SessionUpdate::Dispatched(
        DispatchOutcome::HistoryDuplicate {
            event_id: "h1".to_string()
        }
    )));
    assert_eq!(event_ids(&session), vec!["l1", "h1", "h2"]);

    session.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not see the close")
        .expect("server task");
}
