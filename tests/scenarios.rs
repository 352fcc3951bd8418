//! End-to-end broker flows driven through the signaling protocol with mock
//! RTC sessions.

use broadcast_relay::broker::{Broker, Role};
use broadcast_relay::config::BrokerConfig;
use broadcast_relay::transport::{ConnectionParams, Flow, OutboundFrame, SignalingHandle, SignalingSession};
use broadcast_relay::webrtc::mock::{MockDataChannel, MockRtcSession, MockSessionFactory};
use broadcast_relay::webrtc::{MediaTrack, RtcEvent, SessionState};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Client {
    conn: SignalingSession,
    session: Arc<MockRtcSession>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl Client {
    /// JSON messages queued for this client since the last call
    fn received(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    async fn send(&mut self, message: Value) {
        self.conn.handle_text(&message.to_string()).await;
    }
}

struct Relay {
    broker: Arc<Broker>,
    factory: Arc<MockSessionFactory>,
}

impl Relay {
    fn new() -> Self {
        Self {
            broker: Arc::new(Broker::new(&BrokerConfig::default())),
            factory: MockSessionFactory::new(),
        }
    }

    async fn connect(&self, id: &str, role: Role, owner: Option<&str>) -> Client {
        let (signaling, outbound) = SignalingHandle::channel();
        let params = ConnectionParams {
            peer_id: id.to_string(),
            role,
            broadcast_owner_id: owner.map(String::from),
        };
        let index = self.factory.session_count();
        let (conn, _events) = SignalingSession::open(params, signaling, self.broker.clone(), self.factory.as_ref())
            .await
            .unwrap();
        let session = self.factory.session(index).unwrap();
        Client {
            conn,
            session,
            outbound,
        }
    }

    /// Publisher whose RTC session reached the connected state
    async fn connected_publisher(&self, id: &str) -> Client {
        let mut publisher = self.connect(id, Role::Publisher, None).await;
        publisher.session.set_state(SessionState::Connected);
        publisher
            .conn
            .handle_rtc_event(RtcEvent::StateChange(SessionState::Connected))
            .await;
        publisher
    }

    fn edges_of(&self, id: &str, role: Role) -> (usize, usize) {
        self.broker
            .snapshot()
            .into_iter()
            .find(|p| p.id == id && p.role == role)
            .map(|p| (p.viewers, p.sources))
            .unwrap_or((0, 0))
    }
}

fn view(leave: bool, owner: &str) -> Value {
    json!({"view": {"leave": leave, "broadcastOwnerPeerId": owner}})
}

fn viewers_info(count: usize) -> Value {
    json!({"viewersInfo": {"count": count}})
}

#[tokio::test]
async fn publisher_without_viewers_reports_zero() {
    let relay = Relay::new();
    let mut b = relay.connected_publisher("B").await;

    assert_eq!(b.received(), vec![viewers_info(0)]);
}

#[tokio::test]
async fn viewer_subscribe_clones_tracks_and_updates_count() {
    let relay = Relay::new();
    let mut b = relay.connected_publisher("B").await;
    b.conn
        .handle_rtc_event(RtcEvent::Track(MediaTrack::video("video0", "B")))
        .await;
    b.conn
        .handle_rtc_event(RtcEvent::Track(MediaTrack::audio("audio0", "B")))
        .await;
    b.received();

    let mut v1 = relay.connect("V1", Role::Viewer, None).await;
    v1.send(view(false, "B")).await;

    let replies = v1.received();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["broadCastReady"], true);
    assert_eq!(
        replies[0]["broadCastReadyMessage"],
        "ready now to receive broadcast from publisher : B"
    );
    assert_eq!(v1.session.track_ids(), vec!["video0".to_string(), "audio0".to_string()]);
    assert_eq!(b.received(), vec![viewers_info(1)]);

    assert_eq!(relay.edges_of("B", Role::Publisher), (1, 0));
    assert_eq!(relay.edges_of("V1", Role::Viewer), (0, 1));
}

#[tokio::test]
async fn viewer_leave_removes_edge_and_updates_count() {
    let relay = Relay::new();
    let mut b = relay.connected_publisher("B").await;
    let mut v1 = relay.connect("V1", Role::Viewer, None).await;
    v1.send(view(false, "B")).await;
    b.received();
    v1.received();

    v1.send(view(true, "B")).await;

    assert_eq!(b.received(), vec![viewers_info(0)]);
    assert!(v1.received().is_empty());
    assert_eq!(relay.edges_of("B", Role::Publisher), (0, 0));
    assert_eq!(relay.edges_of("V1", Role::Viewer), (0, 0));
}

#[tokio::test]
async fn publisher_close_notifies_viewers_and_removes_peer() {
    let relay = Relay::new();
    let mut b = relay.connected_publisher("B").await;
    let mut v1 = relay.connect("V1", Role::Viewer, None).await;
    let mut v2 = relay.connect("V2", Role::Viewer, None).await;
    v1.send(view(false, "B")).await;
    v2.send(view(false, "B")).await;
    v1.received();
    v2.received();

    b.conn.handle_transport_closed().await;

    let ended = json!({"broadCastEnded": true, "broadCastOwnerId": "B"});
    assert_eq!(v1.received(), vec![ended.clone()]);
    assert_eq!(v2.received(), vec![ended]);
    assert!(b.session.is_closed());

    let peers = relay.broker.snapshot();
    assert!(peers.iter().all(|p| p.id != "B"));
    assert_eq!(relay.edges_of("V1", Role::Viewer), (0, 0));
    assert_eq!(relay.edges_of("V2", Role::Viewer), (0, 0));
}

#[tokio::test]
async fn publisher_failure_notifies_viewers_and_removes_peer() {
    let relay = Relay::new();
    let mut b = relay.connected_publisher("B").await;
    let mut v1 = relay.connect("V1", Role::Viewer, None).await;
    let mut v2 = relay.connect("V2", Role::Viewer, None).await;
    v1.send(view(false, "B")).await;
    v2.send(view(false, "B")).await;
    v1.received();
    v2.received();

    let flow = b
        .conn
        .handle_rtc_event(RtcEvent::StateChange(SessionState::Failed))
        .await;
    assert_eq!(flow, Flow::Stop);

    let ended = json!({"broadCastEnded": true, "broadCastOwnerId": "B"});
    assert_eq!(v1.received(), vec![ended.clone()]);
    assert_eq!(v2.received(), vec![ended]);
    assert!(b.session.is_closed());

    assert!(relay.broker.snapshot().iter().all(|p| p.id != "B"));
    assert_eq!(relay.edges_of("V1", Role::Viewer), (0, 0));
    assert_eq!(relay.edges_of("V2", Role::Viewer), (0, 0));
}

#[tokio::test]
async fn publisher_payload_reaches_every_viewer_with_sender_id() {
    let relay = Relay::new();
    let mut b = relay.connected_publisher("B").await;
    let mut v1 = relay.connect("V1", Role::Viewer, None).await;
    let mut v2 = relay.connect("V2", Role::Viewer, None).await;
    v1.send(view(false, "B")).await;
    v2.send(view(false, "B")).await;

    let v1_channel = MockDataChannel::new("chat");
    let v2_channel = MockDataChannel::new("chat");
    v2_channel.set_open(false);
    v1.conn.handle_rtc_event(RtcEvent::DataChannel(v1_channel.clone())).await;
    v2.conn.handle_rtc_event(RtcEvent::DataChannel(v2_channel.clone())).await;

    b.conn
        .handle_rtc_event(RtcEvent::ChannelMessage(r#"{"msg":"hi"}"#.to_string()))
        .await;

    assert_eq!(v1_channel.sent(), vec![r#"{"msg":"hi","senderId":"B"}"#.to_string()]);
    assert!(v2_channel.sent().is_empty());
}

#[tokio::test]
async fn arbitrary_json_objects_are_relayed_with_sender_id() {
    let relay = Relay::new();
    let mut b = relay.connected_publisher("B").await;
    let mut v1 = relay.connect("V1", Role::Viewer, None).await;
    v1.send(view(false, "B")).await;

    let channel = MockDataChannel::new("chat");
    v1.conn.handle_rtc_event(RtcEvent::DataChannel(channel.clone())).await;

    for payload in [
        json!({"type": "reaction", "emoji": "+1"}),
        json!({"msg": {"text": "hi"}, "senderId": "spoofed"}),
        json!("just a string"),
    ] {
        b.conn
            .handle_rtc_event(RtcEvent::ChannelMessage(payload.to_string()))
            .await;
    }
    b.conn
        .handle_rtc_event(RtcEvent::ChannelMessage("not json".to_string()))
        .await;

    let delivered: Vec<Value> = channel
        .sent()
        .iter()
        .map(|text| serde_json::from_str(text).unwrap())
        .collect();
    assert_eq!(
        delivered,
        vec![
            json!({"type": "reaction", "emoji": "+1", "senderId": "B"}),
            json!({"msg": {"text": "hi"}, "senderId": "B"}),
        ]
    );
}

#[tokio::test]
async fn subscribe_to_unknown_publisher_is_refused() {
    let relay = Relay::new();
    let mut v1 = relay.connect("V1", Role::Viewer, None).await;

    v1.send(view(false, "Z")).await;

    let replies = v1.received();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["broadCastReady"], false);
    assert_eq!(replies[0]["broadCastReadyMessage"], "Publisher with id Z not found");
    assert_eq!(relay.edges_of("V1", Role::Viewer), (0, 0));
}

#[tokio::test]
async fn repeated_subscribe_does_not_duplicate_edges_or_tracks() {
    let relay = Relay::new();
    let mut b = relay.connected_publisher("B").await;
    b.conn
        .handle_rtc_event(RtcEvent::Track(MediaTrack::video("video0", "B")))
        .await;
    let mut v1 = relay.connect("V1", Role::Viewer, None).await;

    v1.send(view(false, "B")).await;
    v1.send(view(false, "B")).await;

    assert_eq!(relay.edges_of("B", Role::Publisher), (1, 0));
    assert_eq!(relay.edges_of("V1", Role::Viewer), (0, 1));
    assert_eq!(v1.session.track_ids().len(), 1);
    assert_eq!(b.received().last(), Some(&viewers_info(1)));
}

#[tokio::test]
async fn late_track_reaches_negotiated_viewer_with_offer() {
    let relay = Relay::new();
    let mut b = relay.connected_publisher("B").await;
    let mut v1 = relay.connect("V1", Role::Viewer, None).await;
    v1.send(json!({"sdp": {"type": "offer", "sdp": "v=0"}})).await;
    v1.send(view(false, "B")).await;
    v1.received();

    b.conn
        .handle_rtc_event(RtcEvent::Track(MediaTrack::video("video0", "B")))
        .await;

    assert_eq!(v1.session.track_ids(), vec!["video0".to_string()]);
    let offers = v1.received();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0]["sdp"]["type"], "offer");
}

#[tokio::test]
async fn second_publisher_connection_reaches_existing_viewers() {
    let relay = Relay::new();
    let _b1 = relay.connected_publisher("B").await;
    let mut v1 = relay.connect("V1", Role::Viewer, None).await;
    v1.send(view(false, "B")).await;
    assert_eq!(relay.edges_of("V1", Role::Viewer), (0, 1));

    let mut b2 = relay.connect("B", Role::Publisher, None).await;
    assert_eq!(relay.edges_of("V1", Role::Viewer), (0, 2));

    b2.conn
        .handle_rtc_event(RtcEvent::Track(MediaTrack::video("cam2", "B")))
        .await;
    assert_eq!(v1.session.track_ids(), vec!["cam2".to_string()]);
}

#[tokio::test]
async fn viewer_opened_with_owner_receives_tracks_immediately() {
    let relay = Relay::new();
    let mut b = relay.connected_publisher("B").await;
    b.conn
        .handle_rtc_event(RtcEvent::Track(MediaTrack::video("video0", "B")))
        .await;

    let v1 = relay.connect("V1", Role::Viewer, Some("B")).await;

    assert_eq!(v1.session.track_ids(), vec!["video0".to_string()]);
    assert_eq!(relay.edges_of("V1", Role::Viewer), (0, 0));
}

#[tokio::test]
async fn failed_viewer_session_edges_are_swept_once() {
    let relay = Relay::new();
    let mut b = relay.connected_publisher("B").await;
    let mut v1 = relay.connect("V1", Role::Viewer, None).await;
    v1.send(view(false, "B")).await;
    b.received();

    v1.session.set_state(SessionState::Failed);

    assert_eq!(relay.broker.cleanup_dangling_edges(), 2);
    assert_eq!(relay.broker.cleanup_dangling_edges(), 0);
    assert_eq!(relay.edges_of("B", Role::Publisher), (0, 0));
    assert_eq!(relay.edges_of("V1", Role::Viewer), (0, 0));
}

#[tokio::test]
async fn viewer_disconnect_updates_publisher_count() {
    let relay = Relay::new();
    let mut b = relay.connected_publisher("B").await;
    let mut v1 = relay.connect("V1", Role::Viewer, None).await;
    v1.send(view(false, "B")).await;
    b.received();

    v1.conn.handle_transport_closed().await;

    assert_eq!(b.received(), vec![viewers_info(0)]);
    assert!(relay.broker.snapshot().iter().all(|p| p.id != "V1"));
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let relay = Relay::new();
    let b = relay.connected_publisher("B").await;
    let v1 = relay.connect("V1", Role::Viewer, None).await;

    relay.broker.shutdown().await;

    assert!(b.session.is_closed());
    assert!(v1.session.is_closed());
    assert!(relay.broker.snapshot().is_empty());
}
