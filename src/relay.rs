use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::latency::{is_same_lan, Echo, LatencyRound};
use crate::signaling::{AnswerData, CandidateData, ChannelSender, Envelope, OfferData};
use crate::storage::{LatencyResult, LatencyStore};

/// Public STUN servers used for every probe connection. No TURN: probes that
/// cannot traverse NAT simply fail and the client retries elsewhere.
const STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Control string that (re)starts a latency round on the data channel.
const LATENCY_TEST_COMMAND: &str = "latency-test";

/// One remote peer's negotiation, exclusively owned by the relay registry.
struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    client_id: String,
    region: String,
}

/// Registry of peer sessions keyed by coordinator-supplied peer id. Routes
/// inbound signaling events to the right session and re-emits local
/// description/candidate events back over the control channel.
pub struct SignalingRelay {
    sessions: Arc<Mutex<HashMap<String, PeerSession>>>,
    store: LatencyStore,
}

impl SignalingRelay {
    pub fn new(store: LatencyStore) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            store,
        }
    }

    /// Dispatch one inbound signaling envelope. Malformed or unroutable
    /// events are logged and dropped; nothing here may take down the relay.
    pub async fn handle(&self, event: &str, data: Value, out: &ChannelSender) {
        let result = match event {
            "offer" => self.handle_offer(data, out).await,
            "answer" => self.handle_answer(data).await,
            "candidate" => self.handle_candidate(data).await,
            other => {
                warn!(event = other, "unroutable signaling event");
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!(event, error = %err, "dropped signaling event");
        }
    }

    async fn handle_offer(&self, data: Value, out: &ChannelSender) -> Result<()> {
        let offer: OfferData =
            serde_json::from_value(data).context("offer is missing required fields")?;

        let pc = self.create_peer_connection(&offer, out).await?;
        if let Err(err) = answer_offer(&pc, &offer, out).await {
            let _ = pc.close().await;
            return Err(err);
        }

        let displaced = {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(
                offer.peer_id.clone(),
                PeerSession {
                    pc,
                    client_id: offer.client_id.clone(),
                    region: offer.region.clone(),
                },
            )
        };

        // A repeated offer for the same peer id replaces the session; the
        // displaced connection must be released, not just forgotten.
        if let Some(old) = displaced {
            debug!(peer_id = %offer.peer_id, client_id = %old.client_id, "replacing peer session");
            tokio::spawn(async move {
                let _ = old.pc.close().await;
            });
        }

        Ok(())
    }

    async fn handle_answer(&self, data: Value) -> Result<()> {
        let answer: AnswerData = serde_json::from_value(data).context("malformed answer")?;
        let Some(pc) = self.peer_connection(&answer.peer_id).await else {
            // The remote peer may have retried after a local timeout.
            debug!(peer_id = %answer.peer_id, "answer for unknown peer dropped");
            return Ok(());
        };

        let description = RTCSessionDescription::answer(answer.description)?;
        pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn handle_candidate(&self, data: Value) -> Result<()> {
        let candidate: CandidateData = serde_json::from_value(data).context("malformed candidate")?;
        let Some(pc) = self.peer_connection(&candidate.peer_id).await else {
            debug!(peer_id = %candidate.peer_id, "candidate for unknown peer dropped");
            return Ok(());
        };

        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.signal.candidate.candidate,
            sdp_mid: candidate.signal.candidate.sdp_mid,
            sdp_mline_index: None,
            username_fragment: None,
        })
        .await?;
        Ok(())
    }

    async fn peer_connection(&self, peer_id: &str) -> Option<Arc<RTCPeerConnection>> {
        let sessions = self.sessions.lock().await;
        sessions.get(peer_id).map(|session| session.pc.clone())
    }

    async fn create_peer_connection(
        &self,
        offer: &OfferData,
        out: &ChannelSender,
    ) -> Result<Arc<RTCPeerConnection>> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        wire_candidate_events(&pc, offer, out);
        wire_latency_channel(&pc, offer, self.store.clone());
        self.wire_eviction(&pc, &offer.peer_id);

        Ok(pc)
    }

    /// Evict the session once its connection reaches a terminal state, so the
    /// registry does not accumulate dead negotiations. Only the entry that
    /// still owns this exact connection is removed; a newer offer for the
    /// same peer id stays untouched.
    fn wire_eviction(&self, pc: &Arc<RTCPeerConnection>, peer_id: &str) {
        let sessions = self.sessions.clone();
        let peer_id = peer_id.to_string();
        let pc_weak = Arc::downgrade(pc);

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sessions = sessions.clone();
            let peer_id = peer_id.clone();
            let pc_weak = pc_weak.clone();
            Box::pin(async move {
                if !matches!(
                    state,
                    RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
                ) {
                    return;
                }
                let Some(pc) = pc_weak.upgrade() else {
                    return;
                };

                let evicted = {
                    let mut sessions = sessions.lock().await;
                    match sessions.get(&peer_id) {
                        Some(session) if Arc::ptr_eq(&session.pc, &pc) => sessions.remove(&peer_id),
                        _ => None,
                    }
                };

                if let Some(session) = evicted {
                    debug!(%peer_id, region = %session.region, ?state, "evicted terminated peer session");
                    let _ = pc.close().await;
                }
            })
        }));
    }

    #[cfg(test)]
    pub(crate) async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Apply the remote offer and send our answer back over the control channel,
/// tagged with the same peer and client identifiers.
async fn answer_offer(
    pc: &Arc<RTCPeerConnection>,
    offer: &OfferData,
    out: &ChannelSender,
) -> Result<()> {
    let remote = RTCSessionDescription::offer(offer.signal.sdp.clone())?;
    pc.set_remote_description(remote).await?;

    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer).await?;
    let local = pc
        .local_description()
        .await
        .context("no local description after creating answer")?;

    let envelope = Envelope::new(
        "answer",
        json!({
            "peerId": offer.peer_id,
            "clientId": offer.client_id,
            "type": "answer",
            "signal": { "type": "answer", "sdp": local.sdp },
        }),
    );
    let _ = out.send(envelope);
    Ok(())
}

/// Re-emit locally gathered ICE candidates as `candidate` envelopes.
fn wire_candidate_events(pc: &Arc<RTCPeerConnection>, offer: &OfferData, out: &ChannelSender) {
    let out = out.clone();
    let peer_id = offer.peer_id.clone();
    let client_id = offer.client_id.clone();

    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let out = out.clone();
        let peer_id = peer_id.clone();
        let client_id = client_id.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(err) => {
                    warn!(error = %err, "unable to serialize local candidate");
                    return;
                }
            };

            let envelope = Envelope::new(
                "candidate",
                json!({
                    "peerId": peer_id,
                    "clientId": client_id,
                    "type": "candidate",
                    "signal": {
                        "type": "candidate",
                        "candidate": { "candidate": init.candidate, "sdpMid": init.sdp_mid },
                    },
                }),
            );
            let _ = out.send(envelope);
        })
    }));
}

/// Serve the latency-measurement protocol on whatever data channel the probe
/// client opens.
fn wire_latency_channel(pc: &Arc<RTCPeerConnection>, offer: &OfferData, store: LatencyStore) {
    let probe_session_id = offer.probe_session_id.clone();
    let region = offer.region.clone();
    let pc_weak = Arc::downgrade(pc);

    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let store = store.clone();
        let probe_session_id = probe_session_id.clone();
        let region = region.clone();
        let pc_weak = pc_weak.clone();
        Box::pin(async move {
            let round = Arc::new(Mutex::new(LatencyRound::new()));
            let dc_weak = Arc::downgrade(&dc);

            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let round = round.clone();
                let store = store.clone();
                let probe_session_id = probe_session_id.clone();
                let region = region.clone();
                let pc_weak = pc_weak.clone();
                let dc_weak = dc_weak.clone();
                Box::pin(async move {
                    let Some(dc) = dc_weak.upgrade() else {
                        return;
                    };
                    handle_probe_message(
                        &dc,
                        &round,
                        &msg.data,
                        &store,
                        &probe_session_id,
                        &region,
                        &pc_weak,
                    )
                    .await;
                })
            }));
        })
    }));
}

async fn handle_probe_message(
    dc: &Arc<RTCDataChannel>,
    round: &Mutex<LatencyRound>,
    data: &[u8],
    store: &LatencyStore,
    probe_session_id: &str,
    region: &str,
    pc: &Weak<RTCPeerConnection>,
) {
    let text = String::from_utf8_lossy(data);

    let mut round = round.lock().await;
    if text == LATENCY_TEST_COMMAND {
        round.begin();
        if dc.send_text(String::new()).await.is_ok() {
            round.arm(Instant::now());
        }
        return;
    }

    // Anything else is the previous probe's echo.
    match round.on_echo(Instant::now()) {
        Echo::Idle => {}
        Echo::Pending => {
            if dc.send_text(String::new()).await.is_ok() {
                round.arm(Instant::now());
            }
        }
        Echo::Complete { average } => {
            drop(round);

            let is_lan = match pc.upgrade() {
                Some(pc) => selected_pair_is_lan(&pc).await.unwrap_or(false),
                None => false,
            };
            let result = LatencyResult {
                region: region.to_string(),
                latency: average,
                is_lan,
            };

            if let Err(err) = store.publish(probe_session_id, &result).await {
                warn!(probe_session_id, error = %err, "unable to publish latency result");
            }

            let envelope = Envelope::new("latency-results", json!(result));
            match serde_json::to_string(&envelope) {
                Ok(payload) => {
                    let _ = dc.send_text(payload).await;
                }
                Err(err) => warn!(error = %err, "unable to serialize latency results"),
            }
        }
    }
}

async fn selected_pair_is_lan(pc: &Arc<RTCPeerConnection>) -> Option<bool> {
    let pair = pc
        .sctp()
        .transport()
        .ice_transport()
        .get_selected_candidate_pair()
        .await?;
    Some(is_same_lan(&pair.local.address, &pair.remote.address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_relay() -> SignalingRelay {
        let store = LatencyStore::new("redis://127.0.0.1:6379/1").unwrap();
        SignalingRelay::new(store)
    }

    async fn probe_offer_sdp() -> String {
        let api = APIBuilder::new().build();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        let _dc = pc.create_data_channel("latency", None).await.unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        let _ = pc.close().await;
        offer.sdp
    }

    fn offer_payload(peer_id: &str, sdp: &str) -> Value {
        json!({
            "clientId": "client-1",
            "peerId": peer_id,
            "probeSessionId": "probe-1",
            "region": "eu-west",
            "signal": { "type": "offer", "sdp": sdp },
        })
    }

    #[tokio::test]
    async fn malformed_offer_creates_no_session() {
        let relay = test_relay();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for missing in ["clientId", "peerId", "probeSessionId", "region"] {
            let mut data = offer_payload("peer-1", "v=0");
            data.as_object_mut().unwrap().remove(missing);
            relay.handle("offer", data, &tx).await;
        }

        assert_eq!(relay.session_count().await, 0);
        assert!(rx.try_recv().is_err(), "no envelope should have been sent");
    }

    #[tokio::test]
    async fn repeated_offer_for_same_peer_keeps_one_session() {
        let relay = test_relay();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = probe_offer_sdp().await;
        let second = probe_offer_sdp().await;
        relay.handle("offer", offer_payload("peer-1", &first), &tx).await;
        relay
            .handle("offer", offer_payload("peer-1", &second), &tx)
            .await;

        assert_eq!(relay.session_count().await, 1);

        let mut answers = 0;
        while let Ok(envelope) = rx.try_recv() {
            if envelope.event == "answer" {
                answers += 1;
            }
        }
        assert_eq!(answers, 2, "each offer is answered");
    }

    #[tokio::test]
    async fn offers_for_distinct_peers_register_separately() {
        let relay = test_relay();
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = probe_offer_sdp().await;
        let second = probe_offer_sdp().await;
        relay.handle("offer", offer_payload("peer-1", &first), &tx).await;
        relay
            .handle("offer", offer_payload("peer-2", &second), &tx)
            .await;

        assert_eq!(relay.session_count().await, 2);
    }

    #[tokio::test]
    async fn events_for_unknown_peers_are_dropped() {
        let relay = test_relay();
        let (tx, _rx) = mpsc::unbounded_channel();

        relay
            .handle(
                "candidate",
                json!({
                    "peerId": "nobody",
                    "signal": { "candidate": { "candidate": "candidate:1 1 udp 1 10.0.0.1 50000 typ host", "sdpMid": "0" } },
                }),
                &tx,
            )
            .await;
        relay
            .handle(
                "answer",
                json!({ "peerId": "nobody", "description": "v=0" }),
                &tx,
            )
            .await;

        assert_eq!(relay.session_count().await, 0);
    }
}
