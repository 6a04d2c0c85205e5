use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Tagged envelope carried in both directions on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Outbound half of the control channel. Peer-connection callbacks hold a
/// clone; sends after the socket died are dropped silently, matching the
/// fire-and-forget semantics of the channel.
pub type ChannelSender = mpsc::UnboundedSender<Envelope>;

/// SDP payload attached to `offer`/`answer` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpSignal {
    #[serde(rename = "type")]
    pub typ: String,
    pub sdp: String,
}

/// Inbound `offer` payload. All identifying fields are required; an offer
/// missing any of them is dropped by the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferData {
    pub client_id: String,
    pub peer_id: String,
    pub probe_session_id: String,
    pub region: String,
    pub signal: SdpSignal,
}

/// Inbound `answer` payload applied to an already-registered peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerData {
    pub peer_id: String,
    pub description: String,
}

/// Inbound `candidate` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateData {
    pub peer_id: String,
    pub signal: CandidateSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSignal {
    pub candidate: CandidateInit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
}

/// Averaged throughput for one network interface since the last telemetry
/// push, in bytes per second.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NicStats {
    pub name: String,
    pub rx: u64,
    pub tx: u64,
}

/// Telemetry payload pushed as a `message` envelope every ping interval.
/// Every field is collected independently; anything unavailable is simply
/// absent rather than failing the whole push.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(rename = "lanIP", skip_serializing_if = "Option::is_none")]
    pub lan_ip: Option<String>,
    #[serde(rename = "nodeIP", skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<String>,
    #[serde(rename = "publicIP", skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_stats: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_stats: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_cpu_pinning: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cs_build: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub network: Vec<NicStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_data_requires_all_identifiers() {
        let complete = json!({
            "clientId": "c1",
            "peerId": "p1",
            "probeSessionId": "s1",
            "region": "eu",
            "signal": {"type": "offer", "sdp": "v=0"},
        });
        assert!(serde_json::from_value::<OfferData>(complete).is_ok());

        for missing in ["clientId", "peerId", "probeSessionId", "region"] {
            let mut data = json!({
                "clientId": "c1",
                "peerId": "p1",
                "probeSessionId": "s1",
                "region": "eu",
                "signal": {"type": "offer", "sdp": "v=0"},
            });
            data.as_object_mut().unwrap().remove(missing);
            assert!(
                serde_json::from_value::<OfferData>(data).is_err(),
                "offer without {missing} should not parse"
            );
        }
    }

    #[test]
    fn node_status_omits_unavailable_fields() {
        let status = NodeStatus {
            node: "node-1".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["node"], "node-1");
        assert!(json.get("labels").is_none());
        assert!(json.get("publicIP").is_none());
        assert!(json.get("network").is_none());
    }
}
