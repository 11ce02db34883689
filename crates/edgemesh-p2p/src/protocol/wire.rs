//! Wire messages, proto3-encoded.
//!
//! The structs are hand-written prost messages; the `tag` numbers are the
//! wire contract and must not be renumbered. Names are local convention.

use std::collections::HashMap;

/// Gossiped peer-store update. Published on the `route_table/0.2` topic.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PeerInfo {
    /// Base58 peer id of the node that originated this record.
    #[prost(string, tag = "1")]
    pub from: String,
    /// Full `/…/p2p/<id>` multiaddr strings.
    #[prost(string, repeated, tag = "2")]
    pub nodes: Vec<String>,
}

// ── Alive service ─────────────────────────────────────────────────────────────

/// Payload of the periodic `Hello` probe. The status is optional; an empty
/// probe is a pure liveness signal.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AliveStatus {
    #[prost(message, optional, tag = "1")]
    pub status: Option<AppStatus>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloReply {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

// ── Discovery service ─────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, prost::Message)]
pub struct FindPeersReq {
    /// Upper bound on returned peers; clamped server-side.
    #[prost(int64, tag = "1")]
    pub count: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FindPeersResp {
    /// Full `/…/p2p/<id>` multiaddr strings.
    #[prost(string, repeated, tag = "1")]
    pub nodes: Vec<String>,
}

// ── SyncApp service ───────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetDataRequest {
    #[prost(string, tag = "1")]
    pub data_hash: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PostPeerStatusRequest {
    #[prost(string, tag = "1")]
    pub node_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(map = "string, bytes", tag = "1")]
    pub data: HashMap<String, Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StatusResult {
    #[prost(string, tag = "1")]
    pub data: String,
}

/// Application-level node status, transported verbatim and never interpreted
/// by the overlay. The `guage` spelling is part of the wire contract.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AppStatus {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub startup_time: u64,
    #[prost(uint64, tag = "3")]
    pub uptime: u64,
    #[prost(uint64, tag = "4")]
    pub guage_height: u64,
    #[prost(uint64, tag = "5")]
    pub guage_max: u64,
    #[prost(string, tag = "6")]
    pub relay: String,
    #[prost(string, tag = "7")]
    pub node_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

/// Envelope for the three SyncApp calls over one protocol.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncAppRequest {
    #[prost(oneof = "sync_app_request::Call", tags = "1, 2, 3")]
    pub call: Option<sync_app_request::Call>,
}

pub mod sync_app_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Call {
        #[prost(message, tag = "1")]
        PostAppStatus(super::PostPeerStatusRequest),
        #[prost(message, tag = "2")]
        GetData(super::GetDataRequest),
        #[prost(message, tag = "3")]
        GetStatus(super::Empty),
    }
}

/// SyncApp reply. Server-streaming calls are carried as repeated batches
/// over the single response frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncAppResponse {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<StatusResult>,
    #[prost(message, repeated, tag = "2")]
    pub data: Vec<Data>,
    #[prost(message, optional, tag = "3")]
    pub status: Option<AppStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn peer_info_round_trips() {
        let msg = PeerInfo {
            from: "16Uiu2HAm".into(),
            nodes: vec!["/ip4/1.2.3.4/tcp/9/p2p/16Uiu2HAm".into()],
        };
        let bytes = msg.encode_to_vec();
        assert_eq!(PeerInfo::decode(bytes.as_slice()).unwrap(), msg);
    }

    #[test]
    fn app_status_field_numbers_are_stable() {
        // Field 2 (startup_time) as varint: tag byte 0x10.
        let msg = AppStatus {
            startup_time: 7,
            ..Default::default()
        };
        assert_eq!(msg.encode_to_vec(), vec![0x10, 0x07]);

        // Field 7 (node_id) as length-delimited: tag byte 0x3a.
        let msg = AppStatus {
            node_id: "n".into(),
            ..Default::default()
        };
        assert_eq!(msg.encode_to_vec(), vec![0x3a, 0x01, b'n']);
    }

    #[test]
    fn sync_app_envelope_round_trips() {
        let req = SyncAppRequest {
            call: Some(sync_app_request::Call::GetData(GetDataRequest {
                data_hash: "abc".into(),
            })),
        };
        let bytes = req.encode_to_vec();
        assert_eq!(SyncAppRequest::decode(bytes.as_slice()).unwrap(), req);
    }
}
