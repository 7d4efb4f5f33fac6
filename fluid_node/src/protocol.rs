//! Anti-entropy wire messages.
//!
//! CBOR-encoded structs carried in length-delimited frames over TCP. A
//! session is one exchange: `PushRequest` → `PushReply`, then one
//! `BlobFrame` per missing hash in request order, closed by a `PushAck`
//! once the receiver has stored everything.

use minicbor::{CborLen, Decode, Encode};

/// Protocol identifier, for logs and future version negotiation.
pub const PROTOCOL: &str = "fluid/ae/1";

/// Summary of the initiating replica's blob store plus its inventory.
/// `count`/`size` drive the fast compare; the hash list is the precise
/// reconciliation set consulted only when the summaries differ.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(array)]
pub struct PushRequest {
    #[n(0)]
    pub count: u64,
    #[n(1)]
    pub size: u64,
    #[n(2)]
    pub hashes: Vec<String>,
}

#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(array)]
pub struct PushReply {
    /// True when the receiver wants nothing from this inventory.
    #[n(0)]
    pub sync: bool,
    #[n(1)]
    pub missing: Vec<String>,
}

/// One replicated blob.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(array)]
pub struct BlobFrame {
    #[n(0)]
    pub hash: String,
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub data: Vec<u8>,
}

/// Session close: how many blobs the receiver stored.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(array)]
pub struct PushAck {
    #[n(0)]
    pub received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_through_cbor() {
        let request = PushRequest {
            count: 3,
            size: 12_288,
            hashes: vec!["aaa".into(), "bbb".into(), "ccc".into()],
        };
        let bytes = minicbor::to_vec(&request).unwrap();
        let decoded: PushRequest = minicbor::decode(&bytes).unwrap();
        assert_eq!(decoded, request);

        let frame = BlobFrame {
            hash: "aaa".into(),
            data: vec![0, 1, 2, 255],
        };
        let bytes = minicbor::to_vec(&frame).unwrap();
        let decoded: BlobFrame = minicbor::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }
}
