//! Wire Messages
//!
//! Protobuf messages exchanged between nodes and the master. The failure spec
//! travels as rendered definition text so the wire schema stays stable while
//! the `Spec` schema evolves.

use std::collections::HashMap;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireFailure {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub definition: ::prost::alloc::string::String,
    #[prost(enumeration = "WireFailureState", tag = "4")]
    pub current_state: i32,
    #[prost(enumeration = "WireFailureState", tag = "5")]
    pub expected_state: i32,
    #[prost(uint64, tag = "6")]
    pub generation: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireFailureState {
    Unknown = 0,
    Enabled = 1,
    Disabled = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireFailureList {
    #[prost(message, repeated, tag = "1")]
    pub failures: ::prost::alloc::vec::Vec<WireFailure>,
}

/// Current-state report sent by the node that owns `failure`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FailureReport {
    #[prost(string, tag = "1")]
    pub reporter_node_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub failure: ::core::option::Option<WireFailure>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeRegistration {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "2")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub sent_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeRef {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_wire_failure_encoding() {
        let msg = WireFailure {
            id: "test1".to_string(),
            node_id: "node1".to_string(),
            definition: "attacks: []\n".to_string(),
            current_state: WireFailureState::Enabled as i32,
            expected_state: WireFailureState::Disabled as i32,
            generation: 3,
        };
        let decoded = WireFailure::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unknown_enum_value_is_not_coerced() {
        assert!(WireFailureState::try_from(9999).is_err());
        assert_eq!(WireFailureState::try_from(2).ok(), Some(WireFailureState::Disabled));
    }
}
