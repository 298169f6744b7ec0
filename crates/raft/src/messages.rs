//! Messages exchanged between controllers

use fabric_command::CauseRegistry;
use fabric_mesh::{ContentType, HeaderKey, Message};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{ControllerResult, Error};

/// Encoded command forwarded to the leader
pub const NEW_LOG_ENTRY: ContentType = 2050;
/// Failure reply; see the `ERROR_CODE_*` constants
pub const ERROR_RESPONSE: ContentType = 2051;
/// Success reply, optionally carrying [`HEADER_INDEX`]
pub const SUCCESS_RESPONSE: ContentType = 2052;
/// [`AddPeerRequest`]
pub const ADD_PEER_REQUEST: ContentType = 2053;
/// [`RemovePeerRequest`]
pub const REMOVE_PEER_REQUEST: ContentType = 2054;
/// [`TransferLeadershipRequest`]
pub const TRANSFER_LEADERSHIP_REQUEST: ContentType = 2055;

pub(crate) const RAFT_VOTE: ContentType = 2060;
pub(crate) const RAFT_APPEND_ENTRIES: ContentType = 2061;
pub(crate) const RAFT_INSTALL_SNAPSHOT: ContentType = 2062;
pub(crate) const RAFT_RESPONSE: ContentType = 2063;

/// Applied index of a successful write
pub const HEADER_INDEX: HeaderKey = 10;
/// Error code of an [`ERROR_RESPONSE`]
pub const HEADER_ERROR_CODE: HeaderKey = 11;

/// Plain text failure
pub const ERROR_CODE_GENERIC: u32 = 0;
/// Body is a JSON encoded API error
pub const ERROR_CODE_API_ERROR: u32 = 1;
/// The receiver is not the leader; body names the leader when known
pub const ERROR_CODE_NOT_LEADER: u32 = 2;
/// The receiver knows no leader
pub const ERROR_CODE_NO_LEADER: u32 = 3;
/// The leader is at its in-flight apply ceiling
pub const ERROR_CODE_TOO_MANY_UPDATES: u32 = 4;
/// The cluster is read-only
pub const ERROR_CODE_READ_ONLY: u32 = 5;

/// Request to add or update a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPeerRequest {
    /// Member id
    pub id: String,
    /// Advertised address
    pub address: String,
    /// Whether the member votes
    pub is_voter: bool,
}

/// Request to remove a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovePeerRequest {
    /// Member id
    pub id: String,
}

/// Request to hand leadership to another voter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeadershipRequest {
    /// Target voter; any up-to-date voter when unset
    pub id: Option<String>,
}

/// Message of type `content_type` carrying `body` as CBOR
pub fn encode_message<T: Serialize>(
    content_type: ContentType,
    body: &T,
) -> ControllerResult<Message> {
    let mut buf = Vec::new();
    ciborium::into_writer(body, &mut buf)
        .map_err(|e| Error::Protocol(format!("failed to encode message body: {e}")))?;
    Ok(Message::new(content_type, buf))
}

pub(crate) fn decode_body<T: DeserializeOwned>(message: &Message) -> ControllerResult<T> {
    ciborium::from_reader(message.body.as_ref()).map_err(|e| {
        Error::Protocol(format!(
            "failed to decode body of message type {}: {e}",
            message.content_type
        ))
    })
}

/// Success reply
pub fn success_response(index: Option<u64>) -> Message {
    let reply = Message::new(SUCCESS_RESPONSE, Vec::new());
    match index {
        Some(index) => reply.with_u64_header(HEADER_INDEX, index),
        None => reply,
    }
}

/// Failure reply describing `err`
pub fn error_response(err: &Error) -> Message {
    let (code, body) = match err {
        Error::Api(api) | Error::Validation(api) => match api.to_json_bytes() {
            Ok(json) => (ERROR_CODE_API_ERROR, json),
            Err(_) => (ERROR_CODE_GENERIC, api.to_string().into_bytes()),
        },
        Error::NotLeader { leader } => (
            ERROR_CODE_NOT_LEADER,
            leader.clone().unwrap_or_default().into_bytes(),
        ),
        Error::NoLeader => (ERROR_CODE_NO_LEADER, err.to_string().into_bytes()),
        Error::TooManyUpdates => (ERROR_CODE_TOO_MANY_UPDATES, err.to_string().into_bytes()),
        Error::ReadOnly => (ERROR_CODE_READ_ONLY, err.to_string().into_bytes()),
        other => (ERROR_CODE_GENERIC, other.to_string().into_bytes()),
    };

    Message::new(ERROR_RESPONSE, body).with_u32_header(HEADER_ERROR_CODE, code)
}

/// Interpret a reply to a forwarded request.
///
/// Success yields the applied index, if the leader sent one. API errors are
/// rebuilt with `causes` so their structured cause survives the hop.
pub fn decode_reply(reply: &Message, causes: &CauseRegistry) -> ControllerResult<Option<u64>> {
    match reply.content_type {
        SUCCESS_RESPONSE => Ok(reply.u64_header(HEADER_INDEX)),
        ERROR_RESPONSE => Err(decode_error(reply, causes)),
        other => Err(Error::Protocol(format!(
            "unexpected reply of message type {other}"
        ))),
    }
}

fn decode_error(reply: &Message, causes: &CauseRegistry) -> Error {
    let code = reply.u32_header(HEADER_ERROR_CODE).unwrap_or(ERROR_CODE_GENERIC);
    match code {
        ERROR_CODE_API_ERROR => match causes.decode_json(&reply.body) {
            Ok(api) => Error::Api(api),
            Err(e) => Error::Protocol(format!("malformed api error in reply: {e}")),
        },
        ERROR_CODE_NOT_LEADER => {
            let leader = reply.body_text();
            Error::NotLeader {
                leader: (!leader.is_empty()).then_some(leader),
            }
        }
        ERROR_CODE_NO_LEADER => Error::NoLeader,
        ERROR_CODE_TOO_MANY_UPDATES => Error::TooManyUpdates,
        ERROR_CODE_READ_ONLY => Error::ReadOnly,
        code => Error::Remote {
            code,
            message: reply.body_text(),
        },
    }
}
