//! Version Negotiation
//!
//! Handles messages whose kind or declared size this software version does
//! not understand, and the sender side of the replies they produce.

use std::sync::Arc;

use crate::error::Result;
use crate::replication::protocol::{
    ConfirmError, ConfirmPayload, Message, MessageHeader, MessageKind, Status, UnknownForTestPayload,
    UnknownMessagePayload,
};
use crate::replication::sync::{Messenger, SyncOutcome};

/// Software version of this build, `major << 32 | minor << 16 | patch`
pub fn software_version() -> u64 {
    let part = |s: &str| s.parse::<u64>().unwrap_or(0);
    (part(env!("CARGO_PKG_VERSION_MAJOR")) << 32)
        | (part(env!("CARGO_PKG_VERSION_MINOR")) << 16)
        | part(env!("CARGO_PKG_VERSION_PATCH"))
}

/// What the receiver does with a message that declared more bytes than it
/// knows for the kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OversizedAction {
    /// Process the truncated copy
    Process,
    /// Drop it; the sender was told
    Rejected,
    /// Drop it and enter service mode
    ServiceMode,
}

fn unknown_payload(messenger: &Messenger, header: &MessageHeader) -> UnknownMessagePayload {
    UnknownMessagePayload {
        received_kind: header.kind,
        received_size: header.declared_size,
        version: messenger.version(),
    }
}

/// Reply to a message whose kind is not known here
pub fn reject_unknown_kind(messenger: &Arc<Messenger>, header: &MessageHeader) {
    tracing::warn!(
        "Unknown message kind 0x{:04x} ({} bytes) from peer",
        header.kind,
        header.declared_size
    );
    messenger.reply(Message::UnknownMsgType(unknown_payload(messenger, header)));
}

/// Tell the sender a request was larger than understood, through the
/// request's confirmation when it has one
fn reject_oversized(messenger: &Arc<Messenger>, header: &MessageHeader, kind: MessageKind) {
    if kind.confirm_for().is_some() {
        messenger.confirm(
            kind,
            ConfirmPayload {
                status: Status::Failed,
                err: ConfirmError::LargerMsgSize,
                ..Default::default()
            },
        );
    } else {
        messenger.reply(Message::UnknownMsgSize(unknown_payload(messenger, header)));
    }
}

/// Decide what to do with an oversized message and answer the sender
pub fn handle_oversized(messenger: &Arc<Messenger>, header: &MessageHeader, kind: MessageKind) -> OversizedAction {
    let local = crate::replication::protocol::size_for(kind);
    tracing::warn!(
        "{} declared {} bytes, {} known locally",
        kind,
        header.declared_size,
        local
    );

    if kind.tolerates_growth() {
        messenger.reply(Message::UnknownMsgSize(unknown_payload(messenger, header)));
        return OversizedAction::Process;
    }
    reject_oversized(messenger, header, kind);
    if kind.is_core_identity() {
        OversizedAction::ServiceMode
    } else {
        OversizedAction::Rejected
    }
}

/// The peer did not know a kind this node sent
pub fn on_unknown_type(messenger: &Messenger, payload: &UnknownMessagePayload) {
    messenger.record_peer_version(payload.version);
    let rejected = MessageKind::from_code(payload.received_kind);
    if rejected == Some(MessageKind::UnknownForTest) {
        tracing::debug!("Peer reported the negotiation probe as unknown");
        messenger.resolve_probe(ConfirmPayload {
            status: Status::Ok,
            err: ConfirmError::None,
            received_kind: payload.received_kind,
            version: payload.version,
        });
        return;
    }

    tracing::warn!(
        "Peer (version {:#x}) does not know message kind 0x{:04x}",
        payload.version,
        payload.received_kind
    );
    // Fail a caller still waiting on the rejected request
    if let Some(confirm) = rejected.and_then(MessageKind::confirm_for) {
        messenger.resolve(
            confirm,
            ConfirmPayload {
                status: Status::Failed,
                err: ConfirmError::UnknownMsgType,
                received_kind: payload.received_kind,
                version: payload.version,
            },
        );
    }
}

/// The peer received a message larger than it understands
pub fn on_unknown_size(messenger: &Messenger, payload: &UnknownMessagePayload) {
    messenger.record_peer_version(payload.version);
    tracing::warn!(
        "Peer (version {:#x}) truncated message kind 0x{:04x} of {} bytes",
        payload.version,
        payload.received_kind,
        payload.received_size
    );
}

/// Check that the peer answers an unknown kind with `UnknownMsgType`
pub async fn check_unknown_message_handling(messenger: &Messenger) -> Result<bool> {
    let probe = Message::UnknownForTest(UnknownForTestPayload {
        nonce: rand::random(),
    });
    match messenger.call(probe).await? {
        SyncOutcome::Confirmed(confirm) => Ok(confirm.status.is_ok()),
        SyncOutcome::Delivered | SyncOutcome::Unilateral => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_version_is_packed() {
        let version = software_version();
        assert_eq!(version >> 32, env!("CARGO_PKG_VERSION_MAJOR").parse::<u64>().unwrap());
        assert_eq!((version >> 16) & 0xFFFF, env!("CARGO_PKG_VERSION_MINOR").parse::<u64>().unwrap());
    }
}
