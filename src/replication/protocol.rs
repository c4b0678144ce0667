//! Replication Protocol
//!
//! Defines the wire protocol exchanged between the two nodes: one message
//! kind per operation, each with a fixed declared size derived from its
//! largest encodable payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use crate::database::state::ServiceModeReason;
use crate::database::tables::{
    ConfigEntry, GlobalInfo, GlobalInfoEntry, ObjectId, SystemDbHeader, TableEntry, TableType,
};
use crate::error::{Error, Result};

/// Entry ids carried by a commit for each of the user and object tables
pub const MAX_COMMIT_IDS: usize = 64;
/// Entry ids carried by a commit for the edge table
pub const MAX_COMMIT_EDGE_IDS: usize = 128;
/// Global info entries carried by a commit
pub const MAX_COMMIT_GLOBAL_INFO: usize = GlobalInfo::SLOTS;
/// Drives named by one connect request
pub const MAX_CONNECT_DRIVES: usize = 16;
/// Key handles carried by one key setup request
pub const MAX_KEY_HANDLES: usize = 8;

/// A message payload with a bounded encoding
pub trait WirePayload:
    Serialize + DeserializeOwned + Default + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
    /// The instance with the longest encoding
    fn largest() -> Self {
        Self::default()
    }
}

/// Result carried in confirmations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Status {
    #[default]
    Ok,
    Failed,
}

impl Status {
    pub fn from_result<T>(result: &Result<T>) -> Self {
        if result.is_ok() {
            Status::Ok
        } else {
            Status::Failed
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

/// Protocol-level reason attached to a confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConfirmError {
    #[default]
    None,
    /// Request declared more bytes than the receiver understands
    LargerMsgSize,
    /// Request named a different transaction than the one in progress
    DismatchTransaction,
    UnknownMsgType,
    /// No business handler registered for the command
    NoHandler,
}

impl fmt::Display for ConfirmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfirmError::None => "NONE",
            ConfirmError::LargerMsgSize => "LARGER_MSG_SIZE",
            ConfirmError::DismatchTransaction => "DISMATCH_TRANSACTION",
            ConfirmError::UnknownMsgType => "UNKNOWN_MSG_TYPE",
            ConfirmError::NoHandler => "NO_HANDLER",
        };
        f.write_str(name)
    }
}

/// Kind of configuration transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransactionType {
    #[default]
    User,
    System,
    Kms,
}

// ========== Boot / Configuration Push Payloads ==========

/// Passive node's request for a full configuration push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetConfigPayload {
    pub version: u64,
    /// Landing region size per table, indexed by `TableType::code() - 1`
    pub region_sizes: [u64; 6],
}

impl WirePayload for GetConfigPayload {}

/// One table entry pushed entry by entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TableEntryPush {
    pub table: TableType,
    pub index: u32,
    pub entry: ConfigEntry,
}

impl WirePayload for TableEntryPush {
    fn largest() -> Self {
        let entry = ConfigEntry::largest();
        Self {
            table: entry.table(),
            index: u32::MAX,
            entry,
        }
    }
}

/// End of a configuration push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConfigDonePayload {
    pub entries_sent: u64,
}

impl WirePayload for ConfigDonePayload {}

/// Passive node finished creating its objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PassiveInitDonePayload {
    pub status: Status,
    pub version: u64,
}

impl WirePayload for PassiveInitDonePayload {}

/// Announces one chunk of a bulk table copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TableChunkPayload {
    pub table: TableType,
    pub offset: u64,
    pub length: u64,
}

impl WirePayload for TableChunkPayload {}

/// System database header pushed to the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SystemDbHeaderPayload {
    /// Header size as known by the sender
    pub header_size: u32,
    pub version: u64,
    pub header: SystemDbHeader,
}

impl WirePayload for SystemDbHeaderPayload {}

/// Notifies the peer that this node entered service mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceModePayload {
    pub reason: ServiceModeReason,
    pub version: u64,
}

impl WirePayload for ServiceModePayload {}

/// Reply to a message the receiver could not interpret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UnknownMessagePayload {
    pub received_kind: u16,
    pub received_size: u32,
    pub version: u64,
}

impl WirePayload for UnknownMessagePayload {}

/// Probe used to check unknown-type handling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UnknownForTestPayload {
    pub nonce: u64,
}

impl WirePayload for UnknownForTestPayload {}

// ========== Confirmation Payload ==========

/// Application-level result of a replicated request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConfirmPayload {
    pub status: Status,
    pub err: ConfirmError,
    /// Code of the request being confirmed
    pub received_kind: u16,
    /// Software version of the confirming node
    pub version: u64,
}

impl WirePayload for ConfirmPayload {}

// ========== Transaction Payloads ==========

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransactionStartPayload {
    pub transaction_id: u64,
    pub job_number: u64,
    pub transaction_type: TransactionType,
}

impl WirePayload for TransactionStartPayload {}

/// Commit carries only entry ids for the large tables; global info goes in full
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransactionCommitPayload {
    pub transaction_id: u64,
    pub job_number: u64,
    pub user_entry_ids: Vec<u64>,
    pub object_entry_ids: Vec<u64>,
    pub edge_entry_ids: Vec<u64>,
    pub global_info: Vec<GlobalInfoEntry>,
}

impl WirePayload for TransactionCommitPayload {
    fn largest() -> Self {
        Self {
            transaction_id: u64::MAX,
            job_number: u64::MAX,
            user_entry_ids: vec![u64::MAX; MAX_COMMIT_IDS],
            object_entry_ids: vec![u64::MAX; MAX_COMMIT_IDS],
            edge_entry_ids: vec![u64::MAX; MAX_COMMIT_EDGE_IDS],
            global_info: vec![GlobalInfoEntry::largest(); MAX_COMMIT_GLOBAL_INFO],
        }
    }
}

/// Abort and invalidate name the transaction they end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransactionEndPayload {
    pub transaction_id: u64,
    pub job_number: u64,
}

impl WirePayload for TransactionEndPayload {}

// ========== Command Payloads ==========

/// Create or update a storage object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectConfigPayload {
    pub transaction_id: u64,
    pub object_id: ObjectId,
    pub class_id: u32,
    pub config: [u64; 16],
    pub user_data: [u64; 8],
}

impl WirePayload for ObjectConfigPayload {}

/// Destroy a storage object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectDestroyPayload {
    pub transaction_id: u64,
    pub object_id: ObjectId,
}

impl WirePayload for ObjectDestroyPayload {}

/// Create or destroy an edge between two objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EdgePayload {
    pub transaction_id: u64,
    pub client_id: ObjectId,
    pub client_index: u16,
    pub server_id: ObjectId,
    pub capacity: u64,
    pub offset: u64,
}

impl WirePayload for EdgePayload {}

/// Update one global setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GlobalInfoPayload {
    pub transaction_id: u64,
    pub info: GlobalInfo,
}

impl WirePayload for GlobalInfoPayload {
    fn largest() -> Self {
        Self {
            transaction_id: u64::MAX,
            info: GlobalInfoEntry::largest().info,
        }
    }
}

/// Make a committed table update visible
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TableCommitPayload {
    pub transaction_id: u64,
    pub table: TableType,
}

impl WirePayload for TableCommitPayload {}

/// Set up or rotate an object's encryption keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EncryptionKeysPayload {
    pub object_id: ObjectId,
    pub generation: u64,
    pub key_handles: [u64; MAX_KEY_HANDLES],
    pub count: u32,
}

impl WirePayload for EncryptionKeysPayload {}

/// Key handle of one drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DriveKeysPayload {
    pub object_id: ObjectId,
    pub drive_index: u32,
    pub key_handle: u64,
}

impl WirePayload for DriveKeysPayload {}

/// Reconnect drives after a key update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectDrivePayload {
    pub object_ids: [ObjectId; MAX_CONNECT_DRIVES],
    pub count: u32,
}

impl WirePayload for ConnectDrivePayload {}

fn wire_size<P: WirePayload>() -> usize {
    bincode::serialized_size(&P::largest()).unwrap_or(0) as usize
}

macro_rules! message_catalog {
    ($( $(#[$meta:meta])* $kind:ident = $code:literal => $payload:ty ),+ $(,)?) => {
        /// Message kinds and their stable wire codes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u16)]
        pub enum MessageKind {
            $( $(#[$meta])* $kind = $code ),+
        }

        impl MessageKind {
            /// Every kind this software version understands
            pub const ALL: &'static [MessageKind] = &[$( MessageKind::$kind ),+];

            pub fn from_code(code: u16) -> Option<Self> {
                match code {
                    $( $code => Some(MessageKind::$kind), )+
                    _ => None,
                }
            }

            pub fn code(self) -> u16 {
                self as u16
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( MessageKind::$kind => stringify!($kind) ),+
                }
            }

            fn encoded_size(self) -> usize {
                match self {
                    $( MessageKind::$kind => wire_size::<$payload>() ),+
                }
            }
        }

        /// Protocol messages exchanged between the nodes
        #[derive(Debug, Clone, PartialEq)]
        pub enum Message {
            $( $kind($payload) ),+
        }

        impl Message {
            pub fn kind(&self) -> MessageKind {
                match self {
                    $( Message::$kind(_) => MessageKind::$kind ),+
                }
            }

            /// Message of the given kind carrying its largest payload
            pub fn largest(kind: MessageKind) -> Self {
                match kind {
                    $( MessageKind::$kind => Message::$kind(<$payload as WirePayload>::largest()) ),+
                }
            }

            fn encode_body(&self) -> Result<Vec<u8>> {
                match self {
                    $( Message::$kind(payload) => Ok(bincode::serialize(payload)?) ),+
                }
            }

            fn decode_body(kind: MessageKind, body: &[u8]) -> Result<Self> {
                match kind {
                    $( MessageKind::$kind => Ok(Message::$kind(bincode::deserialize(body)?)) ),+
                }
            }
        }
    };
}

message_catalog! {
    // ========== Boot / Configuration Push ==========
    /// Passive asks the active node for its configuration
    GetConfig = 0x0001 => GetConfigPayload,
    /// One table entry of a push
    UpdateConfig = 0x0002 => TableEntryPush,
    /// End of a push, carrying the number of updates sent
    UpdateConfigDone = 0x0003 => ConfigDonePayload,
    /// Passive created its objects and is ready
    UpdateConfigPassiveInitDone = 0x0004 => PassiveInitDonePayload,
    /// Announces a bulk-copied table chunk
    UpdateConfigTable = 0x0005 => TableChunkPayload,
    UpdateConfigTableConfirm = 0x0006 => ConfirmPayload,
    UpdateSystemDbHeader = 0x0007 => SystemDbHeaderPayload,
    UpdateSystemDbHeaderConfirm = 0x0008 => ConfirmPayload,
    /// Sender entered service mode
    DbServiceMode = 0x0009 => ServiceModePayload,
    /// Reply to an unrecognized message kind
    UnknownMsgType = 0x000A => UnknownMessagePayload,
    /// Reply to a message larger than the receiver understands
    UnknownMsgSize = 0x000B => UnknownMessagePayload,
    /// Never handled by a receiver; probes unknown-type handling
    UnknownForTest = 0x000C => UnknownForTestPayload,

    // ========== Transactions ==========
    TransactionStart = 0x0100 => TransactionStartPayload,
    TransactionStartConfirm = 0x0101 => ConfirmPayload,
    TransactionCommit = 0x0102 => TransactionCommitPayload,
    TransactionCommitConfirm = 0x0103 => ConfirmPayload,
    TransactionAbort = 0x0104 => TransactionEndPayload,
    TransactionAbortConfirm = 0x0105 => ConfirmPayload,
    TransactionInvalidate = 0x0106 => TransactionEndPayload,
    TransactionInvalidateConfirm = 0x0107 => ConfirmPayload,

    // ========== Object Commands ==========
    CreatePvd = 0x0200 => ObjectConfigPayload,
    CreatePvdConfirm = 0x0201 => ConfirmPayload,
    UpdatePvd = 0x0202 => ObjectConfigPayload,
    UpdatePvdConfirm = 0x0203 => ConfirmPayload,
    DestroyPvd = 0x0204 => ObjectDestroyPayload,
    DestroyPvdConfirm = 0x0205 => ConfirmPayload,
    CreateVd = 0x0206 => ObjectConfigPayload,
    CreateVdConfirm = 0x0207 => ConfirmPayload,
    UpdateVd = 0x0208 => ObjectConfigPayload,
    UpdateVdConfirm = 0x0209 => ConfirmPayload,
    DestroyVd = 0x020A => ObjectDestroyPayload,
    DestroyVdConfirm = 0x020B => ConfirmPayload,
    CreateRaid = 0x020C => ObjectConfigPayload,
    CreateRaidConfirm = 0x020D => ConfirmPayload,
    UpdateRaid = 0x020E => ObjectConfigPayload,
    UpdateRaidConfirm = 0x020F => ConfirmPayload,
    DestroyRaid = 0x0210 => ObjectDestroyPayload,
    DestroyRaidConfirm = 0x0211 => ConfirmPayload,
    CreateLun = 0x0212 => ObjectConfigPayload,
    CreateLunConfirm = 0x0213 => ConfirmPayload,
    UpdateLun = 0x0214 => ObjectConfigPayload,
    UpdateLunConfirm = 0x0215 => ConfirmPayload,
    DestroyLun = 0x0216 => ObjectDestroyPayload,
    DestroyLunConfirm = 0x0217 => ConfirmPayload,
    CloneObject = 0x0218 => ObjectConfigPayload,
    CloneObjectConfirm = 0x0219 => ConfirmPayload,
    CreateEdge = 0x021A => EdgePayload,
    CreateEdgeConfirm = 0x021B => ConfirmPayload,
    DestroyEdge = 0x021C => EdgePayload,
    DestroyEdgeConfirm = 0x021D => ConfirmPayload,
    CreateExtentPool = 0x021E => ObjectConfigPayload,
    CreateExtentPoolConfirm = 0x021F => ConfirmPayload,
    DestroyExtentPool = 0x0220 => ObjectDestroyPayload,
    DestroyExtentPoolConfirm = 0x0221 => ConfirmPayload,
    CreateExtentPoolLun = 0x0222 => ObjectConfigPayload,
    CreateExtentPoolLunConfirm = 0x0223 => ConfirmPayload,
    DestroyExtentPoolLun = 0x0224 => ObjectDestroyPayload,
    DestroyExtentPoolLunConfirm = 0x0225 => ConfirmPayload,

    // ========== Global Setting Commands ==========
    UpdatePowerSave = 0x0300 => GlobalInfoPayload,
    UpdatePowerSaveConfirm = 0x0301 => ConfirmPayload,
    UpdateEncryptionMode = 0x0302 => GlobalInfoPayload,
    UpdateEncryptionModeConfirm = 0x0303 => ConfirmPayload,
    UpdateSpareConfig = 0x0304 => GlobalInfoPayload,
    UpdateSpareConfigConfirm = 0x0305 => ConfirmPayload,
    UpdateTimeThreshold = 0x0306 => GlobalInfoPayload,
    UpdateTimeThresholdConfirm = 0x0307 => ConfirmPayload,
    SetBgServiceFlag = 0x0308 => GlobalInfoPayload,
    SetBgServiceFlagConfirm = 0x0309 => ConfirmPayload,
    UpdateGlobalPvdConfig = 0x030A => GlobalInfoPayload,
    UpdateGlobalPvdConfigConfirm = 0x030B => ConfirmPayload,
    PauseEncryption = 0x030C => GlobalInfoPayload,
    PauseEncryptionConfirm = 0x030D => ConfirmPayload,
    CommitUpdateTable = 0x030E => TableCommitPayload,
    CommitUpdateTableConfirm = 0x030F => ConfirmPayload,

    // ========== Key Commands ==========
    SetupEncryptionKeys = 0x0400 => EncryptionKeysPayload,
    SetupEncryptionKeysConfirm = 0x0401 => ConfirmPayload,
    RekeyEncryptionKeys = 0x0402 => EncryptionKeysPayload,
    RekeyEncryptionKeysConfirm = 0x0403 => ConfirmPayload,
    UpdateDriveKeys = 0x0404 => DriveKeysPayload,
    UpdateDriveKeysConfirm = 0x0405 => ConfirmPayload,
    ConnectDrive = 0x0406 => ConnectDrivePayload,
    ConnectDriveConfirm = 0x0407 => ConfirmPayload,
}

impl MessageKind {
    fn in_paired_range(self) -> bool {
        matches!(self.code() >> 8, 0x01..=0x04)
    }

    /// Whether this kind is the confirmation of a request
    pub fn is_confirm(self) -> bool {
        match self {
            MessageKind::UpdateConfigTableConfirm | MessageKind::UpdateSystemDbHeaderConfirm => true,
            kind => kind.in_paired_range() && kind.code() & 1 == 1,
        }
    }

    /// Confirmation kind answering this request
    pub fn confirm_for(self) -> Option<MessageKind> {
        match self {
            MessageKind::UpdateConfigTable => Some(MessageKind::UpdateConfigTableConfirm),
            MessageKind::UpdateSystemDbHeader => Some(MessageKind::UpdateSystemDbHeaderConfirm),
            kind if kind.in_paired_range() && !kind.is_confirm() => {
                MessageKind::from_code(kind.code() + 1)
            }
            _ => None,
        }
    }

    pub fn is_transaction(self) -> bool {
        self.code() >> 8 == 0x01
    }

    /// Replicated configuration command routed to a business handler
    pub fn is_command(self) -> bool {
        matches!(self.code() >> 8, 0x02..=0x04) && !self.is_confirm()
    }

    /// Commands whose handler may run long; confirmed when it completes
    pub fn is_destroy(self) -> bool {
        matches!(
            self,
            MessageKind::DestroyPvd
                | MessageKind::DestroyVd
                | MessageKind::DestroyRaid
                | MessageKind::DestroyLun
                | MessageKind::DestroyEdge
                | MessageKind::DestroyExtentPool
                | MessageKind::DestroyExtentPoolLun
        )
    }

    /// Kinds whose payload shapes the persisted configuration itself
    pub fn is_core_identity(self) -> bool {
        matches!(
            self,
            MessageKind::UpdateConfig
                | MessageKind::UpdateConfigTable
                | MessageKind::UpdateSystemDbHeader
        )
    }

    /// Kinds still processed from a truncated copy when the sender declared
    /// more bytes than known locally; trailing fields added by newer senders
    /// are ignored.
    pub fn tolerates_growth(self) -> bool {
        self.is_confirm()
            || matches!(
                self,
                MessageKind::GetConfig
                    | MessageKind::UpdateConfigDone
                    | MessageKind::UpdateConfigPassiveInitDone
                    | MessageKind::DbServiceMode
                    | MessageKind::UnknownMsgType
                    | MessageKind::UnknownMsgSize
            )
    }
}

impl Message {
    /// Build the confirmation of kind `kind`; every confirm kind carries a
    /// [`ConfirmPayload`]
    pub fn confirm(kind: MessageKind, payload: ConfirmPayload) -> Result<Message> {
        if !kind.is_confirm() {
            return Err(Error::Protocol(format!("{} is not a confirmation", kind)));
        }
        Message::decode_body(kind, &bincode::serialize(&payload)?)
    }

    /// Payload of a confirmation message
    pub fn as_confirm(&self) -> Option<ConfirmPayload> {
        if !self.kind().is_confirm() {
            return None;
        }
        self.encode_body()
            .ok()
            .and_then(|body| bincode::deserialize(&body).ok())
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn size_table() -> &'static HashMap<MessageKind, usize> {
    static SIZES: OnceLock<HashMap<MessageKind, usize>> = OnceLock::new();
    SIZES.get_or_init(|| {
        MessageKind::ALL
            .iter()
            .map(|kind| (*kind, kind.encoded_size()))
            .collect()
    })
}

/// Declared wire size of a message kind
pub fn size_for(kind: MessageKind) -> usize {
    size_table().get(&kind).copied().unwrap_or_else(max_message_size)
}

/// Declared wire size for a raw kind code; unknown codes get the upper bound
pub fn size_for_code(code: u16) -> usize {
    match MessageKind::from_code(code) {
        Some(kind) => size_for(kind),
        None => {
            tracing::warn!("Size requested for unknown message kind 0x{:04x}", code);
            max_message_size()
        }
    }
}

/// Size of the largest message body; every pool buffer holds this much
pub fn max_message_size() -> usize {
    static MAX: OnceLock<usize> = OnceLock::new();
    *MAX.get_or_init(|| size_table().values().copied().max().unwrap_or(0))
}

/// Header preceding every message body on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Raw kind code, possibly unknown to this node
    pub kind: u16,
    /// Body size declared by the sender
    pub declared_size: u32,
}

impl MessageHeader {
    /// Header size in bytes
    pub const SIZE: usize = 6;

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.kind.to_le_bytes());
        bytes[2..6].copy_from_slice(&self.declared_size.to_le_bytes());
        bytes
    }

    /// Deserialize header from the front of a buffer
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            kind: u16::from_le_bytes([bytes[0], bytes[1]]),
            declared_size: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        })
    }

    pub fn known_kind(&self) -> Option<MessageKind> {
        MessageKind::from_code(self.kind)
    }
}

/// Encode a message with its registered declared size
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    encode_declared(message, size_for(message.kind()))
}

/// Encode a message declaring an explicit body size.
///
/// The body is zero-padded up to `declared_size`; a body that does not fit
/// is refused rather than truncated.
pub fn encode_declared(message: &Message, declared_size: usize) -> Result<Vec<u8>> {
    let kind = message.kind();
    let body = message.encode_body()?;
    if body.len() > declared_size {
        return Err(Error::PayloadTooLarge {
            kind: kind.name(),
            size: body.len(),
            limit: declared_size,
        });
    }
    let header = MessageHeader {
        kind: kind.code(),
        declared_size: declared_size as u32,
    };
    let mut bytes = Vec::with_capacity(MessageHeader::SIZE + declared_size);
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(&body);
    bytes.resize(MessageHeader::SIZE + declared_size, 0);
    Ok(bytes)
}

/// Decode a body that was copied into a local buffer
pub fn decode(kind: MessageKind, body: &[u8]) -> Result<Message> {
    Message::decode_body(kind, body)
}

/// Link frame header (length + checksum)
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Frame length
    pub length: u32,
    /// Frame checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Check a frame body against this header
    pub fn verify(&self, body: &[u8]) -> bool {
        crc32fast::hash(body) == self.checksum
    }
}
