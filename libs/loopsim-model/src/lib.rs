//! Shared data model for the LoopSim master and node services
//!
//! Contains the channel catalog (engineering-unit <-> milliamp
//! conversions, slot-to-pin resolution), the timestamped entry types
//! exchanged between the two sides, the framed packet codec, and the
//! master configuration file schema.

pub mod channel;
pub mod config;
pub mod entry;
pub mod packet;

pub use channel::{Channel, ChannelCatalog, ChannelKind};
pub use config::{MasterConfig, RuntimeSettings, SignalRecord};
pub use entry::{epoch_now, DataEntry, EntryValue, ErrorEntry, Severity, SignalKind};
pub use packet::{DataPacket, PacketError, MSG_TYPE_DATA, MSG_TYPE_WRITE_REQUEST};
