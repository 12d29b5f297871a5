//! An iSCSI (RFC 3720) target protocol core
//!
//! This library implements the transport-independent half of an iSCSI
//! target: PDU parsing and serialization with CRC32C digests, the login
//! state machine with text key negotiation, full feature phase dispatch,
//! and SCSI command execution against pluggable block devices. Socket
//! handling stays outside; feed [`Connection`] the PDUs you read and send
//! back the PDUs it returns.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use iscsi_core::{Connection, ConnectionConfig};
//! use iscsi_core::scsi::MemoryBlockDevice;
//! use iscsi_core::task::{LogicalUnit, TaskRouter};
//!
//! # fn main() -> iscsi_core::Result<()> {
//! let router = Arc::new(TaskRouter::new());
//! router.register(
//!     0,
//!     Arc::new(LogicalUnit::new(Arc::new(MemoryBlockDevice::new(512, 2048)))),
//! );
//!
//! let config = ConnectionConfig {
//!     target_name: "iqn.2026-08.local:storage.disk1".to_string(),
//!     ..Default::default()
//! };
//! let mut connection = Connection::new(config, router);
//!
//! let inbound: Vec<u8> = todo!("read one PDU from your transport");
//! for response in connection.handle_bytes(&inbound)? {
//!     // write `response` back to the transport
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connection;
pub mod digest;
pub mod error;
pub mod pdu;
pub mod scsi;
pub mod serial;
pub mod session;
pub mod task;

pub use connection::{AuthMode, Connection, ConnectionConfig, Phase};
pub use digest::{DigestEngine, DigestType};
pub use error::{IscsiError, Result};
pub use pdu::{Opcode, ProtocolDataUnit};
pub use scsi::BlockDevice;
pub use session::{Session, SessionParams};
