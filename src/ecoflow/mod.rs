//! EcoFlow cloud protocol: a protobuf-shaped wire encoding, the outer
//! envelope of (optionally XOR-encrypted) headers, and the typed payloads
//! carried by the PowerOcean EMS.

pub mod frame;
pub mod payload;
pub mod wire;

pub use frame::{Frame, Header, Message};
pub use payload::{Dispatch, EmsMessage, Record, RecordCommon, Registry};
