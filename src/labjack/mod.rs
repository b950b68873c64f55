pub mod client;
pub mod interface;
pub mod protocol;
pub mod registers;
pub mod simulated;

pub use client::{ConnectionConfig, LabJackClient, LabJackClientBuilder};
pub use interface::{DaqChannels, DaqInterface};
pub use protocol::Protocol;
pub use simulated::{DaqJournal, DaqOp, SimulatedDaq};
