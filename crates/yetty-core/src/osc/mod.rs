//! The card-control OSC surface: framing scanner, command grammar and the
//! dispatcher that applies commands to the card system.

pub mod command;
pub mod protocol;
pub mod scanner;

pub use command::{
    base64_decode, base64_encode, CardListEntry, CommandKind, OscCommand, OscCommandParser,
    OscResponse, VENDOR_ID,
};
pub use protocol::OscCardProtocol;
pub use scanner::{frame_body, OscScanner, ScannerState};
