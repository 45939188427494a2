pub mod messages;
pub mod startup;

pub use messages::{
    BackendMessage, FieldDescription, FrontendMessage, ProtocolError, TransactionStatus,
};
pub use startup::{StartupAction, StartupPacket};
