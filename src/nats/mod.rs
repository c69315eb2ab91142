pub mod client;
pub mod messages;

pub use client::{
    NatsClient, NatsEventSink, FILE_ACK_SUBJECT, FILE_READY_SUBJECT, STATE_CHANGED_SUBJECT,
};
pub use messages::{FileAckMessage, FileReadyMessage, StateChangedMessage};
