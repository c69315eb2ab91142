pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod nats;
pub mod recording;
pub mod session;

pub use audio::{CaptureDevice, ChunkWriter, CpalProvider, DeviceProvider, SyntheticProvider};
pub use config::Config;
pub use engine::{CaptureSettings, Engine, SessionOutcome, SessionState, SilenceStrategy, StatusReport};
pub use error::{AdtsError, CaptureError, StartError};
pub use events::{BroadcastSink, EventSink, FanoutSink, FileReady, RecorderEvent};
pub use http::{create_router, AppState};
pub use nats::{FileReadyMessage, NatsClient, NatsEventSink, StateChangedMessage};
pub use recording::{FinalizeResult, Finalizer, RecorderSettings, RecoveryReport, Supervisor};
pub use session::{SessionLock, SessionSnapshot, SessionStore};
