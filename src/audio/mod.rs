pub mod adts;
pub mod backend;
pub mod chunk;
pub mod encoder;
pub mod microphone;
pub mod preroll;
pub mod synthetic;
pub mod vad;

pub use backend::{acquire, acquire_once, candidate_rates, CaptureDevice, DeviceProvider};
pub use chunk::ChunkWriter;
pub use encoder::{create_encoder, AacEncoder, PacketEncoder};
pub use microphone::CpalProvider;
pub use preroll::PreRollBuffer;
pub use synthetic::{Segment, SyntheticProvider};
pub use vad::VoiceActivityDetector;
