pub mod audio;
pub mod codec;
pub mod upstream;

pub use audio::{AudioError, AudioRecorder, PlaybackQueue};
pub use codec::CodecError;
pub use upstream::{SessionSettings, UpstreamConfig, UpstreamError};
