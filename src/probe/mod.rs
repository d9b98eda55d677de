pub mod codec;
pub mod payload;
pub mod rtcp;
pub mod socket;
pub mod vad;

pub use codec::{Codec, CodecSpec};
pub use payload::{Echo, PayloadBuilder, extend_rtp_sequence, parse_echo};
pub use rtcp::SenderReport;
pub use socket::{create_probe_socket, derive_source_port, is_timeout};
pub use vad::VadSimulator;
