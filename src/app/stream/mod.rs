pub mod reframer;
pub mod session;

pub use reframer::NalReframer;
pub use session::{start_streaming, FrameStream, StreamRequest};
