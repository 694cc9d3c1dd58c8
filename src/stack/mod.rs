//! Evaluation stack
//!
//! Frames for nested bundle/body/section/promise/iteration scopes. Each
//! frame owns its local tables; the inheritance flag controls whether
//! class lookups continue into the frame below.

pub mod frame;
pub mod ring_buffer;

pub use frame::{FrameData, StackFrame};
pub use ring_buffer::RingBuffer;
