//! Backend events to OpenAI-compatible streaming output
//!
//! - [`stream`]: the per-completion state machine
//! - [`tool_blocks`]: `<use_tool>` block scanning and withholding
//! - [`finish`]: finish reason precedence
//! - [`sse`]: frame encoding
//! - [`driver`]: the task that pumps a turn through the translator

pub mod driver;
pub mod finish;
pub mod sse;
pub mod stream;
pub mod tool_blocks;

pub use driver::{SseStream, stream_chat_completion};
pub use finish::FinishResolver;
pub use sse::SseFrame;
pub use stream::{Phase, Step, StreamAction, StreamOptions, StreamTranslator};
pub use tool_blocks::ToolBlockScanner;
