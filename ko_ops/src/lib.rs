//! ABOUTME: Closed registry of named FFmpeg operations with argv templates
//! ABOUTME: Filter specs, sanitization, and the validate-resolve-execute machine

pub mod argv;
pub mod dispatcher;
pub mod filter;
pub mod ops;

pub use argv::Canvas;
pub use dispatcher::{Dispatcher, Invocation, InvocationOutcome, Toolchain};
pub use filter::FilterSpec;
pub use ops::{
    ApplyFilterParams, AudioFormat, ConcatParams, ExtensionPolicy, ExtractAudioParams,
    ExtractFrameParams, Fit, Operation, ReplaceAudioParams, ResizeParams, TrimParams,
};
