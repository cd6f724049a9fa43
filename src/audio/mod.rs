//! # Audio Handling Module
//!
//! The two file-based stages in front of the backend recognizer.
//!
//! ## Key Components:
//! - **Storage Writer**: writes each upload to its own uniquely named file under the
//!   input directory (`input-HHMMSSffffff-N.wav`)
//! - **Transcoder Invoker**: runs the external sample-rate converter on that file and
//!   checks it produced a usable output (`8k_input-...wav` next to the input)
//!
//! Neither stage inspects the audio itself; format conversion is the converter's job.
//! Both files are kept on disk after the request finishes.

pub mod storage; // Upload persistence
pub mod transcoder; // External converter invocation

pub use storage::StorageWriter;
pub use transcoder::TranscoderInvoker;
