//! # Backend Worker
//!
//! The recognizer backend is one external process started at boot. Every request
//! handler talks to it through the shared [`WorkerChannel`], which serializes the
//! line-delimited request/response protocol so concurrent callers never see each
//! other's results.

pub mod channel;

pub use channel::WorkerChannel;
