//! derecho — an LLM gateway proxy. Routes chat requests to inference
//! providers by model, multiplexes upstream SSE streams to many
//! subscribers, executes model-invoked tools mid-stream, persists completed
//! messages (optionally end-to-end encrypted), and polls background
//! Responses-API generations to completion.

pub mod cancel;
pub mod config;
pub mod error;
pub mod http;
pub mod persist;
pub mod poller;
pub mod responses;
pub mod router;
pub mod stream;
pub mod tools;
