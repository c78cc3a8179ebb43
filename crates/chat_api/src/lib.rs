//! Transport-only client for streamed chat completions.
//!
//! This crate builds completion requests, sends them, and decodes the
//! `data: `-framed event stream into [`StreamFrame`] values. It holds no
//! conversation state; threading ids and history live with the caller.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod headers;
pub mod payload;
pub mod retry;
pub mod sse;
pub mod url;

pub use auth::{AuthHeaders, AuthProvider, StaticBearerAuth, TokenFileAuth};
pub use client::{ByteStream, ChatApiClient, FrameStream};
pub use config::ChatApiConfig;
pub use error::ChatApiError;
pub use events::{ChatRole, FrameIds, StreamFrame};
pub use payload::{ChatMessage, ChatRequest};
pub use sse::FrameDecoder;
pub use reqwest::StatusCode;
pub use url::normalize_completions_url;
