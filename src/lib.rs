//! Confab is the backend orchestration core of a local desktop AI chat
//! client.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns turn orchestration: streaming chat decoding, the
//!   tool-call loop, progress events, persistence, settings, and secrets.
//! - [`mcp`] provides Model Context Protocol integration: three transports
//!   (stdio, streamable HTTP, legacy SSE), JSON-RPC correlation, and the
//!   server manager with its aggregate tool catalog.
//! - [`sandbox`] implements code mode: a synthesized workspace of tool
//!   wrapper modules, a per-execution loopback HTTP bridge, and bounded
//!   child-process execution.
//! - [`api`] defines the chat-gateway wire payloads.
//!
//! The GUI, the RPC dispatcher marshalling its requests, and the window
//! hosting are external collaborators; they drive this crate through
//! [`core::app::ChatCore`].

pub mod api;
pub mod core;
pub mod mcp;
pub mod sandbox;
