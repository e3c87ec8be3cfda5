//! Core runtime: chat streaming, turn orchestration, events, persistence,
//! and settings.

pub mod app;
pub mod chat_stream;
pub mod events;
pub mod gateway;
pub mod secrets;
pub mod settings;
pub mod store;
pub mod turn;
