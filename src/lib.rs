//! sqlite-ai
//!
//! Local LLM sessions exposed as host database functions: model and context
//! management, sampler chains, embeddings, one-shot text generation and
//! stateful chat with streaming, plus chat persistence and an engine log.
//!
//! # Features
//!
//! - One [`Session`] per connection owning a model, a context, a sampler
//!   chain and up to [`session::MAX_ADAPTERS`] LoRA adapters
//! - `key=value` option strings with `strtol`/`strtod` number rules and
//!   context presets for embedding, chat and text generation
//! - Embeddings as little-endian `float32`, `float16`, `bfloat16`, `uint8`
//!   or `int8` blobs, or JSON arrays
//! - Chat turns that feed the engine only the new part of the formatted
//!   transcript, with a pull-based streaming cursor
//! - A typed function table ([`host::Extension`]) a database binding wraps
//! - A GGUF engine on `candle` (feature `candle`, enabled by default) and a
//!   deterministic mock engine for tests
//!
//! # Quick Start
//!
//! ## CLI Usage
//!
//! ```bash
//! # One-shot generation
//! sqlite-ai -m model.gguf generate "Once upon a time"
//!
//! # Interactive streaming chat
//! sqlite-ai -m model.gguf chat --system "You are terse."
//! ```
//!
//! ## Library Usage
//!
//! The host surface takes the same calls a database would issue:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use sqlite_ai::engine::candle::CandleBackend;
//! use sqlite_ai::host::{Extension, Value};
//!
//! fn main() -> sqlite_ai::Result<()> {
//!     let mut ext = Extension::new(Arc::new(CandleBackend::new()));
//!     ext.call("llm_model_load", &[Value::from("model.gguf")])?;
//!     ext.call("llm_context_create_chat", &[])?;
//!     ext.call("llm_chat_create", &[])?;
//!
//!     for row in ext.open_table("llm_chat", &[Value::from("Hello!")])? {
//!         print!("{}", row?[0].as_text().unwrap_or_default());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Session API
//!
//! Or drive a [`Session`] directly:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use sqlite_ai::engine::mock::MockBackend;
//! use sqlite_ai::{Session, CHAT_PRESET};
//!
//! let mut session = Session::new(Arc::new(MockBackend::new()));
//! session.load_model("mock://tiny", None).unwrap();
//! session.create_context(Some(CHAT_PRESET), None).unwrap();
//! session.chat_create().unwrap();
//! let reply = session.chat_respond("Hi there").unwrap();
//! assert_eq!(reply, "Hello from the mock model.");
//! ```

pub mod buffer;
pub mod chat;
pub mod cli;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod host;
pub mod log;
pub mod options;
pub mod quantize;
pub mod session;
pub mod textgen;

pub use chat::{ChatState, ChatStore, ChatStream, MemoryChatStore};
pub use embedding::Embedding;
pub use error::{Error, Result, ResultCode};
pub use host::{Extension, Value};
pub use log::{LogEntry, LogLevel, LogSink};
pub use options::{Options, CHAT_PRESET, EMBEDDING_PRESET, TEXTGEN_PRESET};
pub use session::{Sampler, Session};

/// Version string reported by `ai_version()`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
