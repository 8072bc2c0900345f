//! AI classifier client.
//!
//! Talks to OpenAI-compatible chat-completions endpoints and to the
//! Ollama native API. Endpoints come from the `OLLAMA_URL` spec
//! (`url|workers|model`, comma-separated); the protocol is auto-detected
//! on first use by probing `/v1/models` (OpenAI shape) then `/api/tags`
//! (Ollama shape), and cached for the process lifetime. Requests carry
//! per-request timeouts and retry with exponential backoff; on final
//! failure the chain receives an unavailable error and falls back to its
//! default.

pub mod client;
pub mod pool;

pub use client::{
    AiEndpoint, FileClassifyRequest, FileDecision, FolderActionRequest, FolderDecision, Protocol,
    TokenTotals,
};
pub use pool::AiPool;
