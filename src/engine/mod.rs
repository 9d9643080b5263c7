//! Capabilities the session layer needs from an inference engine.
//!
//! The session layer never performs inference itself. It drives a
//! [`Backend`] that can load a [`Model`], create [`Context`]s for it and
//! build [`SamplerChain`]s. Engine implementations report failures through
//! `anyhow`; the session layer names the failed operation when it turns them
//! into [`crate::Error`]s.
//!
//! Two implementations ship with the crate: [`mock::MockBackend`], a small
//! deterministic engine, and (behind the `candle` feature) a backend for GGUF
//! llama-family models.

pub mod batch;
pub mod mock;
pub mod params;
pub mod sampler;

#[cfg(feature = "candle")]
pub mod candle;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::log::EngineLogger;

pub use batch::Batch;
pub use params::{
    AttentionType, CacheType, ContextParams, EmbeddingType, FlashAttn, ModelParams, OptionEnum,
    PoolingType, RopeScalingType, SplitMode,
};
pub use sampler::{resolve_seed, SamplerStage, DEFAULT_SEED};

pub type Token = i32;
pub type Pos = i32;
pub type SeqId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Static facts about a loaded model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub description: String,
    /// Total size of all tensors in bytes.
    pub size: u64,
    pub n_params: u64,
    pub n_embd: i32,
    pub n_layer: i32,
    pub n_head: i32,
    pub n_ctx_train: i32,
    pub n_vocab: i32,
    pub has_encoder: bool,
    pub has_decoder: bool,
    pub is_recurrent: bool,
    pub cls_labels: Vec<String>,
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn load_model(
        &self,
        path: &str,
        params: &ModelParams,
        logger: EngineLogger,
    ) -> Result<Arc<dyn Model>>;

    fn new_sampler_chain(&self) -> Box<dyn SamplerChain>;
}

pub trait Model: Send + Sync {
    fn info(&self) -> &ModelInfo;

    /// GGUF metadata value rendered as text.
    fn meta(&self, key: &str) -> Option<String>;

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<Token>>;

    /// Raw bytes of one token. May be an incomplete UTF-8 sequence.
    fn token_to_piece(&self, token: Token, special: bool) -> Vec<u8>;

    fn is_eog(&self, token: Token) -> bool;

    fn chat_template(&self) -> Option<String>;

    /// Formats `messages` with `template` (or the model's own template when
    /// `None`), optionally followed by the assistant generation prompt.
    fn apply_chat_template(
        &self,
        template: Option<&str>,
        messages: &[ChatMessage],
        add_assistant: bool,
    ) -> Result<String>;

    fn new_context(&self, params: &ContextParams, logger: EngineLogger)
        -> Result<Box<dyn Context>>;

    fn load_adapter(&self, path: &str) -> Result<Arc<dyn Adapter>>;
}

pub trait Context: Send {
    fn n_ctx(&self) -> u32;
    fn n_batch(&self) -> u32;
    fn n_ubatch(&self) -> u32;
    fn pooling_type(&self) -> PoolingType;

    /// Whether this context keeps a KV cache between calls.
    fn has_memory(&self) -> bool;

    fn decode(&mut self, batch: &Batch) -> Result<()>;
    fn encode(&mut self, batch: &Batch) -> Result<()>;

    /// Logits for output row `i`; `-1` selects the last output.
    fn logits_ith(&self, i: i32) -> Option<&[f32]>;

    /// Pooled embedding of a whole sequence.
    fn embeddings_seq(&self, seq: SeqId) -> Option<&[f32]>;

    /// Removes cached positions `[p0, p1)` of `seq`. Negative bounds are open.
    fn memory_seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool;

    /// Largest cached position of `seq`, or -1 when the sequence is empty.
    fn memory_seq_pos_max(&self, seq: SeqId) -> Pos;

    fn memory_clear(&mut self);

    /// Replaces the active adapter set.
    fn set_adapters(&mut self, adapters: &[(Arc<dyn Adapter>, f32)]) -> Result<()>;
}

pub trait SamplerChain: Send {
    fn add(&mut self, stage: &SamplerStage, model: Option<&dyn Model>) -> Result<()>;

    /// Samples from output row `idx` of the last decode and accepts the
    /// result into the chain's state.
    fn sample(&mut self, ctx: &dyn Context, idx: i32) -> Result<Token>;

    fn reset(&mut self);
}

/// A loaded low-rank adapter.
pub trait Adapter: Send + Sync + fmt::Debug {
    fn path(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!(Role::parse("User"), Some(Role::User));
        assert_eq!(Role::parse("ASSISTANT"), Some(Role::Assistant));
        assert_eq!(Role::parse("tool"), None);
        assert_eq!(Role::System.to_string(), "system");
    }
}
