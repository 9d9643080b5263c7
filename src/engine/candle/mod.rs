//! GGUF llama-family models on `candle`.
//!
//! Weights are loaded with `candle_transformers`' quantized llama graph,
//! text goes through `shimmytok` and chat templates are rendered with
//! `minijinja`. Everything runs on the CPU.
//!
//! Not every engine capability exists here: encoder models, pooled
//! embeddings, grammar and infill sampling, and LoRA adapters are reported
//! as engine errors.

mod context;
mod loader;
mod sampling;
mod template;
mod tokenizer;

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use candle_core::quantized::gguf_file;
use candle_core::Device;
use candle_transformers::models::quantized_llama::ModelWeights;

use super::{
    Adapter, Backend, ChatMessage, Context, ContextParams, Model, ModelInfo, ModelParams,
    PoolingType, SamplerChain, Token,
};
use crate::log::EngineLogger;

pub use context::CandleContext;
pub use sampling::NativeSamplerChain;
use template::SpecialTokens;
use tokenizer::TokenizerWrapper;

const CHAT_TEMPLATE_KEY: &str = "tokenizer.chat_template";

#[derive(Debug, Clone, Copy, Default)]
pub struct CandleBackend;

impl CandleBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for CandleBackend {
    fn name(&self) -> &'static str {
        "candle"
    }

    fn load_model(
        &self,
        path: &str,
        params: &ModelParams,
        logger: EngineLogger,
    ) -> Result<Arc<dyn Model>> {
        let path = Path::new(path);
        if !path.is_file() {
            logger.error(&format!("failed to open {}: no such file", path.display()));
            bail!("no such file: {}", path.display());
        }
        if params.n_gpu_layers > 0 {
            logger.debug("running on CPU, gpu_layers is ignored");
        }

        let device = Device::Cpu;
        let loaded = loader::load(path, params, &device).map_err(|e| {
            logger.error(&format!("failed to load model: {:#}", e));
            e
        })?;

        let eot = loader::meta_u32(&loaded.metadata, "tokenizer.ggml.eot_token_id");
        let tokenizer = TokenizerWrapper::from_gguf(path, eot)?;

        let token_text = |key: &str| {
            loader::meta_u32(&loaded.metadata, key)
                .and_then(|id| loader::token_text(&loaded.metadata, id))
                .unwrap_or_default()
        };
        let special = SpecialTokens {
            bos_token: token_text("tokenizer.ggml.bos_token_id"),
            eos_token: token_text("tokenizer.ggml.eos_token_id"),
        };

        logger.info(&format!(
            "loaded {} ({} bytes, mmap = {})",
            loaded.info.description, loaded.info.size, params.use_mmap
        ));

        Ok(Arc::new(CandleModel {
            info: loaded.info,
            metadata: loaded.metadata,
            weights: loaded.weights,
            tokenizer,
            special,
            device,
        }))
    }

    fn new_sampler_chain(&self) -> Box<dyn SamplerChain> {
        Box::new(NativeSamplerChain::new())
    }
}

pub struct CandleModel {
    info: ModelInfo,
    metadata: Vec<(String, gguf_file::Value)>,
    weights: Option<ModelWeights>,
    tokenizer: TokenizerWrapper,
    special: SpecialTokens,
    device: Device,
}

impl Model for CandleModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn meta(&self, key: &str) -> Option<String> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| loader::render(v))
    }

    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Result<Vec<Token>> {
        // shimmytok always recognises special token text
        let ids = self.tokenizer.encode(text, add_special)?;
        Ok(ids.into_iter().map(|id| id as Token).collect())
    }

    fn token_to_piece(&self, token: Token, special: bool) -> Vec<u8> {
        if token < 0 {
            return Vec::new();
        }
        self.tokenizer
            .decode(&[token as u32], !special)
            .map(String::into_bytes)
            .unwrap_or_default()
    }

    fn is_eog(&self, token: Token) -> bool {
        token >= 0 && self.tokenizer.is_eog(token as u32)
    }

    fn chat_template(&self) -> Option<String> {
        loader::meta_string(&self.metadata, CHAT_TEMPLATE_KEY)
    }

    fn apply_chat_template(
        &self,
        template: Option<&str>,
        messages: &[ChatMessage],
        add_assistant: bool,
    ) -> Result<String> {
        let source = match template {
            Some(t) => t.to_string(),
            None => self
                .chat_template()
                .ok_or_else(|| anyhow!("the model has no chat template"))?,
        };
        template::render(&source, &self.special, messages, add_assistant)
    }

    fn new_context(
        &self,
        params: &ContextParams,
        logger: EngineLogger,
    ) -> Result<Box<dyn Context>> {
        let weights = self
            .weights
            .clone()
            .ok_or_else(|| anyhow!("model was loaded with vocab_only"))?;

        if params.embeddings {
            logger.error("pooled embeddings are not supported");
            bail!("embedding contexts are not supported by this engine");
        }

        let n_ctx_train = self.info.n_ctx_train.max(1) as u32;
        let requested = if params.n_ctx == 0 {
            n_ctx_train
        } else {
            params.n_ctx
        };
        if requested > n_ctx_train {
            logger.warn(&format!(
                "n_ctx ({}) > n_ctx_train ({}) -- possible training context overflow",
                requested, n_ctx_train
            ));
        }
        let n_ctx = requested.min(CandleContext::max_ctx());
        if n_ctx < requested {
            logger.warn(&format!("n_ctx clamped to {}", n_ctx));
        }
        let n_batch = params.n_batch.min(n_ctx).max(1);
        let n_ubatch = params.n_ubatch.min(n_batch).max(1);
        let pooling = match params.pooling_type {
            PoolingType::Unspecified => PoolingType::None,
            other => other,
        };

        logger.info(&format!(
            "context created: n_ctx = {}, n_batch = {}, n_ubatch = {}",
            n_ctx, n_batch, n_ubatch
        ));

        Ok(Box::new(CandleContext::new(
            weights,
            self.device.clone(),
            logger,
            n_ctx,
            n_batch,
            n_ubatch,
            pooling,
        )))
    }

    fn load_adapter(&self, path: &str) -> Result<Arc<dyn Adapter>> {
        bail!("cannot load adapter {}: LoRA is not supported by this engine", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_fail_to_load() {
        let err = CandleBackend::new()
            .load_model(
                "/nonexistent/model.gguf",
                &ModelParams::default(),
                EngineLogger::detached(),
            )
            .err()
            .unwrap();
        assert!(err.to_string().contains("no such file"));
    }
}
