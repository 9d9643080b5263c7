use std::sync::Arc;

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::quantized_llama::{ModelWeights, MAX_SEQ_LEN};

use crate::engine::{Adapter, Batch, Context, PoolingType, Pos, SeqId};
use crate::log::EngineLogger;

/// One inference context over a private copy of the model weights.
///
/// The quantized llama graph keeps a single KV cache that can only grow or
/// start over, so partial sequence removal is refused and every batch must
/// continue exactly where the cache ends.
pub struct CandleContext {
    weights: ModelWeights,
    device: Device,
    logger: EngineLogger,
    n_ctx: u32,
    n_batch: u32,
    n_ubatch: u32,
    pooling: PoolingType,
    n_past: usize,
    logits: Vec<f32>,
}

impl CandleContext {
    pub fn new(
        weights: ModelWeights,
        device: Device,
        logger: EngineLogger,
        n_ctx: u32,
        n_batch: u32,
        n_ubatch: u32,
        pooling: PoolingType,
    ) -> Self {
        Self {
            weights,
            device,
            logger,
            n_ctx,
            n_batch,
            n_ubatch,
            pooling,
            n_past: 0,
            logits: Vec::new(),
        }
    }

    pub fn max_ctx() -> u32 {
        MAX_SEQ_LEN as u32
    }

    fn forward(&mut self, tokens: &[u32], pos: usize) -> Result<Vec<f32>> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.weights.forward(&input, pos)?;
        Ok(logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

impl Context for CandleContext {
    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn n_batch(&self) -> u32 {
        self.n_batch
    }

    fn n_ubatch(&self) -> u32 {
        self.n_ubatch
    }

    fn pooling_type(&self) -> PoolingType {
        self.pooling
    }

    fn has_memory(&self) -> bool {
        true
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            bail!("empty batch");
        }
        if batch.len() > self.n_batch as usize {
            bail!(
                "batch of {} tokens exceeds n_batch = {}",
                batch.len(),
                self.n_batch
            );
        }
        let pos0 = batch.pos[0] as usize;
        if pos0 != self.n_past {
            bail!(
                "batch starts at position {} but the cache ends at {}",
                pos0,
                self.n_past
            );
        }
        if self.n_past + batch.len() > self.n_ctx as usize {
            self.logger.warn("failed to find a memory slot for the batch");
            bail!("no memory slot (n_ctx = {})", self.n_ctx);
        }

        let tokens: Vec<u32> = batch.tokens.iter().map(|&t| t as u32).collect();

        // the causal mask is only built for a cache that starts empty
        if self.n_past == 0 {
            self.logits = self.forward(&tokens, 0)?;
        } else {
            for (i, &token) in tokens.iter().enumerate() {
                self.logits = self.forward(&[token], self.n_past + i)?;
            }
        }
        self.n_past += tokens.len();

        tracing::debug!(n_tokens = tokens.len(), n_past = self.n_past, "decoded batch");
        Ok(())
    }

    fn encode(&mut self, _batch: &Batch) -> Result<()> {
        self.logger.error("encoder models are not supported");
        bail!("encode is not supported by this engine")
    }

    fn logits_ith(&self, i: i32) -> Option<&[f32]> {
        // only the last position of a batch produces logits
        if self.logits.is_empty() || i < -1 {
            return None;
        }
        Some(&self.logits)
    }

    fn embeddings_seq(&self, _seq: SeqId) -> Option<&[f32]> {
        self.logger.error("pooled embeddings are not supported");
        None
    }

    fn memory_seq_rm(&mut self, _seq: SeqId, p0: Pos, p1: Pos) -> bool {
        let from = p0.max(0) as usize;
        let to = if p1 < 0 { usize::MAX } else { p1 as usize };
        if from >= self.n_past || to <= from {
            return true;
        }
        if from == 0 && to >= self.n_past {
            self.memory_clear();
            return true;
        }
        false
    }

    fn memory_seq_pos_max(&self, _seq: SeqId) -> Pos {
        self.n_past as Pos - 1
    }

    fn memory_clear(&mut self) {
        // the next forward at position 0 replaces the cached keys and values
        self.n_past = 0;
        self.logits.clear();
    }

    fn set_adapters(&mut self, adapters: &[(Arc<dyn Adapter>, f32)]) -> Result<()> {
        if adapters.is_empty() {
            return Ok(());
        }
        bail!("LoRA adapters are not supported by this engine")
    }
}
