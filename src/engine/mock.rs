//! Deterministic in-process engine.
//!
//! The mock engine has a byte-level vocabulary (token id = byte + 3, with
//! `<s>` = 1 and `</s>` = 2), answers every prompt with a scripted reply and
//! produces position-dependent pooled embeddings. It keeps real KV
//! bookkeeping (positions must be contiguous, the window is enforced) so the
//! session layer can be exercised end to end without model files.
//!
//! Only paths starting with `mock://` load.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    resolve_seed, Adapter, Backend, Batch, ChatMessage, Context, ContextParams, Model, ModelInfo,
    ModelParams, PoolingType, Pos, SamplerChain, SamplerStage, SeqId, Token,
};
use crate::log::EngineLogger;

pub const TOKEN_BOS: Token = 1;
pub const TOKEN_EOS: Token = 2;
const BYTE_OFFSET: Token = 3;
const N_VOCAB: usize = 256 + BYTE_OFFSET as usize;

pub fn byte_token(b: u8) -> Token {
    b as Token + BYTE_OFFSET
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub reply: String,
    pub n_embd: usize,
    pub n_ctx_train: u32,
    pub has_encoder: bool,
    pub has_decoder: bool,
    /// Whether contexts keep a KV cache (decoder) or not (encoder-only).
    pub memory: bool,
    /// Every pooled embedding is the zero vector.
    pub zero_embedding: bool,
    pub chat_template: Option<String>,
    pub cls_labels: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    /// The decode call (1-based, counted across the backend) that fails.
    pub fail_decode_at: Option<usize>,
}

impl Default for MockConfig {
    fn default() -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("general.architecture".to_string(), "mock".to_string());
        metadata.insert("general.name".to_string(), "Mock Byte Model".to_string());
        Self {
            reply: "Hello from the mock model.".to_string(),
            n_embd: 8,
            n_ctx_train: 2048,
            has_encoder: false,
            has_decoder: true,
            memory: true,
            zero_embedding: false,
            chat_template: Some(MOCK_TEMPLATE.to_string()),
            cls_labels: Vec::new(),
            metadata,
            fail_decode_at: None,
        }
    }
}

/// Name of the built-in role-tag template.
pub const MOCK_TEMPLATE: &str = "mock-role-tags";

/// Call counters shared by every handle created from one backend.
#[derive(Debug, Default)]
pub struct MockStats {
    pub models_loaded: AtomicUsize,
    pub contexts_created: AtomicUsize,
    pub decodes: AtomicUsize,
    pub encodes: AtomicUsize,
    pub samples: AtomicUsize,
    pub seq_removals: AtomicUsize,
    pub memory_clears: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    chain_stages: Mutex<Vec<&'static str>>,
    adapter_sets: Mutex<Vec<Vec<(String, f32)>>>,
}

impl MockStats {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Sizes of every decoded or encoded batch, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Stage names of the most recently built sampler chain.
    pub fn chain_stages(&self) -> Vec<&'static str> {
        self.chain_stages.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// The adapter set most recently applied to a context.
    pub fn active_adapters(&self) -> Vec<(String, f32)> {
        self.adapter_sets
            .lock()
            .ok()
            .and_then(|v| v.last().cloned())
            .unwrap_or_default()
    }

    pub fn adapter_applications(&self) -> usize {
        self.adapter_sets.lock().map(|v| v.len()).unwrap_or(0)
    }
}

#[derive(Clone, Default)]
pub struct MockBackend {
    config: Arc<MockConfig>,
    stats: Arc<MockStats>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config: Arc::new(config),
            stats: Arc::new(MockStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }

    pub fn config(&self) -> &MockConfig {
        &self.config
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn load_model(
        &self,
        path: &str,
        params: &ModelParams,
        logger: EngineLogger,
    ) -> Result<Arc<dyn Model>> {
        if !path.starts_with("mock://") {
            logger.error(&format!("failed to open {}: not a mock model", path));
            bail!("failed to open {}", path);
        }

        let n_embd = self.config.n_embd;
        let n_params = (N_VOCAB * n_embd) as u64;
        let info = ModelInfo {
            description: format!("mock {}M byte-level", n_params / 1000),
            size: n_params * 4,
            n_params,
            n_embd: n_embd as i32,
            n_layer: 2,
            n_head: 4,
            n_ctx_train: self.config.n_ctx_train as i32,
            n_vocab: N_VOCAB as i32,
            has_encoder: self.config.has_encoder,
            has_decoder: self.config.has_decoder,
            is_recurrent: false,
            cls_labels: self.config.cls_labels.clone(),
        };

        self.stats.models_loaded.fetch_add(1, Ordering::SeqCst);
        logger.info(&format!(
            "loaded mock model from {} (mmap = {}, gpu_layers = {})",
            path, params.use_mmap, params.n_gpu_layers
        ));

        Ok(Arc::new(MockModel {
            config: Arc::clone(&self.config),
            stats: Arc::clone(&self.stats),
            info,
        }))
    }

    fn new_sampler_chain(&self) -> Box<dyn SamplerChain> {
        Box::new(MockSamplerChain {
            stages: Vec::new(),
            seed: 0,
            rng: StdRng::seed_from_u64(0),
            stats: Arc::clone(&self.stats),
        })
    }
}

pub struct MockModel {
    config: Arc<MockConfig>,
    stats: Arc<MockStats>,
    info: ModelInfo,
}

impl Model for MockModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn meta(&self, key: &str) -> Option<String> {
        self.config.metadata.get(key).cloned()
    }

    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Result<Vec<Token>> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(TOKEN_BOS);
        }
        tokens.extend(text.bytes().map(byte_token));
        Ok(tokens)
    }

    fn token_to_piece(&self, token: Token, special: bool) -> Vec<u8> {
        match token {
            TOKEN_BOS if special => b"<s>".to_vec(),
            TOKEN_EOS if special => b"</s>".to_vec(),
            t if t >= BYTE_OFFSET && (t as usize) < N_VOCAB => vec![(t - BYTE_OFFSET) as u8],
            _ => Vec::new(),
        }
    }

    fn is_eog(&self, token: Token) -> bool {
        token == TOKEN_EOS
    }

    fn chat_template(&self) -> Option<String> {
        self.config.chat_template.clone()
    }

    fn apply_chat_template(
        &self,
        template: Option<&str>,
        messages: &[ChatMessage],
        add_assistant: bool,
    ) -> Result<String> {
        let template = template
            .map(str::to_string)
            .or_else(|| self.config.chat_template.clone());
        match template.as_deref() {
            Some(MOCK_TEMPLATE) | None => {}
            Some(other) => bail!("unsupported chat template '{}'", other),
        }

        let mut out = String::new();
        for message in messages {
            out.push_str("<|");
            out.push_str(message.role.as_str());
            out.push_str("|>");
            out.push_str(&message.content);
            out.push('\n');
        }
        if add_assistant {
            out.push_str("<|assistant|>");
        }
        Ok(out)
    }

    fn new_context(
        &self,
        params: &ContextParams,
        logger: EngineLogger,
    ) -> Result<Box<dyn Context>> {
        let n_ctx = if params.n_ctx == 0 {
            self.config.n_ctx_train
        } else {
            params.n_ctx
        };
        if n_ctx > self.config.n_ctx_train {
            logger.warn(&format!(
                "n_ctx ({}) > n_ctx_train ({}) -- possible training context overflow",
                n_ctx, self.config.n_ctx_train
            ));
        }
        let n_batch = params.n_batch.min(n_ctx).max(1);
        let n_ubatch = params.n_ubatch.min(n_batch).max(1);
        let pooling = match params.pooling_type {
            PoolingType::Unspecified => PoolingType::Mean,
            other => other,
        };

        self.stats.contexts_created.fetch_add(1, Ordering::SeqCst);
        logger.info(&format!(
            "context created: n_ctx = {}, n_batch = {}, n_ubatch = {}",
            n_ctx, n_batch, n_ubatch
        ));

        Ok(Box::new(MockContext {
            config: Arc::clone(&self.config),
            stats: Arc::clone(&self.stats),
            logger,
            n_ctx,
            n_batch,
            n_ubatch,
            pooling,
            embeddings: params.embeddings,
            cells: BTreeMap::new(),
            logits: Vec::new(),
            pooled: BTreeMap::new(),
            reply_pos: 0,
            predicted: None,
        }))
    }

    fn load_adapter(&self, path: &str) -> Result<Arc<dyn Adapter>> {
        if !path.starts_with("mock://") {
            bail!("failed to load adapter {}", path);
        }
        Ok(Arc::new(MockAdapter::for_path(path)))
    }
}

#[derive(Debug)]
pub struct MockAdapter {
    path: String,
}

impl MockAdapter {
    pub fn for_path(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }
}

impl Adapter for MockAdapter {
    fn path(&self) -> &str {
        &self.path
    }
}

pub struct MockContext {
    config: Arc<MockConfig>,
    stats: Arc<MockStats>,
    logger: EngineLogger,
    n_ctx: u32,
    n_batch: u32,
    n_ubatch: u32,
    pooling: PoolingType,
    embeddings: bool,
    cells: BTreeMap<SeqId, Vec<(Token, Pos)>>,
    logits: Vec<f32>,
    pooled: BTreeMap<SeqId, Vec<f32>>,
    reply_pos: usize,
    predicted: Option<Token>,
}

impl MockContext {
    fn used_cells(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }

    fn store(&mut self, batch: &Batch) -> Result<()> {
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
        if self.used_cells() + batch.len() > self.n_ctx as usize {
            self.logger
                .warn("failed to find a memory slot for the batch");
            bail!("no memory slot (n_ctx = {})", self.n_ctx);
        }

        for i in 0..batch.len() {
            let seq = batch.seq_id[i];
            let expected = self.pos_max(seq) + 1;
            if batch.pos[i] != expected {
                bail!(
                    "inconsistent sequence positions: seq {} expected {} got {}",
                    seq,
                    expected,
                    batch.pos[i]
                );
            }
            self.cells
                .entry(seq)
                .or_default()
                .push((batch.tokens[i], batch.pos[i]));
        }

        self.stats
            .batch_sizes
            .lock()
            .map_err(|_| anyhow!("stats poisoned"))?
            .push(batch.len());

        if self.embeddings {
            if let Some(i) = batch.output_index() {
                let seq = batch.seq_id[i];
                let vector = self.pool(seq);
                self.pooled.insert(seq, vector);
            }
        }
        Ok(())
    }

    fn pos_max(&self, seq: SeqId) -> Pos {
        self.cells
            .get(&seq)
            .and_then(|c| c.iter().map(|&(_, p)| p).max())
            .unwrap_or(-1)
    }

    fn pool(&self, seq: SeqId) -> Vec<f32> {
        let n_embd = self.config.n_embd;
        let mut out = vec![0.0f32; n_embd];
        if self.config.zero_embedding {
            return out;
        }
        let cells = match self.cells.get(&seq) {
            Some(c) if !c.is_empty() => c,
            _ => return out,
        };
        let selected: Vec<(Token, Pos)> = match self.pooling {
            PoolingType::Cls | PoolingType::Rank => vec![cells[0]],
            PoolingType::Last => vec![cells[cells.len() - 1]],
            _ => cells.clone(),
        };
        for &(token, pos) in &selected {
            for (j, v) in out.iter_mut().enumerate() {
                *v += token_feature(token, pos, j);
            }
        }
        let n = selected.len() as f32;
        out.iter_mut().for_each(|v| *v /= n);
        out
    }

    fn predict(&mut self, batch: &Batch) {
        let continued = batch.len() == 1 && self.predicted == Some(batch.tokens[0]);
        if continued {
            self.reply_pos += 1;
        } else {
            self.reply_pos = 0;
        }

        let next = self
            .config
            .reply
            .as_bytes()
            .get(self.reply_pos)
            .map(|&b| byte_token(b))
            .unwrap_or(TOKEN_EOS);
        self.predicted = Some(next);

        self.logits = (0..N_VOCAB).map(|i| ((i * 7) % 13) as f32 * 0.01).collect();
        self.logits[next as usize] = 100.0;
    }
}

/// Deterministic per-(token, position) feature.
fn token_feature(token: Token, pos: Pos, j: usize) -> f32 {
    let x = (token as f32) * 0.37 + (pos as f32) * 0.11 + (j as f32) * 0.53;
    x.sin()
}

impl Context for MockContext {
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
        self.config.memory
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        let n = self.stats.decodes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.fail_decode_at == Some(n) {
            self.logger.error("decode failed");
            bail!("decode call {} failed", n);
        }
        if !self.config.has_decoder {
            bail!("model has no decoder");
        }
        self.store(batch)?;
        if batch.output_index().is_some() {
            self.predict(batch);
        }
        Ok(())
    }

    fn encode(&mut self, batch: &Batch) -> Result<()> {
        self.stats.encodes.fetch_add(1, Ordering::SeqCst);
        self.store(batch)
    }

    fn logits_ith(&self, i: i32) -> Option<&[f32]> {
        if self.logits.is_empty() || i < -1 {
            return None;
        }
        Some(&self.logits)
    }

    fn embeddings_seq(&self, seq: SeqId) -> Option<&[f32]> {
        if !self.embeddings || self.pooling == PoolingType::None {
            return None;
        }
        self.pooled.get(&seq).map(Vec::as_slice)
    }

    fn memory_seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> bool {
        self.stats.seq_removals.fetch_add(1, Ordering::SeqCst);
        let lo = if p0 < 0 { Pos::MIN } else { p0 };
        let hi = if p1 < 0 { Pos::MAX } else { p1 };
        let targets: Vec<SeqId> = if seq < 0 {
            self.cells.keys().copied().collect()
        } else {
            vec![seq]
        };
        for s in targets {
            if let Some(cells) = self.cells.get_mut(&s) {
                cells.retain(|&(_, p)| p < lo || p >= hi);
            }
            self.pooled.remove(&s);
        }
        true
    }

    fn memory_seq_pos_max(&self, seq: SeqId) -> Pos {
        self.pos_max(seq)
    }

    fn memory_clear(&mut self) {
        self.stats.memory_clears.fetch_add(1, Ordering::SeqCst);
        self.cells.clear();
        self.pooled.clear();
        self.predicted = None;
        self.reply_pos = 0;
    }

    fn set_adapters(&mut self, adapters: &[(Arc<dyn Adapter>, f32)]) -> Result<()> {
        let applied = adapters
            .iter()
            .map(|(a, scale)| (a.path().to_string(), *scale))
            .collect();
        self.stats
            .adapter_sets
            .lock()
            .map_err(|_| anyhow!("stats poisoned"))?
            .push(applied);
        Ok(())
    }
}

/// Applies temperature stages and ends in an argmax or, for `dist`, a
/// seeded draw from the softmax. Other filtering stages are recorded only.
pub struct MockSamplerChain {
    stages: Vec<SamplerStage>,
    seed: u64,
    rng: StdRng,
    stats: Arc<MockStats>,
}

impl SamplerChain for MockSamplerChain {
    fn add(&mut self, stage: &SamplerStage, model: Option<&dyn Model>) -> Result<()> {
        if stage.needs_model() && model.is_none() {
            bail!("{} sampler requires a loaded model", stage.name());
        }
        if let SamplerStage::Dist { seed } = *stage {
            self.seed = resolve_seed(seed);
            self.rng = StdRng::seed_from_u64(self.seed);
        }
        self.stages.push(stage.clone());
        let names = self.stages.iter().map(SamplerStage::name).collect();
        *self
            .stats
            .chain_stages
            .lock()
            .map_err(|_| anyhow!("stats poisoned"))? = names;
        Ok(())
    }

    fn sample(&mut self, ctx: &dyn Context, idx: i32) -> Result<Token> {
        if self.stages.is_empty() {
            bail!("empty sampler chain");
        }
        let mut logits = ctx
            .logits_ith(idx)
            .ok_or_else(|| anyhow!("no logits for output {}", idx))?
            .to_vec();
        self.stats.samples.fetch_add(1, Ordering::SeqCst);

        for stage in &self.stages {
            match *stage {
                SamplerStage::Temp { t } | SamplerStage::TempExt { t, .. } if t > 0.0 => {
                    logits.iter_mut().for_each(|l| *l /= t)
                }
                SamplerStage::Dist { .. } => return Ok(draw(&logits, &mut self.rng)),
                ref s if s.is_terminal() => break,
                _ => {}
            }
        }
        Ok(argmax(&logits))
    }

    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
    }
}

fn argmax(logits: &[f32]) -> Token {
    let (best, _) = logits
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |acc, (i, &l)| {
            if l > acc.1 {
                (i, l)
            } else {
                acc
            }
        });
    best as Token
}

fn draw(logits: &[f32], rng: &mut StdRng) -> Token {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let mut target = rng.random::<f32>() * weights.iter().sum::<f32>();
    for (i, w) in weights.iter().enumerate() {
        if target < *w {
            return i as Token;
        }
        target -= w;
    }
    weights.len().saturating_sub(1) as Token
}
