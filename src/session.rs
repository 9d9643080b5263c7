//! Ownership of the model, context, sampler chain and adapter handles.
//!
//! Handles depend on each other: a context belongs to a model, adapters are
//! loaded for a model, a chat lives on a context. [`Session::close`] is the
//! single place that releases them in dependent-first order, and every
//! `free_*` call is idempotent.

use std::sync::Arc;

use tracing::{debug, info};

use crate::chat::ChatState;
use crate::engine::{
    Adapter, Backend, Context, Model, SamplerChain, SamplerStage, Token,
};
use crate::error::{Error, Result};
use crate::log::LogSink;
use crate::options::Options;

pub const MAX_ADAPTERS: usize = 8;

/// A sampler chain together with the stages it was built from.
pub struct Sampler {
    chain: Box<dyn SamplerChain>,
    stages: Vec<SamplerStage>,
}

impl Sampler {
    pub fn new(chain: Box<dyn SamplerChain>) -> Self {
        Self {
            chain,
            stages: Vec::new(),
        }
    }

    pub fn add(&mut self, stage: SamplerStage, model: Option<&dyn Model>) -> Result<()> {
        self.chain
            .add(&stage, model)
            .map_err(|e| Error::engine("sampler init", e))?;
        debug!(stage = stage.name(), position = self.stages.len(), "sampler stage added");
        self.stages.push(stage);
        Ok(())
    }

    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Samples output row `idx`. The chain must end in a selecting stage.
    pub fn sample(&mut self, ctx: &dyn Context, idx: i32) -> Result<Token> {
        match self.stages.last() {
            Some(last) if last.is_terminal() => {}
            Some(last) => {
                return Err(Error::Misuse(format!(
                    "The sampler chain must end with a greedy, dist or mirostat stage (last stage is '{}').",
                    last.name()
                )))
            }
            None => {
                return Err(Error::Misuse(
                    "The sampler chain is empty. Add a greedy or dist stage before generating."
                        .to_string(),
                ))
            }
        }
        self.chain
            .sample(ctx, idx)
            .map_err(|e| Error::engine("sample", e))
    }

    pub fn reset(&mut self) {
        self.chain.reset();
    }
}

#[derive(Debug, Clone)]
struct AdapterSlot {
    adapter: Arc<dyn Adapter>,
    scale: f32,
}

pub struct Session {
    backend: Arc<dyn Backend>,
    log: LogSink,
    pub(crate) options: Options,
    pub(crate) model: Option<Arc<dyn Model>>,
    model_path: Option<String>,
    pub(crate) context: Option<Box<dyn Context>>,
    pub(crate) sampler: Option<Sampler>,
    adapters: [Option<AdapterSlot>; MAX_ADAPTERS],
    pub(crate) chat: Option<ChatState>,
}

impl Session {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_log(backend, LogSink::new())
    }

    pub fn with_log(backend: Arc<dyn Backend>, log: LogSink) -> Self {
        Self {
            backend,
            log,
            options: Options::new(),
            model: None,
            model_path: None,
            context: None,
            sampler: None,
            adapters: Default::default(),
            chat: None,
        }
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Loads a model, releasing every handle held before.
    ///
    /// On failure the session is left without a model.
    pub fn load_model(&mut self, path: &str, options: Option<&str>) -> Result<()> {
        self.close();

        let mut parsed = Options::new();
        if let Some(options) = options {
            parsed.parse(options);
        }

        let model = self
            .backend
            .load_model(path, &parsed.model, self.log.logger())
            .map_err(|e| Error::LoadFailed {
                path: path.to_string(),
                message: format!("{:#}", e),
            })?;

        info!(
            path,
            backend = self.backend.name(),
            n_params = model.info().n_params,
            "model loaded"
        );
        self.options = parsed;
        self.model = Some(model);
        self.model_path = Some(path.to_string());
        Ok(())
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn model_path(&self) -> Option<&str> {
        self.model_path.as_deref()
    }

    pub fn model(&self) -> Result<&Arc<dyn Model>> {
        self.model.as_ref().ok_or_else(Error::no_model)
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    pub fn has_sampler(&self) -> bool {
        self.sampler.is_some()
    }

    pub fn has_chat(&self) -> bool {
        self.chat.is_some()
    }

    /// Releases the model together with its context and adapters.
    pub fn free_model(&mut self) {
        self.free_context();
        self.clear_adapter_slots();
        if self.model.take().is_some() {
            info!(path = ?self.model_path, "model freed");
        }
        self.model_path = None;
    }

    /// Releases the context and the chat that lives on it.
    pub fn free_context(&mut self) {
        self.chat = None;
        if self.context.take().is_some() {
            debug!("context freed");
        }
    }

    pub fn free_sampler(&mut self) {
        if self.sampler.take().is_some() {
            debug!("sampler freed");
        }
    }

    /// Releases everything in dependent-first order.
    pub fn close(&mut self) {
        self.free_sampler();
        self.free_model();
    }

    /// Replaces the context with one built from `preset` and `user` options
    /// layered over defaults. The model section of the options is kept.
    pub fn create_context(&mut self, preset: Option<&str>, user: Option<&str>) -> Result<()> {
        self.model()?;
        self.free_context();

        let mut options = self.options.rebased();
        if let Some(preset) = preset {
            options.parse(preset);
        }
        if let Some(user) = user {
            options.parse(user);
        }
        self.options = options;
        self.ensure_context()?;
        Ok(())
    }

    /// The current context, created from the current options if absent.
    pub fn ensure_context(&mut self) -> Result<&mut (dyn Context + 'static)> {
        if self.context.is_none() {
            let model = self.model.as_ref().ok_or_else(Error::no_model)?;
            let params = &self.options.context;
            let mut ctx = model
                .new_context(params, self.log.logger())
                .map_err(|e| Error::engine("context create", e))?;

            let active = self.active_adapters();
            if !active.is_empty() {
                ctx.set_adapters(&active)
                    .map_err(|e| Error::engine("adapter apply", e))?;
            }

            info!(
                n_ctx = ctx.n_ctx(),
                n_batch = ctx.n_batch(),
                n_ubatch = ctx.n_ubatch(),
                embeddings = params.embeddings,
                "context created"
            );
            self.context = Some(ctx);
        }
        self.context
            .as_deref_mut()
            .ok_or_else(Error::no_context)
    }

    pub fn context(&self) -> Result<&dyn Context> {
        self.context.as_deref().ok_or_else(Error::no_context)
    }

    pub fn context_size(&self) -> Result<u32> {
        Ok(self.context()?.n_ctx())
    }

    /// Number of positions currently cached for sequence 0.
    pub fn context_used(&self) -> Result<u32> {
        Ok((self.context()?.memory_seq_pos_max(0) + 1).max(0) as u32)
    }

    /// Starts a new, empty sampler chain, dropping the previous one.
    pub fn create_sampler(&mut self) {
        self.free_sampler();
        self.ensure_sampler();
    }

    pub fn ensure_sampler(&mut self) -> &mut Sampler {
        let backend = &self.backend;
        self.sampler
            .get_or_insert_with(|| Sampler::new(backend.new_sampler_chain()))
    }

    /// A fresh chain that is not attached to the session.
    pub(crate) fn new_sampler(&self) -> Sampler {
        Sampler::new(self.backend.new_sampler_chain())
    }

    pub fn sampler(&self) -> Option<&Sampler> {
        self.sampler.as_ref()
    }

    /// Appends a stage to the sampler chain, creating the chain if needed.
    pub fn add_sampler_stage(&mut self, stage: SamplerStage) -> Result<()> {
        if self.sampler.is_none() {
            self.ensure_sampler();
        }
        let model = self.model.as_deref();
        match self.sampler.as_mut() {
            Some(sampler) => sampler.add(stage, model),
            None => Err(Error::no_sampler()),
        }
    }

    /// Loads an adapter file for the current model and activates it.
    pub fn load_adapter(&mut self, path: &str, scale: f32) -> Result<usize> {
        let model = self.model()?;
        if self.adapters.iter().all(Option::is_some) {
            return Err(Error::CapacityExceeded { max: MAX_ADAPTERS });
        }
        let adapter = model
            .load_adapter(path)
            .map_err(|e| Error::engine("adapter load", e))?;
        self.push_adapter(adapter, scale)
    }

    /// Stores `adapter` in the first free slot and reapplies the active set.
    pub fn push_adapter(&mut self, adapter: Arc<dyn Adapter>, scale: f32) -> Result<usize> {
        let index = self
            .adapters
            .iter()
            .position(Option::is_none)
            .ok_or(Error::CapacityExceeded { max: MAX_ADAPTERS })?;
        info!(path = adapter.path(), scale, index, "adapter registered");
        self.adapters[index] = Some(AdapterSlot { adapter, scale });
        self.apply_adapters()?;
        Ok(index)
    }

    /// Drops every adapter and clears them from the context.
    pub fn free_adapters(&mut self) -> Result<()> {
        self.clear_adapter_slots();
        self.apply_adapters()
    }

    pub fn adapter_count(&self) -> usize {
        self.adapters.iter().flatten().count()
    }

    fn clear_adapter_slots(&mut self) {
        self.adapters.iter_mut().for_each(|slot| *slot = None);
    }

    fn active_adapters(&self) -> Vec<(Arc<dyn Adapter>, f32)> {
        self.adapters
            .iter()
            .flatten()
            .filter(|slot| slot.scale != 0.0)
            .map(|slot| (Arc::clone(&slot.adapter), slot.scale))
            .collect()
    }

    /// Clears the context's adapters and applies every live non-zero one.
    fn apply_adapters(&mut self) -> Result<()> {
        let active = self.active_adapters();
        if let Some(ctx) = self.context.as_mut() {
            ctx.set_adapters(&active)
                .map_err(|e| Error::engine("adapter apply", e))?;
        }
        Ok(())
    }

    /// Number of tokens `text` tokenizes into, special tokens included.
    pub fn count_tokens(&self, text: &str) -> Result<usize> {
        let tokens = self
            .model()?
            .tokenize(text, true, true)
            .map_err(|e| Error::engine("tokenize", e))?;
        Ok(tokens.len())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
