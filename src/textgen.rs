//! One-shot text generation.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::chat::FragmentDecoder;
use crate::engine::{Batch, Model, Pos, SamplerStage, SeqId};
use crate::error::{Error, Result};
use crate::session::{Sampler, Session};

/// Prediction budget used when neither the context nor the call sets one.
pub const DEFAULT_N_PREDICT: u32 = 512;

/// Typical upper bound of the text of one token, used to size the output.
const MAX_TOKEN_TEXT_LEN: usize = 16;

const GEN_SEQ: SeqId = 0;

impl Session {
    /// Continues `text` until end of generation or until `n_predict`
    /// tokens have been produced.
    ///
    /// Without a context, one sized to the prompt plus the budget is
    /// created. Without configured sampler stages, a repetition penalty
    /// followed by greedy selection is used for this call only.
    pub fn generate_text(&mut self, text: &str, options: Option<&str>) -> Result<String> {
        let model = Arc::clone(self.model()?);

        let mut call = self.options.clone();
        if let Some(options) = options {
            call.parse(options);
        }
        let n_predict = match call.generation.n_predict {
            0 => DEFAULT_N_PREDICT,
            n => n,
        } as usize;

        let tokens = model
            .tokenize(text, true, true)
            .map_err(|e| Error::engine("tokenize", e))?;
        if tokens.is_empty() {
            return Err(Error::InvalidArgument(
                "The prompt produced no tokens.".to_string(),
            ));
        }
        let n_prompt = tokens.len();

        if self.context.is_none() {
            let n_ctx = (n_prompt + n_predict - 1) as u32;
            self.options.context.n_ctx = n_ctx;
            self.options.generation.n_predict = n_predict as u32;
            debug!(n_prompt, n_predict, n_ctx, "sizing context for generation");
        }
        self.ensure_context()?;

        let mut transient = if self.sampler.as_ref().map_or(true, Sampler::is_empty) {
            Some(self.default_generation_sampler(model.as_ref())?)
        } else {
            None
        };

        let ctx = self.context.as_mut().ok_or_else(Error::no_context)?;
        let sampler = match transient.as_mut() {
            Some(sampler) => sampler,
            None => self.sampler.as_mut().ok_or_else(Error::no_sampler)?,
        };

        let n_ctx = ctx.n_ctx() as usize;
        if n_prompt > n_ctx {
            return Err(Error::TooBig(format!(
                "Prompt too large for context: {} tokens require context_size >= {} (current context_size is {}).",
                n_prompt, n_prompt, n_ctx
            )));
        }
        ctx.memory_clear();
        if let Some(chat) = self.chat.as_mut() {
            chat.invalidate();
        }

        let mut output = Buffer::with_capacity((n_prompt + n_predict) * MAX_TOKEN_TEXT_LEN)?;
        let mut decoder = FragmentDecoder::new();

        // prompt, chunked by the batch size; only the last token needs logits
        let n_batch = ctx.n_batch().max(1) as usize;
        let n_chunks = (n_prompt + n_batch - 1) / n_batch;
        let mut n_pos: usize = 0;
        for (i, chunk) in tokens.chunks(n_batch).enumerate() {
            let batch = Batch::sequence(chunk, n_pos as Pos, GEN_SEQ, i + 1 == n_chunks)?;
            ctx.decode(&batch).map_err(|e| Error::engine("decode", e))?;
            n_pos += chunk.len();
        }

        let mut n_generated = 0;
        loop {
            let token = sampler.sample(&**ctx, -1)?;
            if model.is_eog(token) {
                break;
            }
            output.append_str(&decoder.push(&model.token_to_piece(token, true)))?;
            n_generated += 1;

            if n_generated >= n_predict {
                break;
            }
            if n_pos + 1 > n_ctx {
                warn!(n_ctx, n_generated, "context full, stopping generation");
                break;
            }
            let batch = Batch::sequence(&[token], n_pos as Pos, GEN_SEQ, true)?;
            ctx.decode(&batch).map_err(|e| Error::engine("decode", e))?;
            n_pos += 1;
        }
        output.append_str(&decoder.finish())?;

        debug!(n_prompt, n_generated, "text generated");
        Ok(output.to_string_lossy())
    }

    fn default_generation_sampler(&self, model: &dyn Model) -> Result<Sampler> {
        let mut sampler = self.new_sampler();
        sampler.add(
            SamplerStage::Penalties {
                last_n: 64,
                repeat: 1.1,
                freq: 0.0,
                present: 0.0,
            },
            Some(model),
        )?;
        sampler.add(SamplerStage::Greedy, Some(model))?;
        Ok(sampler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockBackend, MockConfig, MockStats};
    use crate::options::TEXTGEN_PRESET;

    fn session(reply: &str) -> (Session, Arc<MockStats>) {
        let backend = MockBackend::with_config(MockConfig {
            reply: reply.to_string(),
            ..MockConfig::default()
        });
        let stats = backend.stats();
        let mut s = Session::new(Arc::new(backend));
        s.load_model("mock://gen", None).unwrap();
        (s, stats)
    }

    #[test]
    fn sizes_context_from_prompt_and_budget() {
        let (mut s, _) = session("four");
        let out = s.generate_text("abc", Some("n_predict=10")).unwrap();
        assert_eq!(out, "four");
        assert_eq!(s.context_size().unwrap(), 4 + 10 - 1);
    }

    #[test]
    fn stops_at_prediction_budget() {
        let (mut s, _) = session("a much longer reply than the budget");
        s.create_context(Some(TEXTGEN_PRESET), Some("n_predict=5")).unwrap();
        let out = s.generate_text("prompt", None).unwrap();
        assert_eq!(out, "a muc");
    }

    #[test]
    fn default_sampler_is_transient() {
        let (mut s, stats) = session("ok");
        s.generate_text("hi", None).unwrap();
        assert_eq!(stats.chain_stages(), vec!["penalties", "greedy"]);
        assert!(!s.has_sampler());
    }

    #[test]
    fn configured_sampler_is_used() {
        let (mut s, stats) = session("ok");
        s.add_sampler_stage(SamplerStage::TopK { k: 40 }).unwrap();
        s.add_sampler_stage(SamplerStage::Dist { seed: 7 }).unwrap();
        assert_eq!(s.generate_text("hi", None).unwrap(), "ok");
        assert_eq!(stats.chain_stages(), vec!["top-k", "dist"]);
        assert_eq!(s.sampler().unwrap().stages().len(), 2);
    }

    #[test]
    fn long_prompts_are_chunked() {
        let (mut s, stats) = session("ok");
        s.create_context(None, Some("context_size=256,batch_size=16"))
            .unwrap();
        s.generate_text(&"x".repeat(40), None).unwrap();
        let sizes = stats.batch_sizes();
        assert_eq!(&sizes[..3], &[16, 16, 9]);
    }

    #[test]
    fn repeated_calls_reset_the_cache() {
        let (mut s, _) = session("same");
        let a = s.generate_text("hi", None).unwrap();
        let b = s.generate_text("hi", None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn prompt_larger_than_context_is_rejected() {
        let (mut s, _) = session("ok");
        s.create_context(None, Some("context_size=8")).unwrap();
        let err = s.generate_text("far too long for eight", None).unwrap_err();
        assert!(matches!(err, Error::TooBig(_)));
    }
}
