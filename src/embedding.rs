//! Embedding extraction.
//!
//! Input longer than one engine batch is fed in consecutive chunks whose
//! positions continue where the previous chunk stopped; only the final token
//! requests output. The working sequence is cleared before and after every
//! call so calls sharing a context never see each other's state.

use tracing::debug;

use crate::buffer::try_zeroed;
use crate::engine::{Batch, Context, PoolingType, Pos, SeqId, Token};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::quantize;
use crate::session::Session;

const EMBED_SEQ: SeqId = 0;

#[derive(Debug, Clone, PartialEq)]
pub enum Embedding {
    /// Little-endian elements of the requested type.
    Blob(Vec<u8>),
    Json(String),
}

impl Embedding {
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Embedding::Blob(b) => Some(b),
            Embedding::Json(_) => None,
        }
    }
}

impl Session {
    /// Embeds `text` with the current embedding context. `options` may
    /// override the output encoding and input ceiling for this call only.
    pub fn embed(&mut self, text: &str, options: Option<&str>) -> Result<Embedding> {
        let model = std::sync::Arc::clone(self.model()?);
        let info = model.info();
        if !info.has_decoder {
            return Err(Error::InvalidArgument(
                "Embedding generation requires a model with a decoder.".to_string(),
            ));
        }
        if info.has_encoder {
            return Err(Error::InvalidArgument(
                "Embedding generation is not supported for encoder-decoder models.".to_string(),
            ));
        }

        let mut call = self.options.clone();
        if let Some(options) = options {
            call.parse(options);
        }
        if !self.options.context.embeddings {
            return Err(Error::Misuse(
                "The current context was not created for embeddings. Please call llm_context_create_embedding() before using this function."
                    .to_string(),
            ));
        }

        let ctx = self.context.as_deref_mut().ok_or_else(Error::no_context)?;
        if ctx.pooling_type() == PoolingType::None {
            return Err(Error::Misuse(
                "Pooling type 'none' does not produce a sequence embedding.".to_string(),
            ));
        }

        let tokens = model
            .tokenize(text, true, true)
            .map_err(|e| Error::engine("tokenize", e))?;
        check_input_size(&tokens, &call, ctx.n_ctx())?;

        let n_embd = info.n_embd.max(0) as usize;
        let pooled = extract(ctx, &tokens, n_embd);
        ctx.memory_seq_rm(EMBED_SEQ, -1, -1);
        ctx.memory_clear();
        if let Some(chat) = self.chat.as_mut() {
            chat.invalidate();
        }
        let mut values = pooled?;

        let embedding = if call.embedding.json_output {
            if call.embedding.normalize {
                quantize::l2_normalize(&mut values);
            }
            Embedding::Json(quantize::to_json(&values))
        } else {
            Embedding::Blob(quantize::encode(
                &values,
                call.embedding.output_type,
                call.embedding.normalize,
            ))
        };
        debug!(
            tokens = tokens.len(),
            n_embd,
            output_type = call.embedding.output_type.name(),
            "embedding generated"
        );
        Ok(embedding)
    }
}

fn check_input_size(tokens: &[Token], options: &Options, n_ctx: u32) -> Result<()> {
    let n = tokens.len();
    if n == 0 {
        return Err(Error::InvalidArgument(
            "Input text produced no tokens.".to_string(),
        ));
    }
    let max_tokens = options.generation.max_tokens as usize;
    if max_tokens > 0 && n > max_tokens {
        return Err(Error::TooBig(format!(
            "Input too large: {} tokens exceed the configured maximum of {} (max_tokens).",
            n, max_tokens
        )));
    }
    if n > n_ctx as usize {
        return Err(Error::TooBig(format!(
            "Input too large for context: {} tokens require context_size >= {} (current context_size is {}).",
            n, n, n_ctx
        )));
    }
    Ok(())
}

/// Feeds `tokens` through the context and copies out the pooled vector.
fn extract(ctx: &mut dyn Context, tokens: &[Token], n_embd: usize) -> Result<Vec<f32>> {
    ctx.memory_seq_rm(EMBED_SEQ, -1, -1);

    let use_decode = ctx.has_memory();
    let n_batch = ctx.n_batch().max(1) as usize;
    let n_chunks = (tokens.len() + n_batch - 1) / n_batch;
    let mut pos: Pos = 0;

    for (i, chunk) in tokens.chunks(n_batch).enumerate() {
        let last = i + 1 == n_chunks;
        let batch = Batch::sequence(chunk, pos, EMBED_SEQ, last)?;
        if use_decode {
            ctx.decode(&batch).map_err(|e| Error::engine("decode", e))?;
        } else {
            ctx.encode(&batch).map_err(|e| Error::engine("encode", e))?;
        }
        pos += chunk.len() as Pos;
    }

    let pooled = ctx.embeddings_seq(EMBED_SEQ).ok_or_else(|| {
        Error::engine("embeddings", "no pooled embedding for the sequence")
    })?;
    let n = if n_embd == 0 { pooled.len() } else { n_embd.min(pooled.len()) };
    let mut values = try_zeroed::<f32>(n, "embedding")?;
    values.copy_from_slice(&pooled[..n]);
    Ok(values)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::mock::{MockBackend, MockConfig, MockStats};
    use crate::error::ResultCode;
    use crate::options::EMBEDDING_PRESET;

    fn embedding_session(config: MockConfig, user: &str) -> (Session, Arc<MockStats>) {
        let backend = MockBackend::with_config(config);
        let stats = backend.stats();
        let mut s = Session::new(Arc::new(backend));
        s.load_model("mock://embed", None).unwrap();
        s.create_context(Some(EMBEDDING_PRESET), Some(user)).unwrap();
        (s, stats)
    }

    fn floats(e: &Embedding) -> Vec<f32> {
        e.as_blob()
            .unwrap()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn repeated_calls_are_byte_identical() {
        let (mut s, _) = embedding_session(MockConfig::default(), "");
        let a = s.embed("the quick brown fox", None).unwrap();
        let b = s.embed("the quick brown fox", None).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_blob().unwrap().len(), 8 * 4);
        assert_eq!(s.context_used().unwrap(), 0);
    }

    #[test]
    fn chunked_input_matches_single_batch() {
        let text = "a sentence long enough to need several small batches";
        let (mut chunked, stats) =
            embedding_session(MockConfig::default(), "context_size=512,batch_size=8");
        let (mut whole, _) = embedding_session(MockConfig::default(), "context_size=512");

        let a = floats(&chunked.embed(text, None).unwrap());
        let b = floats(&whole.embed(text, None).unwrap());
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5, "{} vs {}", x, y);
        }

        let sizes = stats.batch_sizes();
        assert!(sizes.len() > 1);
        assert!(sizes.iter().all(|&n| n <= 8));
        assert_eq!(sizes.iter().sum::<usize>(), text.len() + 1);
    }

    #[test]
    fn failed_decode_still_clears_the_sequence() {
        let text = "a sentence long enough to need several small batches";
        let config = MockConfig {
            fail_decode_at: Some(2),
            ..MockConfig::default()
        };
        let (mut s, stats) = embedding_session(config, "context_size=512,batch_size=8");

        let clears = MockStats::count(&stats.memory_clears);
        let err = s.embed(text, None).unwrap_err();
        assert!(matches!(err, Error::Engine { .. }));
        assert!(err.to_string().contains("decode"));
        assert_eq!(MockStats::count(&stats.memory_clears), clears + 1);
        assert_eq!(s.context_used().unwrap(), 0);

        let (mut fresh, _) =
            embedding_session(MockConfig::default(), "context_size=512,batch_size=8");
        assert_eq!(s.embed(text, None).unwrap(), fresh.embed(text, None).unwrap());
    }

    #[test]
    fn zero_vector_uses_zero_points() {
        let config = MockConfig {
            zero_embedding: true,
            ..MockConfig::default()
        };
        let (mut s, _) = embedding_session(config, "");
        let u8s = s.embed("x", Some("embedding_type=uint8")).unwrap();
        assert_eq!(u8s.as_blob().unwrap(), &[128u8; 8][..]);
        let i8s = s.embed("x", Some("embedding_type=int8")).unwrap();
        assert_eq!(i8s.as_blob().unwrap(), &[0u8; 8][..]);
    }

    #[test]
    fn per_call_options_do_not_stick() {
        let (mut s, _) = embedding_session(MockConfig::default(), "");
        let half = s.embed("x", Some("embedding_type=float16")).unwrap();
        assert_eq!(half.as_blob().unwrap().len(), 16);
        let full = s.embed("x", None).unwrap();
        assert_eq!(full.as_blob().unwrap().len(), 32);
    }

    #[test]
    fn input_limits() {
        let (mut s, _) = embedding_session(MockConfig::default(), "max_tokens=4");
        let err = s.embed("too many tokens", None).unwrap_err();
        assert_eq!(err.code(), ResultCode::TooBig);
        assert!(err.to_string().contains("max_tokens"));

        let (mut s, _) = embedding_session(MockConfig::default(), "context_size=8");
        let err = s.embed("does not fit in eight", None).unwrap_err();
        assert_eq!(err.code(), ResultCode::TooBig);
        assert!(err.to_string().contains("context"));
        assert!(s.embed("fits", None).is_ok());
    }

    #[test]
    fn encoder_decoder_models_are_rejected() {
        let config = MockConfig {
            has_encoder: true,
            ..MockConfig::default()
        };
        let (mut s, _) = embedding_session(config, "");
        assert!(matches!(
            s.embed("x", None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn memoryless_contexts_encode() {
        let config = MockConfig {
            memory: false,
            ..MockConfig::default()
        };
        let (mut s, stats) = embedding_session(config, "");
        s.embed("hello", None).unwrap();
        assert_eq!(MockStats::count(&stats.encodes), 1);
        assert_eq!(MockStats::count(&stats.decodes), 0);
    }

    #[test]
    fn json_output_lists_normalized_values() {
        let (mut s, _) = embedding_session(MockConfig::default(), "json_output=1");
        let json = match s.embed("hello", None).unwrap() {
            Embedding::Json(j) => j,
            other => panic!("expected json, got {:?}", other),
        };
        assert!(json.starts_with('[') && json.ends_with(']'));
        let norm: f32 = json[1..json.len() - 1]
            .split(',')
            .map(|v| v.parse::<f32>().unwrap().powi(2))
            .sum();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[test]
    fn requires_embedding_context() {
        let backend = MockBackend::new();
        let mut s = Session::new(Arc::new(backend));
        s.load_model("mock://m", None).unwrap();
        assert_eq!(s.embed("x", None).unwrap_err().code(), ResultCode::Misuse);
        s.create_context(None, None).unwrap();
        assert_eq!(s.embed("x", None).unwrap_err().code(), ResultCode::Misuse);
    }
}
