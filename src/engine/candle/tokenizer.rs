use std::path::Path;

use anyhow::Result;
use shimmytok::Tokenizer as ShimmyTokenizer;

pub struct TokenizerWrapper {
    inner: ShimmyTokenizer,
    eos_token_id: u32,
    eot_token_id: Option<u32>,
}

impl TokenizerWrapper {
    pub fn from_gguf(path: &Path, eot_token_id: Option<u32>) -> Result<Self> {
        let inner = ShimmyTokenizer::from_gguf_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let eos_token_id = inner.eos_token();
        tracing::info!("Loaded tokenizer, EOS={}", eos_token_id);

        Ok(Self {
            inner,
            eos_token_id,
            eot_token_id,
        })
    }

    pub fn encode(&self, text: &str, add_special: bool) -> Result<Vec<u32>> {
        self.inner
            .encode(text, add_special)
            .map_err(|e| anyhow::anyhow!("Encode failed: {}", e))
    }

    pub fn decode(&self, tokens: &[u32], skip_special: bool) -> Result<String> {
        self.inner
            .decode(tokens, skip_special)
            .map_err(|e| anyhow::anyhow!("Decode failed: {}", e))
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    pub fn is_eog(&self, token: u32) -> bool {
        token == self.eos_token_id || Some(token) == self.eot_token_id
    }
}
