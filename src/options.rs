//! `key=value,key=value` option strings.
//!
//! Pairs are separated by commas; whitespace around keys and values is
//! ignored and keys match case-insensitively. Unknown keys and pairs without
//! an `=` are skipped silently. Numbers follow the C `strtol(..., 0)` and
//! `strtod` prefix rules, so `0x10` is 16, `010` is 8 and `12abc` is 12.

use serde::{Deserialize, Serialize};

use crate::engine::{
    AttentionType, CacheType, ContextParams, EmbeddingType, FlashAttn, ModelParams, OptionEnum,
    PoolingType, RopeScalingType, SplitMode,
};

/// Option string applied before the caller's options by
/// `llm_context_create_embedding`.
pub const EMBEDDING_PRESET: &str = "generate_embedding=1,normalize_embedding=1,pooling_type=mean";
pub const CHAT_PRESET: &str = "context_size=4096";
pub const TEXTGEN_PRESET: &str = "context_size=4096,n_predict=512";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingOptions {
    pub generate: bool,
    pub output_type: EmbeddingType,
    pub normalize: bool,
    pub json_output: bool,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self {
            generate: false,
            output_type: EmbeddingType::Float32,
            normalize: true,
            json_output: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Largest accepted embedding input in tokens, 0 for unlimited.
    pub max_tokens: u32,
    /// Token budget for text generation, 0 for the built-in default.
    pub n_predict: u32,
}

/// Every option a session understands.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Options {
    pub model: ModelParams,
    pub context: ContextParams,
    pub generation: GenerationOptions,
    pub embedding: EmbeddingOptions,
    #[serde(skip)]
    batch_size_set: bool,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a whole option string on top of the current values.
    pub fn parse(&mut self, input: &str) {
        for (key, value) in pairs(input) {
            if !self.apply(key, value) {
                tracing::debug!(key, value, "ignoring unknown option");
            }
        }
        self.finalize();
    }

    /// Options built from a preset followed by the caller's string.
    pub fn with_preset(preset: &str, user: Option<&str>) -> Self {
        let mut options = Options::new();
        options.parse(preset);
        if let Some(user) = user {
            options.parse(user);
        }
        options
    }

    /// Default context, generation and embedding sections on top of the
    /// current model section.
    pub fn rebased(&self) -> Options {
        Options {
            model: self.model.clone(),
            ..Options::default()
        }
    }

    /// Applies one pair. Returns false for unknown keys.
    pub fn apply(&mut self, key: &str, value: &str) -> bool {
        let key = key.to_ascii_lowercase();
        let m = &mut self.model;
        let c = &mut self.context;
        match key.as_str() {
            "gpu_layers" | "n_gpu_layers" => m.n_gpu_layers = parse_i32(value),
            "main_gpu" => m.main_gpu = parse_i32(value),
            "split_mode" => set_enum(&mut m.split_mode, value),
            "use_mmap" => m.use_mmap = parse_bool(value),
            "use_mlock" => m.use_mlock = parse_bool(value),
            "check_tensors" => m.check_tensors = parse_bool(value),
            "vocab_only" => m.vocab_only = parse_bool(value),

            "context_size" | "n_ctx" => {
                c.n_ctx = parse_u32(value);
                if !self.batch_size_set {
                    c.n_batch = c.n_ctx;
                }
            }
            "batch_size" | "n_batch" => {
                c.n_batch = parse_u32(value);
                self.batch_size_set = true;
            }
            "ubatch_size" | "n_ubatch" => c.n_ubatch = parse_u32(value),
            "n_seq_max" => c.n_seq_max = parse_u32(value),
            "n_threads" => c.n_threads = parse_i32(value),
            "n_threads_batch" => c.n_threads_batch = parse_i32(value),
            "rope_scaling_type" => set_enum(&mut c.rope_scaling_type, value),
            "rope_freq_base" => c.rope_freq_base = parse_f32(value),
            "rope_freq_scale" => c.rope_freq_scale = parse_f32(value),
            "yarn_ext_factor" => c.yarn_ext_factor = parse_f32(value),
            "yarn_attn_factor" => c.yarn_attn_factor = parse_f32(value),
            "yarn_beta_fast" => c.yarn_beta_fast = parse_f32(value),
            "yarn_beta_slow" => c.yarn_beta_slow = parse_f32(value),
            "yarn_orig_ctx" => c.yarn_orig_ctx = parse_u32(value),
            "pooling_type" => set_enum::<PoolingType>(&mut c.pooling_type, value),
            "attention_type" => set_enum::<AttentionType>(&mut c.attention_type, value),
            "flash_attn" | "flash_attn_type" => set_enum::<FlashAttn>(&mut c.flash_attn, value),
            "type_k" => set_enum::<CacheType>(&mut c.type_k, value),
            "type_v" => set_enum::<CacheType>(&mut c.type_v, value),
            "offload_kqv" => c.offload_kqv = parse_bool(value),
            "op_offload" => c.op_offload = parse_bool(value),
            "swa_full" => c.swa_full = parse_bool(value),
            "kv_unified" => c.kv_unified = parse_bool(value),

            "max_tokens" => self.generation.max_tokens = parse_u32(value),
            "n_predict" => self.generation.n_predict = parse_u32(value),

            "generate_embedding" | "embedding" => self.embedding.generate = parse_bool(value),
            "embedding_type" => set_enum::<EmbeddingType>(&mut self.embedding.output_type, value),
            "normalize_embedding" => self.embedding.normalize = parse_bool(value),
            "json_output" => self.embedding.json_output = parse_bool(value),
            _ => return false,
        }
        true
    }

    /// Cross-field rules: generating embeddings needs a pooled output and a
    /// micro-batch as large as the batch.
    fn finalize(&mut self) {
        if self.embedding.generate {
            let c = &mut self.context;
            c.embeddings = true;
            if matches!(c.pooling_type, PoolingType::None | PoolingType::Unspecified) {
                c.pooling_type = PoolingType::Mean;
            }
            c.n_ubatch = c.n_batch;
        }
    }
}

/// Splits an option string into trimmed `(key, value)` pairs.
pub fn pairs(input: &str) -> impl Iterator<Item = (&str, &str)> {
    input.split(',').filter_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return None;
        }
        Some((key, value))
    })
}

fn set_enum<E: OptionEnum>(field: &mut E, value: &str) {
    let parsed = E::from_name(value).or_else(|| {
        if value.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+') {
            E::from_code(strtol(value))
        } else {
            None
        }
    });
    match parsed {
        Some(v) => *field = v,
        None => tracing::debug!(value, "ignoring unrecognised enum value"),
    }
}

fn parse_bool(value: &str) -> bool {
    strtol(value) != 0
}

fn parse_i32(value: &str) -> i32 {
    strtol(value).clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

fn parse_u32(value: &str) -> u32 {
    strtol(value).clamp(0, u32::MAX as i64) as u32
}

fn parse_f32(value: &str) -> f32 {
    strtod(value) as f32
}

/// `strtol(s, NULL, 0)`: optional sign, `0x` hex or leading-zero octal,
/// longest valid digit prefix. Saturates on overflow; no digits yields 0.
pub fn strtol(s: &str) -> i64 {
    let bytes = s.trim_start().as_bytes();
    let mut i = 0;
    let negative = match bytes.first() {
        Some(b'-') => {
            i += 1;
            true
        }
        Some(b'+') => {
            i += 1;
            false
        }
        _ => false,
    };

    let radix = if bytes.get(i) == Some(&b'0')
        && matches!(bytes.get(i + 1), Some(b'x' | b'X'))
        && bytes.get(i + 2).map_or(false, |b| b.is_ascii_hexdigit())
    {
        i += 2;
        16
    } else if bytes.get(i) == Some(&b'0') {
        8
    } else {
        10
    };

    let mut acc: i64 = 0;
    while let Some(d) = bytes.get(i).and_then(|&b| (b as char).to_digit(radix)) {
        acc = acc.saturating_mul(radix as i64).saturating_add(d as i64);
        i += 1;
    }
    if negative {
        acc.saturating_neg()
    } else {
        acc
    }
}

/// `strtod`: the longest prefix that reads as a decimal float, or 0.
pub fn strtod(s: &str) -> f64 {
    let s = s.trim_start();
    let lower = s.to_ascii_lowercase();
    let unsigned = lower.trim_start_matches(['+', '-']);
    let sign = if lower.starts_with('-') { -1.0 } else { 1.0 };
    if unsigned.starts_with("inf") {
        return sign * f64::INFINITY;
    }
    if unsigned.starts_with("nan") {
        return f64::NAN;
    }

    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let mut digits = 0;
    while bytes.get(end).map_or(false, u8::is_ascii_digit) {
        end += 1;
        digits += 1;
    }
    if bytes.get(end) == Some(&b'.') {
        end += 1;
        while bytes.get(end).map_or(false, u8::is_ascii_digit) {
            end += 1;
            digits += 1;
        }
    }
    if digits == 0 {
        return 0.0;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        if bytes.get(exp_end).map_or(false, u8::is_ascii_digit) {
            while bytes.get(exp_end).map_or(false, u8::is_ascii_digit) {
                exp_end += 1;
            }
            end = exp_end;
        }
    }
    s[..end].parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_pairs_are_skipped() {
        let mut options = Options::new();
        options.parse("n_predict=64, garbage ,max_tokens=");
        assert_eq!(options.generation.n_predict, 64);
        assert_eq!(options.generation.max_tokens, 0);
    }

    #[test]
    fn keys_are_case_insensitive_and_trimmed() {
        let mut options = Options::new();
        options.parse("  Context_Size = 1024 ,N_THREADS=3");
        assert_eq!(options.context.n_ctx, 1024);
        assert_eq!(options.context.n_threads, 3);
    }

    #[test]
    fn context_size_drives_batch_unless_given() {
        let mut options = Options::new();
        options.parse("context_size=1024");
        assert_eq!(options.context.n_batch, 1024);

        let mut options = Options::new();
        options.parse("batch_size=64,context_size=1024");
        assert_eq!(options.context.n_ctx, 1024);
        assert_eq!(options.context.n_batch, 64);
    }

    #[test]
    fn embedding_forces_pooling_and_ubatch() {
        let mut options = Options::new();
        options.parse("generate_embedding=1,pooling_type=none,batch_size=256");
        assert!(options.context.embeddings);
        assert_eq!(options.context.pooling_type, PoolingType::Mean);
        assert_eq!(options.context.n_ubatch, 256);

        let mut options = Options::new();
        options.parse("embedding=1,pooling_type=last");
        assert_eq!(options.context.pooling_type, PoolingType::Last);
    }

    #[test]
    fn enums_accept_names_and_codes() {
        let mut options = Options::new();
        options.parse("embedding_type=INT8,type_k=8,split_mode=row,flash_attn=off");
        assert_eq!(options.embedding.output_type, EmbeddingType::Int8);
        assert_eq!(options.context.type_k, CacheType::Q8_0);
        assert_eq!(options.model.split_mode, SplitMode::Row);
        assert_eq!(options.context.flash_attn, FlashAttn::Disabled);

        options.parse("embedding_type=bogus,type_v=99");
        assert_eq!(options.embedding.output_type, EmbeddingType::Int8);
        assert_eq!(options.context.type_v, CacheType::F16);
    }

    #[test]
    fn presets_apply_before_user_options() {
        let options = Options::with_preset(TEXTGEN_PRESET, Some("n_predict=16"));
        assert_eq!(options.context.n_ctx, 4096);
        assert_eq!(options.generation.n_predict, 16);

        let options = Options::with_preset(EMBEDDING_PRESET, Some("normalize_embedding=0"));
        assert!(options.embedding.generate);
        assert!(!options.embedding.normalize);
        assert_eq!(options.context.pooling_type, PoolingType::Mean);
    }

    #[test]
    fn strtol_prefix_rules() {
        assert_eq!(strtol("42"), 42);
        assert_eq!(strtol("  -17xyz"), -17);
        assert_eq!(strtol("0x1F"), 31);
        assert_eq!(strtol("010"), 8);
        assert_eq!(strtol("09"), 0);
        assert_eq!(strtol("0x"), 0);
        assert_eq!(strtol("abc"), 0);
        assert_eq!(strtol("99999999999999999999999"), i64::MAX);
    }

    #[test]
    fn strtod_prefix_rules() {
        assert_eq!(strtod("0.5"), 0.5);
        assert_eq!(strtod("1e3x"), 1000.0);
        assert_eq!(strtod("2.5e"), 2.5);
        assert_eq!(strtod("-.25"), -0.25);
        assert_eq!(strtod("."), 0.0);
        assert!(strtod("inf").is_infinite());
    }

    #[test]
    fn rope_and_yarn_values() {
        let mut options = Options::new();
        options.parse("rope_scaling_type=yarn,rope_freq_base=10000,yarn_orig_ctx=0x800");
        assert_eq!(options.context.rope_scaling_type, RopeScalingType::Yarn);
        assert_eq!(options.context.rope_freq_base, 10000.0);
        assert_eq!(options.context.yarn_orig_ctx, 2048);
    }
}
