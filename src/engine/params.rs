//! Native parameter records handed to an engine when a model or a context
//! is created, plus the enumerations they carry.

use serde::{Deserialize, Serialize};

/// An enumeration that can be named in an option string either by name
/// (case-insensitive) or by its integer code.
pub trait OptionEnum: Sized + Copy + 'static {
    const VARIANTS: &'static [(&'static str, i64, Self)];

    fn from_name(name: &str) -> Option<Self> {
        Self::VARIANTS
            .iter()
            .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, _, v)| *v)
    }

    fn from_code(code: i64) -> Option<Self> {
        Self::VARIANTS
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(_, _, v)| *v)
    }
}

macro_rules! option_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:expr => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl OptionEnum for $name {
            const VARIANTS: &'static [(&'static str, i64, Self)] = &[
                $(($label, $code, $name::$variant)),+
            ];
        }

        impl $name {
            pub fn code(&self) -> i64 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }
    };
}

option_enum!(
    /// How a model is split across several devices.
    SplitMode {
        None = 0 => "none",
        Layer = 1 => "layer",
        Row = 2 => "row",
    }
);

option_enum!(
    /// Reduction applied to per-token vectors to obtain one sequence vector.
    PoolingType {
        Unspecified = -1 => "unspecified",
        None = 0 => "none",
        Mean = 1 => "mean",
        Cls = 2 => "cls",
        Last = 3 => "last",
        Rank = 4 => "rank",
    }
);

option_enum!(
    AttentionType {
        Unspecified = -1 => "unspecified",
        Causal = 0 => "causal",
        NonCausal = 1 => "non_causal",
    }
);

option_enum!(
    RopeScalingType {
        Unspecified = -1 => "unspecified",
        None = 0 => "none",
        Linear = 1 => "linear",
        Yarn = 2 => "yarn",
        LongRope = 3 => "longrope",
    }
);

option_enum!(
    FlashAttn {
        Auto = -1 => "auto",
        Disabled = 0 => "off",
        Enabled = 1 => "on",
    }
);

option_enum!(
    /// Element type of the KV cache.
    CacheType {
        F32 = 0 => "f32",
        F16 = 1 => "f16",
        Q4_0 = 2 => "q4_0",
        Q4_1 = 3 => "q4_1",
        Q5_0 = 6 => "q5_0",
        Q5_1 = 7 => "q5_1",
        Q8_0 = 8 => "q8_0",
        Iq4Nl = 20 => "iq4_nl",
        Bf16 = 30 => "bf16",
    }
);

option_enum!(
    /// Numeric encoding of an embedding returned to the caller.
    EmbeddingType {
        Float32 = 0 => "float32",
        Float16 = 1 => "float16",
        BFloat16 = 2 => "bfloat16",
        Uint8 = 3 => "uint8",
        Int8 = 4 => "int8",
    }
);

impl EmbeddingType {
    pub fn element_size(&self) -> usize {
        match self {
            EmbeddingType::Float32 => 4,
            EmbeddingType::Float16 | EmbeddingType::BFloat16 => 2,
            EmbeddingType::Uint8 | EmbeddingType::Int8 => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub n_gpu_layers: i32,
    pub main_gpu: i32,
    pub split_mode: SplitMode,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub check_tensors: bool,
    pub vocab_only: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 999,
            main_gpu: 0,
            split_mode: SplitMode::Layer,
            use_mmap: true,
            use_mlock: false,
            check_tensors: false,
            vocab_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextParams {
    /// Context window in tokens, 0 means "use the training window".
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_seq_max: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
    pub rope_scaling_type: RopeScalingType,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub yarn_ext_factor: f32,
    pub yarn_attn_factor: f32,
    pub yarn_beta_fast: f32,
    pub yarn_beta_slow: f32,
    pub yarn_orig_ctx: u32,
    pub pooling_type: PoolingType,
    pub attention_type: AttentionType,
    pub flash_attn: FlashAttn,
    pub type_k: CacheType,
    pub type_v: CacheType,
    pub embeddings: bool,
    pub offload_kqv: bool,
    pub op_offload: bool,
    pub swa_full: bool,
    pub kv_unified: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        let threads = num_cpus::get_physical().max(1) as i32;
        Self {
            n_ctx: 512,
            n_batch: 2048,
            n_ubatch: 512,
            n_seq_max: 1,
            n_threads: threads,
            n_threads_batch: threads,
            rope_scaling_type: RopeScalingType::Unspecified,
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            yarn_ext_factor: -1.0,
            yarn_attn_factor: 1.0,
            yarn_beta_fast: 32.0,
            yarn_beta_slow: 1.0,
            yarn_orig_ctx: 0,
            pooling_type: PoolingType::Unspecified,
            attention_type: AttentionType::Unspecified,
            flash_attn: FlashAttn::Auto,
            type_k: CacheType::F16,
            type_v: CacheType::F16,
            embeddings: false,
            offload_kqv: true,
            op_offload: true,
            swa_full: true,
            kv_unified: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_resolve_by_name_or_code() {
        assert_eq!(PoolingType::from_name("MEAN"), Some(PoolingType::Mean));
        assert_eq!(PoolingType::from_code(3), Some(PoolingType::Last));
        assert_eq!(PoolingType::from_code(9), None);
        assert_eq!(CacheType::from_name("q8_0"), Some(CacheType::Q8_0));
        assert_eq!(CacheType::Bf16.code(), 30);
        assert_eq!(FlashAttn::from_name("on"), Some(FlashAttn::Enabled));
    }

    #[test]
    fn embedding_element_sizes() {
        assert_eq!(EmbeddingType::Float32.element_size(), 4);
        assert_eq!(EmbeddingType::BFloat16.element_size(), 2);
        assert_eq!(EmbeddingType::Int8.element_size(), 1);
    }
}
