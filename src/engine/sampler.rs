use serde::{Deserialize, Serialize};

/// One stage of a sampler chain. Stages run in the order they were added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SamplerStage {
    Greedy,
    Dist {
        seed: u32,
    },
    TopK {
        k: i32,
    },
    TopP {
        p: f32,
        min_keep: usize,
    },
    MinP {
        p: f32,
        min_keep: usize,
    },
    Typical {
        p: f32,
        min_keep: usize,
    },
    Temp {
        t: f32,
    },
    TempExt {
        t: f32,
        delta: f32,
        exponent: f32,
    },
    Xtc {
        p: f32,
        t: f32,
        min_keep: usize,
        seed: u32,
    },
    TopNSigma {
        n: f32,
    },
    Mirostat {
        seed: u32,
        tau: f32,
        eta: f32,
        m: i32,
    },
    MirostatV2 {
        seed: u32,
        tau: f32,
        eta: f32,
    },
    Grammar {
        grammar: String,
        root: String,
    },
    Infill,
    Penalties {
        last_n: i32,
        repeat: f32,
        freq: f32,
        present: f32,
    },
}

/// Seed value requesting a random seed.
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// Turns a stage seed into the seed of its generator, drawing a fresh one
/// for [`DEFAULT_SEED`].
pub fn resolve_seed(seed: u32) -> u64 {
    if seed == DEFAULT_SEED {
        rand::random()
    } else {
        seed as u64
    }
}

impl SamplerStage {
    pub fn name(&self) -> &'static str {
        match self {
            SamplerStage::Greedy => "greedy",
            SamplerStage::Dist { .. } => "dist",
            SamplerStage::TopK { .. } => "top-k",
            SamplerStage::TopP { .. } => "top-p",
            SamplerStage::MinP { .. } => "min-p",
            SamplerStage::Typical { .. } => "typical",
            SamplerStage::Temp { .. } => "temp",
            SamplerStage::TempExt { .. } => "temp-ext",
            SamplerStage::Xtc { .. } => "xtc",
            SamplerStage::TopNSigma { .. } => "top-n-sigma",
            SamplerStage::Mirostat { .. } => "mirostat",
            SamplerStage::MirostatV2 { .. } => "mirostat-v2",
            SamplerStage::Grammar { .. } => "grammar",
            SamplerStage::Infill => "infill",
            SamplerStage::Penalties { .. } => "penalties",
        }
    }

    /// Whether this stage selects a token rather than filtering candidates.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SamplerStage::Greedy
                | SamplerStage::Dist { .. }
                | SamplerStage::Mirostat { .. }
                | SamplerStage::MirostatV2 { .. }
        )
    }

    /// Stages that need the model vocabulary to be constructed.
    pub fn needs_model(&self) -> bool {
        matches!(
            self,
            SamplerStage::Mirostat { .. } | SamplerStage::Grammar { .. } | SamplerStage::Infill
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_stages() {
        assert!(SamplerStage::Greedy.is_terminal());
        assert!(SamplerStage::Dist { seed: 1 }.is_terminal());
        assert!(!SamplerStage::Temp { t: 0.8 }.is_terminal());
        assert!(!SamplerStage::Penalties {
            last_n: 64,
            repeat: 1.1,
            freq: 0.0,
            present: 0.0
        }
        .is_terminal());
    }
}
