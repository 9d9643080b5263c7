use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::Device;
use candle_transformers::models::quantized_llama::ModelWeights;
use memmap2::Mmap;

use crate::engine::{ModelInfo, ModelParams};

const ARCH_FALLBACKS: &[&str] = &["llama", "qwen2", "mistral", "phi3", "gemma"];

/// Everything read from a GGUF file.
pub struct LoadedGguf {
    pub metadata: Vec<(String, gguf_file::Value)>,
    pub info: ModelInfo,
    pub weights: Option<ModelWeights>,
}

pub fn load(path: &Path, params: &ModelParams, device: &Device) -> Result<LoadedGguf> {
    let file =
        File::open(path).with_context(|| format!("Failed to open model file: {:?}", path))?;

    if params.use_mmap {
        let mmap = unsafe { Mmap::map(&file)? };
        read(&mut Cursor::new(&mmap[..]), path, params, device)
    } else {
        read(&mut BufReader::new(file), path, params, device)
    }
}

fn read<R: Read + Seek>(
    reader: &mut R,
    path: &Path,
    params: &ModelParams,
    device: &Device,
) -> Result<LoadedGguf> {
    let content = gguf_file::Content::read(reader)
        .with_context(|| format!("Failed to read GGUF file: {:?}", path))?;

    let info = model_info(&content);
    let mut metadata: Vec<_> = content
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    metadata.sort_by(|a, b| a.0.cmp(&b.0));

    let weights = if params.vocab_only {
        None
    } else {
        Some(
            ModelWeights::from_gguf(content, reader, device)
                .with_context(|| "Failed to load model weights from GGUF")?,
        )
    };

    tracing::info!(
        "Loaded model: {} ({} layers, {} embedding dim, {} vocab)",
        info.description,
        info.n_layer,
        info.n_embd,
        info.n_vocab
    );

    Ok(LoadedGguf {
        metadata,
        info,
        weights,
    })
}

fn architecture(md: &std::collections::HashMap<String, gguf_file::Value>) -> String {
    md.get("general.architecture")
        .and_then(|v| v.to_string().ok().cloned())
        .unwrap_or_else(|| "llama".to_string())
}

fn model_info(content: &gguf_file::Content) -> ModelInfo {
    let md = &content.metadata;
    let arch = architecture(md);

    let get = |key: &str| -> Option<u32> {
        std::iter::once(arch.as_str())
            .chain(ARCH_FALLBACKS.iter().copied())
            .find_map(|prefix| md.get(&format!("{}.{}", prefix, key)))
            .and_then(|v| v.to_u32().ok())
    };

    let (n_params, size) = content
        .tensor_infos
        .values()
        .fold((0u64, 0u64), |(params, bytes), t| {
            let n = t.shape.elem_count() as u64;
            let b = n / t.ggml_dtype.block_size() as u64 * t.ggml_dtype.type_size() as u64;
            (params + n, bytes + b)
        });

    let n_vocab = get("vocab_size")
        .or_else(|| {
            md.get("tokenizer.ggml.tokens")
                .and_then(|v| v.to_vec().ok())
                .map(|v| v.len() as u32)
        })
        .unwrap_or(0);

    let cls_labels = md
        .get(&format!("{}.classifier.output_labels", arch))
        .and_then(|v| v.to_vec().ok())
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| l.to_string().ok().cloned())
                .collect()
        })
        .unwrap_or_default();

    let name = md
        .get("general.size_label")
        .and_then(|v| v.to_string().ok().cloned())
        .unwrap_or_else(|| params_label(n_params));

    ModelInfo {
        description: format!("{} {}", arch, name),
        size,
        n_params,
        n_embd: get("embedding_length").unwrap_or(0) as i32,
        n_layer: get("block_count").unwrap_or(0) as i32,
        n_head: get("attention.head_count").unwrap_or(0) as i32,
        n_ctx_train: get("context_length").unwrap_or(4096) as i32,
        n_vocab: n_vocab as i32,
        has_encoder: false,
        has_decoder: true,
        is_recurrent: false,
        cls_labels,
    }
}

fn params_label(n: u64) -> String {
    match n {
        n if n >= 1_000_000_000 => format!("{:.1}B", n as f64 / 1e9),
        n if n >= 1_000_000 => format!("{}M", n / 1_000_000),
        n => format!("{}K", n / 1_000),
    }
}

/// Renders a metadata value the way `llm_model_meta` returns it.
pub fn render(value: &gguf_file::Value) -> String {
    use gguf_file::Value as V;
    match value {
        V::U8(v) => v.to_string(),
        V::I8(v) => v.to_string(),
        V::U16(v) => v.to_string(),
        V::I16(v) => v.to_string(),
        V::U32(v) => v.to_string(),
        V::I32(v) => v.to_string(),
        V::U64(v) => v.to_string(),
        V::I64(v) => v.to_string(),
        V::F32(v) => v.to_string(),
        V::F64(v) => v.to_string(),
        V::Bool(v) => v.to_string(),
        V::String(v) => v.clone(),
        V::Array(items) => {
            let shown: Vec<String> = items.iter().take(8).map(render).collect();
            if items.len() > shown.len() {
                format!("[{}, ...]", shown.join(", "))
            } else {
                format!("[{}]", shown.join(", "))
            }
        }
    }
}

pub fn meta_string(metadata: &[(String, gguf_file::Value)], key: &str) -> Option<String> {
    metadata
        .iter()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.to_string().ok().cloned())
}

pub fn meta_u32(metadata: &[(String, gguf_file::Value)], key: &str) -> Option<u32> {
    metadata
        .iter()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.to_u32().ok())
}

/// Text of token `id` from the embedded vocabulary.
pub fn token_text(metadata: &[(String, gguf_file::Value)], id: u32) -> Option<String> {
    metadata
        .iter()
        .find(|(k, _)| k == "tokenizer.ggml.tokens")
        .and_then(|(_, v)| v.to_vec().ok())
        .and_then(|tokens| tokens.get(id as usize))
        .and_then(|t| t.to_string().ok().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gguf_file::Value as V;

    #[test]
    fn renders_scalars_and_arrays() {
        assert_eq!(render(&V::U32(4096)), "4096");
        assert_eq!(render(&V::Bool(true)), "true");
        assert_eq!(render(&V::String("llama".into())), "llama");
        let arr = V::Array((0..10).map(V::I32).collect());
        assert_eq!(render(&arr), "[0, 1, 2, 3, 4, 5, 6, 7, ...]");
    }

    #[test]
    fn labels_parameter_counts() {
        assert_eq!(params_label(1_100_000_000), "1.1B");
        assert_eq!(params_label(135_000_000), "135M");
        assert_eq!(params_label(5_000), "5K");
    }

    #[test]
    fn looks_up_typed_metadata() {
        let md = vec![
            ("general.name".to_string(), V::String("tiny".into())),
            ("llama.block_count".to_string(), V::U32(22)),
            (
                "tokenizer.ggml.tokens".to_string(),
                V::Array(vec![V::String("<unk>".into()), V::String("<s>".into())]),
            ),
        ];
        assert_eq!(meta_string(&md, "general.name").as_deref(), Some("tiny"));
        assert_eq!(meta_u32(&md, "llama.block_count"), Some(22));
        assert_eq!(token_text(&md, 1).as_deref(), Some("<s>"));
        assert_eq!(token_text(&md, 5), None);
    }
}
