//! The scalar function table.
//!
//! Each entry lists the argument signatures it accepts. Arguments are
//! checked before the handler runs: the count must match one signature and
//! every argument must have the declared type (an INTEGER is accepted where
//! a REAL is declared).

use super::value::{Value, ValueType};
use super::Extension;
use crate::embedding::Embedding;
use crate::engine::{SamplerStage, DEFAULT_SEED};
use crate::error::{Error, Result};
use crate::options::{CHAT_PRESET, EMBEDDING_PRESET, TEXTGEN_PRESET};

type Handler = fn(&mut Extension, &[Value]) -> Result<Value>;

pub struct Function {
    pub name: &'static str,
    pub signatures: &'static [&'static [ValueType]],
    /// Fails with a misuse error when no model is loaded.
    pub needs_model: bool,
    /// A NULL or empty first argument returns NULL without running.
    pub null_input_is_null: bool,
    handler: Handler,
}

use ValueType::{Integer as I, Real as R, Text as T};

const NONE: &[&[ValueType]] = &[&[]];
const OPT_TEXT: &[&[ValueType]] = &[&[], &[T]];
const TEXT: &[&[ValueType]] = &[&[T]];
const TEXT_OPT_TEXT: &[&[ValueType]] = &[&[T], &[T, T]];

macro_rules! function {
    ($name:literal, $sigs:expr, $needs_model:expr, $handler:expr) => {
        Function {
            name: $name,
            signatures: $sigs,
            needs_model: $needs_model,
            null_input_is_null: false,
            handler: $handler,
        }
    };
    ($name:literal, $sigs:expr, $needs_model:expr, $handler:expr, null_input) => {
        Function {
            name: $name,
            signatures: $sigs,
            needs_model: $needs_model,
            null_input_is_null: true,
            handler: $handler,
        }
    };
}

pub static FUNCTIONS: &[Function] = &[
    function!("ai_version", NONE, false, version),
    function!("llm_log_info", &[&[I]], false, log_info),
    function!("llm_model_load", TEXT_OPT_TEXT, false, model_load),
    function!("llm_model_free", NONE, false, model_free),
    function!("llm_context_create", OPT_TEXT, true, context_create),
    function!("llm_context_create_embedding", OPT_TEXT, true, context_create_embedding),
    function!("llm_context_create_chat", OPT_TEXT, true, context_create_chat),
    function!("llm_context_create_textgen", OPT_TEXT, true, context_create_textgen),
    function!("llm_context_free", NONE, false, context_free),
    function!("llm_context_size", NONE, false, context_size),
    function!("llm_context_used", NONE, false, context_used),
    function!("llm_sampler_create", NONE, false, sampler_create),
    function!("llm_sampler_free", NONE, false, sampler_free),
    function!("llm_sampler_init_greedy", NONE, false, sampler_greedy),
    function!("llm_sampler_init_dist", &[&[], &[I]], false, sampler_dist),
    function!("llm_sampler_init_top_k", &[&[I]], false, sampler_top_k),
    function!("llm_sampler_init_top_p", &[&[R, I]], false, sampler_top_p),
    function!("llm_sampler_init_min_p", &[&[R, I]], false, sampler_min_p),
    function!("llm_sampler_init_typical", &[&[R, I]], false, sampler_typical),
    function!("llm_sampler_init_temp", &[&[R]], false, sampler_temp),
    function!("llm_sampler_init_temp_ext", &[&[R, R, R]], false, sampler_temp_ext),
    function!("llm_sampler_init_xtc", &[&[R, R, I, I]], false, sampler_xtc),
    function!("llm_sampler_init_top_n_sigma", &[&[R]], false, sampler_top_n_sigma),
    function!("llm_sampler_init_mirostat", &[&[I, R, R, I]], true, sampler_mirostat),
    function!("llm_sampler_init_mirostat_v2", &[&[I, R, R]], false, sampler_mirostat_v2),
    function!("llm_sampler_init_grammar", &[&[T, T]], true, sampler_grammar),
    function!("llm_sampler_init_infill", NONE, true, sampler_infill),
    function!("llm_sampler_init_penalties", &[&[I, R, R, R]], false, sampler_penalties),
    function!("llm_lora_load", &[&[T, R]], true, lora_load),
    function!("llm_lora_free", NONE, false, lora_free),
    function!("llm_embed_generate", TEXT_OPT_TEXT, true, embed_generate, null_input),
    function!("llm_token_count", TEXT, true, token_count),
    function!("llm_text_generate", TEXT_OPT_TEXT, true, text_generate, null_input),
    function!("llm_chat_create", NONE, true, chat_create),
    function!("llm_chat_free", NONE, false, chat_free),
    function!("llm_chat_respond", TEXT, true, chat_respond),
    function!("llm_chat_system_prompt", OPT_TEXT, false, chat_system_prompt),
    function!("llm_chat_save", &[&[], &[T], &[T, T]], false, chat_save),
    function!("llm_chat_restore", TEXT, true, chat_restore),
    function!("llm_model_n_params", NONE, true, model_n_params),
    function!("llm_model_n_embd", NONE, true, model_n_embd),
    function!("llm_model_n_layer", NONE, true, model_n_layer),
    function!("llm_model_n_head", NONE, true, model_n_head),
    function!("llm_model_n_ctx_train", NONE, true, model_n_ctx_train),
    function!("llm_model_size", NONE, true, model_size),
    function!("llm_model_desc", NONE, true, model_desc),
    function!("llm_model_chat_template", NONE, true, model_chat_template),
    function!("llm_model_has_encoder", NONE, true, model_has_encoder),
    function!("llm_model_has_decoder", NONE, true, model_has_decoder),
    function!("llm_model_is_recurrent", NONE, true, model_is_recurrent),
    function!("llm_model_n_cls_out", NONE, true, model_n_cls_out),
    function!("llm_model_cls_label", &[&[I]], true, model_cls_label),
    function!("llm_model_meta", TEXT, true, model_meta),
];

pub fn lookup(name: &str) -> Option<&'static Function> {
    FUNCTIONS.iter().find(|f| f.name.eq_ignore_ascii_case(name))
}

impl Function {
    pub(crate) fn invoke(&self, ext: &mut Extension, args: &[Value]) -> Result<Value> {
        let signature = find_signature(self.name, self.signatures, args)?;
        if self.null_input_is_null {
            match args.first() {
                Some(Value::Null) => return Ok(Value::Null),
                Some(Value::Text(t)) if t.is_empty() => return Ok(Value::Null),
                _ => {}
            }
        }
        check_types(self.name, signature, args)?;
        if self.needs_model {
            ext.session.model()?;
        }
        (self.handler)(ext, args)
    }
}

/// Validates `args` against the accepted signatures of function `name`.
pub(crate) fn check_args(
    name: &str,
    signatures: &[&[ValueType]],
    args: &[Value],
) -> Result<()> {
    let signature = find_signature(name, signatures, args)?;
    check_types(name, signature, args)
}

fn find_signature<'a>(
    name: &str,
    signatures: &'a [&'a [ValueType]],
    args: &[Value],
) -> Result<&'a [ValueType]> {
    signatures
        .iter()
        .find(|s| s.len() == args.len())
        .copied()
        .ok_or_else(|| {
            let counts: Vec<String> = signatures.iter().map(|s| s.len().to_string()).collect();
            Error::InvalidArgument(format!(
                "Function '{}' expects {} arguments, but {} were provided.",
                name,
                counts.join(" or "),
                args.len()
            ))
        })
}

fn check_types(name: &str, signature: &[ValueType], args: &[Value]) -> Result<()> {
    for (i, (expected, arg)) in signature.iter().zip(args).enumerate() {
        let actual = arg.value_type();
        let accepted =
            actual == *expected || (*expected == ValueType::Real && actual == ValueType::Integer);
        if !accepted {
            return Err(Error::InvalidArgument(format!(
                "Function '{}': argument {} must be of type {} (got {}).",
                name,
                i + 1,
                expected,
                actual
            )));
        }
    }
    Ok(())
}

fn text(args: &[Value], i: usize) -> Option<&str> {
    args.get(i).and_then(Value::as_text)
}

fn int(args: &[Value], i: usize) -> i64 {
    args.get(i).and_then(Value::as_integer).unwrap_or(0)
}

fn real(args: &[Value], i: usize) -> f32 {
    args.get(i).and_then(Value::as_real).unwrap_or(0.0) as f32
}

fn int32(args: &[Value], i: usize) -> i32 {
    int(args, i).clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

fn seed(args: &[Value], i: usize) -> u32 {
    match args.get(i).and_then(Value::as_integer) {
        Some(s) if (0..=u32::MAX as i64).contains(&s) => s as u32,
        _ => DEFAULT_SEED,
    }
}

fn min_keep(args: &[Value], i: usize) -> usize {
    int(args, i).max(0) as usize
}

fn version(_: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::from(crate::VERSION))
}

fn log_info(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    ext.session.log().set_info_enabled(int(args, 0) != 0);
    Ok(Value::Null)
}

fn model_load(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    let path = text(args, 0).unwrap_or_default();
    ext.session.load_model(path, text(args, 1))?;
    Ok(Value::Null)
}

fn model_free(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    ext.session.free_model();
    Ok(Value::Null)
}

fn context_create(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    ext.session.create_context(None, text(args, 0))?;
    Ok(Value::Null)
}

fn context_create_embedding(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    ext.session
        .create_context(Some(EMBEDDING_PRESET), text(args, 0))?;
    Ok(Value::Null)
}

fn context_create_chat(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    ext.session.create_context(Some(CHAT_PRESET), text(args, 0))?;
    Ok(Value::Null)
}

fn context_create_textgen(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    ext.session
        .create_context(Some(TEXTGEN_PRESET), text(args, 0))?;
    Ok(Value::Null)
}

fn context_free(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    ext.session.free_context();
    Ok(Value::Null)
}

fn context_size(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::Integer(ext.session.context_size()? as i64))
}

fn context_used(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::Integer(ext.session.context_used()? as i64))
}

fn sampler_create(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    ext.session.create_sampler();
    Ok(Value::Null)
}

fn sampler_free(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    ext.session.free_sampler();
    Ok(Value::Null)
}

fn add_stage(ext: &mut Extension, stage: SamplerStage) -> Result<Value> {
    ext.session.add_sampler_stage(stage)?;
    Ok(Value::Null)
}

fn sampler_greedy(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    add_stage(ext, SamplerStage::Greedy)
}

fn sampler_dist(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(ext, SamplerStage::Dist { seed: seed(args, 0) })
}

fn sampler_top_k(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(ext, SamplerStage::TopK { k: int32(args, 0) })
}

fn sampler_top_p(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(
        ext,
        SamplerStage::TopP {
            p: real(args, 0),
            min_keep: min_keep(args, 1),
        },
    )
}

fn sampler_min_p(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(
        ext,
        SamplerStage::MinP {
            p: real(args, 0),
            min_keep: min_keep(args, 1),
        },
    )
}

fn sampler_typical(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(
        ext,
        SamplerStage::Typical {
            p: real(args, 0),
            min_keep: min_keep(args, 1),
        },
    )
}

fn sampler_temp(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(ext, SamplerStage::Temp { t: real(args, 0) })
}

fn sampler_temp_ext(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(
        ext,
        SamplerStage::TempExt {
            t: real(args, 0),
            delta: real(args, 1),
            exponent: real(args, 2),
        },
    )
}

fn sampler_xtc(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(
        ext,
        SamplerStage::Xtc {
            p: real(args, 0),
            t: real(args, 1),
            min_keep: min_keep(args, 2),
            seed: seed(args, 3),
        },
    )
}

fn sampler_top_n_sigma(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(ext, SamplerStage::TopNSigma { n: real(args, 0) })
}

fn sampler_mirostat(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(
        ext,
        SamplerStage::Mirostat {
            seed: seed(args, 0),
            tau: real(args, 1),
            eta: real(args, 2),
            m: int32(args, 3),
        },
    )
}

fn sampler_mirostat_v2(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(
        ext,
        SamplerStage::MirostatV2 {
            seed: seed(args, 0),
            tau: real(args, 1),
            eta: real(args, 2),
        },
    )
}

fn sampler_grammar(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(
        ext,
        SamplerStage::Grammar {
            grammar: text(args, 0).unwrap_or_default().to_string(),
            root: text(args, 1).unwrap_or("root").to_string(),
        },
    )
}

fn sampler_infill(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    add_stage(ext, SamplerStage::Infill)
}

fn sampler_penalties(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    add_stage(
        ext,
        SamplerStage::Penalties {
            last_n: int32(args, 0),
            repeat: real(args, 1),
            freq: real(args, 2),
            present: real(args, 3),
        },
    )
}

fn lora_load(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    let path = text(args, 0).unwrap_or_default();
    let index = ext.session.load_adapter(path, real(args, 1))?;
    Ok(Value::Integer(index as i64))
}

fn lora_free(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    ext.session.free_adapters()?;
    Ok(Value::Null)
}

fn embed_generate(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    let input = text(args, 0).unwrap_or_default();
    Ok(match ext.session.embed(input, text(args, 1))? {
        Embedding::Blob(bytes) => Value::Blob(bytes),
        Embedding::Json(json) => Value::Text(json),
    })
}

fn token_count(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    let n = ext.session.count_tokens(text(args, 0).unwrap_or_default())?;
    Ok(Value::Integer(n as i64))
}

fn text_generate(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    let prompt = text(args, 0).unwrap_or_default();
    Ok(Value::Text(ext.session.generate_text(prompt, text(args, 1))?))
}

fn chat_create(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::Text(ext.session.chat_create()?.to_string()))
}

fn chat_free(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    ext.session.chat_free();
    Ok(Value::Null)
}

fn chat_respond(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    let message = text(args, 0).unwrap_or_default();
    Ok(Value::Text(ext.session.chat_respond(message)?))
}

fn chat_system_prompt(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    match text(args, 0) {
        Some(prompt) => {
            ext.session.set_chat_system_prompt(prompt)?;
            Ok(Value::Null)
        }
        None => Ok(Value::from(ext.session.chat_system_prompt()?)),
    }
}

fn chat_save(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    let Extension { session, store } = ext;
    let id = session.chat_save(&mut **store, text(args, 0), text(args, 1))?;
    Ok(Value::Text(id.to_string()))
}

fn chat_restore(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    let Extension { session, store } = ext;
    session.chat_restore(&**store, text(args, 0).unwrap_or_default())?;
    Ok(Value::Null)
}

fn model_n_params(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::Integer(ext.session.model()?.info().n_params as i64))
}

fn model_n_embd(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::Integer(ext.session.model()?.info().n_embd as i64))
}

fn model_n_layer(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::Integer(ext.session.model()?.info().n_layer as i64))
}

fn model_n_head(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::Integer(ext.session.model()?.info().n_head as i64))
}

fn model_n_ctx_train(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::Integer(ext.session.model()?.info().n_ctx_train as i64))
}

fn model_size(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::Integer(ext.session.model()?.info().size as i64))
}

fn model_desc(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::Text(ext.session.model()?.info().description.clone()))
}

fn model_chat_template(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::from(ext.session.model()?.chat_template()))
}

fn model_has_encoder(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::from(ext.session.model()?.info().has_encoder))
}

fn model_has_decoder(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::from(ext.session.model()?.info().has_decoder))
}

fn model_is_recurrent(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::from(ext.session.model()?.info().is_recurrent))
}

fn model_n_cls_out(ext: &mut Extension, _: &[Value]) -> Result<Value> {
    Ok(Value::Integer(
        ext.session.model()?.info().cls_labels.len() as i64,
    ))
}

fn model_cls_label(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    let labels = &ext.session.model()?.info().cls_labels;
    let label = usize::try_from(int(args, 0))
        .ok()
        .and_then(|i| labels.get(i))
        .cloned();
    Ok(Value::from(label))
}

fn model_meta(ext: &mut Extension, args: &[Value]) -> Result<Value> {
    let key = text(args, 0).unwrap_or_default();
    Ok(Value::from(ext.session.model()?.meta(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_names_are_unique() {
        let mut names: Vec<&str> = FUNCTIONS.iter().map(|f| f.name).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn lookup_ignores_case() {
        assert!(lookup("LLM_MODEL_LOAD").is_some());
        assert!(lookup("llm_nonexistent").is_none());
    }

    #[test]
    fn arity_errors_list_accepted_counts() {
        let f = lookup("llm_model_load").unwrap();
        let err = check_args(f.name, f.signatures, &[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Function 'llm_model_load' expects 1 or 2 arguments, but 0 were provided."
        );
    }

    #[test]
    fn type_errors_name_both_types() {
        let f = lookup("llm_sampler_init_top_k").unwrap();
        let err = check_args(f.name, f.signatures, &[Value::from("40")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Function 'llm_sampler_init_top_k': argument 1 must be of type INTEGER (got TEXT)."
        );
    }

    #[test]
    fn integers_widen_to_real() {
        let f = lookup("llm_sampler_init_temp").unwrap();
        assert!(check_args(f.name, f.signatures, &[Value::Integer(1)]).is_ok());
        let f = lookup("llm_sampler_init_top_k").unwrap();
        assert!(check_args(f.name, f.signatures, &[Value::Real(1.0)]).is_err());
    }
}
