//! Chat templates embedded in GGUF files are Jinja programs.

use anyhow::{anyhow, Result};
use minijinja::{context, Environment, Error, ErrorKind};

use crate::engine::ChatMessage;

const TEMPLATE_NAME: &str = "chat";

/// Special token texts the templates refer to.
#[derive(Debug, Clone, Default)]
pub struct SpecialTokens {
    pub bos_token: String,
    pub eos_token: String,
}

fn raise_exception(message: String) -> Result<String, Error> {
    Err(Error::new(ErrorKind::InvalidOperation, message))
}

fn environment(source: &str) -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.set_recursion_limit(100);
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_function("raise_exception", raise_exception);
    env.add_template_owned(TEMPLATE_NAME, source.to_string())
        .map_err(|e| anyhow!("Invalid template syntax: {}", e))?;
    Ok(env)
}

pub fn render(
    source: &str,
    tokens: &SpecialTokens,
    messages: &[ChatMessage],
    add_generation_prompt: bool,
) -> Result<String> {
    let env = environment(source)?;
    let template = env
        .get_template(TEMPLATE_NAME)
        .map_err(|e| anyhow!("Template retrieval error: {}", e))?;
    template
        .render(context!(
            messages => messages,
            add_generation_prompt => add_generation_prompt,
            bos_token => tokens.bos_token.as_str(),
            eos_token => tokens.eos_token.as_str()
        ))
        .map_err(|e| anyhow!("Template render error: {}", e))
}
