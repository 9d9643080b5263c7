use std::io;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sqlite_ai::cli::{
    context_meter, format_size, format_token_count, print_commands, print_error, print_facts,
    print_log, read_prompt, ReplyPrinter,
};
use sqlite_ai::engine::candle::CandleBackend;
use sqlite_ai::host::{Extension, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to GGUF model file
    #[arg(short, long)]
    model: String,

    /// Model options, e.g. "gpu_layers=0,use_mmap=1"
    #[arg(long)]
    model_options: Option<String>,

    /// Context options, e.g. "context_size=2048,n_predict=128"
    #[arg(short, long)]
    options: Option<String>,

    /// Record INFO-level engine messages in the log
    #[arg(long)]
    verbose_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print model facts
    Info,

    /// Continue a prompt
    Generate {
        prompt: String,
    },

    /// Compute the embedding of a text and print it as JSON
    Embed {
        text: String,
    },

    /// Chat with the model
    Chat {
        /// System prompt for the conversation
        #[arg(short, long)]
        system: Option<String>,

        /// Answer one message and exit
        #[arg(short, long)]
        prompt: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sqlite_ai=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut ext = Extension::new(Arc::new(CandleBackend::new()));
    if args.verbose_log {
        ext.call("llm_log_info", &[Value::Integer(1)])?;
    }

    let mut load_args = vec![Value::from(args.model.as_str())];
    if let Some(options) = &args.model_options {
        load_args.push(Value::from(options.as_str()));
    }
    if let Err(e) = ext.call("llm_model_load", &load_args) {
        print_error(&e.to_string());
        show_log(&mut ext);
        return Err(e.into());
    }

    let context_args: Vec<Value> = args.options.iter().map(|o| Value::from(o.as_str())).collect();

    let result = run(&mut ext, args.command, &context_args);

    if let Err(e) = &result {
        print_error(&e.to_string());
        show_log(&mut ext);
    }
    result.map_err(Into::into)
}

fn run(ext: &mut Extension, command: Command, context_args: &[Value]) -> sqlite_ai::Result<()> {
    match command {
        Command::Info => info(ext),
        Command::Generate { prompt } => {
            ext.call("llm_context_create_textgen", context_args)?;
            let text = ext.call("llm_text_generate", &[Value::from(prompt)])?;
            println!("{}", text.as_text().unwrap_or_default());
            Ok(())
        }
        Command::Embed { text } => {
            ext.call("llm_context_create_embedding", context_args)?;
            let json = ext.call(
                "llm_embed_generate",
                &[Value::from(text), Value::from("json_output=1")],
            )?;
            println!("{}", json.as_text().unwrap_or_default());
            Ok(())
        }
        Command::Chat { system, prompt } => {
            ext.call("llm_context_create_chat", context_args)?;
            ext.call("llm_chat_create", &[])?;
            if let Some(system) = system {
                ext.call("llm_chat_system_prompt", &[Value::from(system)])?;
            }
            match prompt {
                Some(prompt) => respond(ext, &prompt),
                None => {
                    print_commands();
                    interactive_mode(ext)
                }
            }
        }
    }
}

fn info(ext: &mut Extension) -> sqlite_ai::Result<()> {
    let int = |ext: &mut Extension, name: &str| -> sqlite_ai::Result<i64> {
        Ok(ext.call(name, &[])?.as_integer().unwrap_or_default())
    };
    let desc = ext.call("llm_model_desc", &[])?;
    let template = ext.call("llm_model_chat_template", &[])?;
    print_facts(&[
        ("Model", desc.as_text().unwrap_or_default().to_string()),
        ("Size", format_size(int(ext, "llm_model_size")?.max(0) as u64)),
        (
            "Params",
            format_token_count(int(ext, "llm_model_n_params")?.max(0) as u64),
        ),
        ("Layers", int(ext, "llm_model_n_layer")?.to_string()),
        ("Embedding", int(ext, "llm_model_n_embd")?.to_string()),
        ("Heads", int(ext, "llm_model_n_head")?.to_string()),
        ("Context", int(ext, "llm_model_n_ctx_train")?.to_string()),
        (
            "Template",
            if template.is_null() { "none" } else { "embedded" }.to_string(),
        ),
    ]);
    Ok(())
}

/// Streams one reply through the `llm_chat` table source.
fn respond(ext: &mut Extension, prompt: &str) -> sqlite_ai::Result<()> {
    let mut printer = ReplyPrinter::stdout();
    {
        let cursor = ext.open_table("llm_chat", &[Value::from(prompt)])?;
        for row in cursor {
            if let Some(fragment) = row?.first().and_then(Value::as_text) {
                printer.row(fragment).ok();
            }
        }
    }
    let (used, size) = context_usage(ext)?;
    printer.finish(used, size).ok();
    Ok(())
}

fn context_usage(ext: &mut Extension) -> sqlite_ai::Result<(i64, i64)> {
    let used = ext.call("llm_context_used", &[])?.as_integer().unwrap_or(0);
    let size = ext.call("llm_context_size", &[])?.as_integer().unwrap_or(0);
    Ok((used, size))
}

fn interactive_mode(ext: &mut Extension) -> sqlite_ai::Result<()> {
    let mut input = io::stdin().lock();

    while let Some(line) = read_prompt(&mut input) {
        match line.as_str() {
            "" => continue,
            "/exit" | "/quit" => break,
            "/help" => print_commands(),
            "/clear" => {
                ext.call("llm_chat_create", &[])?;
                print_facts(&[("chat", "new conversation".to_string())]);
            }
            "/save" => {
                let id = ext.call("llm_chat_save", &[])?;
                print_facts(&[("saved", id.as_text().unwrap_or_default().to_string())]);
            }
            "/context" => {
                let (used, size) = context_usage(ext)?;
                print_facts(&[("context", context_meter(used, size))]);
            }
            "/log" => show_log(ext),
            text => {
                if let Err(e) = respond(ext, text) {
                    print_error(&e.to_string());
                }
            }
        }
    }

    Ok(())
}

fn show_log(ext: &mut Extension) {
    let rows: Vec<Vec<Value>> = match ext.open_table("ai_log", &[]) {
        Ok(cursor) => cursor.filter_map(|r| r.ok()).collect(),
        Err(_) => return,
    };
    print_log(&rows);
}
