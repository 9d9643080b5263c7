//! Terminal output for the `sqlite-ai` binary.

mod reply;

use std::io::{self, Write};

use crossterm::queue;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

use crate::host::Value;
use crate::log::LogLevel;

pub use reply::{read_prompt, ReplyPrinter};

/// Interactive chat commands and their help text.
pub const COMMANDS: &[(&str, &str)] = &[
    ("/clear", "start a new conversation"),
    ("/save", "save the conversation"),
    ("/context", "show context usage"),
    ("/log", "show engine messages"),
    ("/help", "list commands"),
    ("/exit", "quit"),
];

/// What a piece of output is, which decides its colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Reply,
    Prompt,
    Label,
    Detail,
    Warning,
    Failure,
}

impl Tone {
    pub fn color(self) -> Color {
        match self {
            Tone::Reply => Color::Rgb {
                r: 235,
                g: 235,
                b: 235,
            },
            Tone::Prompt => Color::Rgb {
                r: 206,
                g: 66,
                b: 43,
            },
            Tone::Label => Color::DarkGrey,
            Tone::Detail => Color::Grey,
            Tone::Warning => Color::Yellow,
            Tone::Failure => Color::Red,
        }
    }

    /// Tone of an `ai_log` row from its level column.
    pub fn for_level(level: &str) -> Self {
        if level == LogLevel::Error.as_str() {
            Tone::Failure
        } else if level == LogLevel::Warn.as_str() {
            Tone::Warning
        } else {
            Tone::Detail
        }
    }
}

fn labelled(out: &mut impl Write, label: &str, tone: Tone, value: &str) {
    queue!(
        out,
        SetForegroundColor(Tone::Label.color()),
        Print(format!("  {:<10} ", label)),
        SetForegroundColor(tone.color()),
        Print(value),
        ResetColor,
        Print("\n")
    )
    .ok();
}

/// Prints labelled rows such as model facts.
pub fn print_facts(rows: &[(&str, String)]) {
    let mut stdout = io::stdout();
    for (label, value) in rows {
        labelled(&mut stdout, label, Tone::Reply, value);
    }
    stdout.flush().ok();
}

/// Prints `ai_log` rows (timestamp, level, text).
pub fn print_log(rows: &[Vec<Value>]) {
    let mut stdout = io::stdout();
    for row in rows {
        let column = |i: usize| row.get(i).and_then(Value::as_text).unwrap_or_default();
        let line = format!("{:<7} {}", column(1), column(2).trim_end());
        labelled(&mut stdout, column(0), Tone::for_level(column(1)), &line);
    }
    stdout.flush().ok();
}

pub fn print_commands() {
    let mut stdout = io::stdout();
    for (command, help) in COMMANDS {
        labelled(&mut stdout, command, Tone::Detail, help);
    }
    stdout.flush().ok();
}

pub fn print_error(message: &str) {
    let mut stdout = io::stdout();
    queue!(
        stdout,
        SetForegroundColor(Tone::Failure.color()),
        Print(format!("  error: {}\n", message)),
        ResetColor
    )
    .ok();
    stdout.flush().ok();
}

/// `context used/size (percent)`.
pub fn context_meter(used: i64, size: i64) -> String {
    let percent = if size > 0 { used * 100 / size } else { 0 };
    format!("context {}/{} ({}%)", used, size, percent)
}

pub fn format_size(size: u64) -> String {
    if size < 1_000 {
        format!("{}B", size)
    } else if size < 1_000_000 {
        format!("{:.1}KB", size as f64 / 1e3)
    } else if size < 1_000_000_000 {
        format!("{:.1}MB", size as f64 / 1e6)
    } else {
        format!("{:.1}GB", size as f64 / 1e9)
    }
}

pub fn format_token_count(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.0}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}
