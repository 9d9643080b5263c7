use std::io::{self, BufRead, Write};
use std::time::Instant;

use crossterm::queue;
use crossterm::style::{Print, ResetColor, SetForegroundColor};

use super::{context_meter, Tone};

/// Writes `llm_chat` rows as they arrive and closes the reply with the
/// context usage of the session.
pub struct ReplyPrinter<W: Write> {
    out: W,
    rows: usize,
    started: Instant,
}

impl ReplyPrinter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ReplyPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            rows: 0,
            started: Instant::now(),
        }
    }

    pub fn row(&mut self, fragment: &str) -> io::Result<()> {
        if self.rows == 0 {
            queue!(self.out, SetForegroundColor(Tone::Reply.color()))?;
        }
        self.rows += 1;
        queue!(self.out, Print(fragment))?;
        self.out.flush()
    }

    pub fn finish(mut self, used: i64, size: i64) -> io::Result<W> {
        let secs = self.started.elapsed().as_secs_f64();
        queue!(
            self.out,
            ResetColor,
            Print("\n"),
            SetForegroundColor(Tone::Label.color()),
            Print(format!(
                "  {} · {} rows in {:.1}s\n",
                context_meter(used, size),
                self.rows,
                secs
            )),
            ResetColor
        )?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Asks for the next chat message. `None` at end of input.
pub fn read_prompt(input: &mut impl BufRead) -> Option<String> {
    let mut stdout = io::stdout();
    queue!(
        stdout,
        Print("\n"),
        SetForegroundColor(Tone::Prompt.color()),
        Print("you> "),
        ResetColor
    )
    .ok();
    stdout.flush().ok();

    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_written_in_order_then_summarized() {
        let mut printer = ReplyPrinter::new(Vec::new());
        for row in ["Hel", "lo", " ✓"] {
            printer.row(row).unwrap();
        }
        let out = String::from_utf8(printer.finish(48, 4096).unwrap()).unwrap();
        assert!(out.contains("Hello ✓"));
        assert!(out.contains("context 48/4096 (1%)"));
        assert!(out.contains("3 rows"));
    }
}
