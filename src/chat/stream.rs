use tracing::warn;

use super::Turn;
use crate::error::Result;
use crate::session::Session;

/// Pull cursor over the fragments of one assistant reply.
///
/// Each `next` call runs one decode and sample step (more only when a token
/// ends inside a multi-byte character). The reply is appended to the
/// history exactly once: by [`ChatStream::finish`], or on drop when the
/// stream is abandoned early. A stream that hit an error is rolled back
/// like a failed blocking turn.
pub struct ChatStream<'a> {
    session: &'a mut Session,
    turn: Turn,
    failed: bool,
    finished: bool,
}

impl<'a> ChatStream<'a> {
    pub(crate) fn new(session: &'a mut Session, turn: Turn) -> Self {
        Self {
            session,
            turn,
            failed: false,
            finished: false,
        }
    }

    /// True once the model ended the reply or a step failed.
    pub fn is_eof(&self) -> bool {
        self.failed || self.turn.is_done()
    }

    /// Tokens generated so far.
    pub fn token_count(&self) -> usize {
        self.turn.n_generated()
    }

    /// Closes the stream and returns the reply recorded in the history.
    pub fn finish(mut self) -> Result<String> {
        self.finalize()
    }

    fn finalize(&mut self) -> Result<String> {
        self.finished = true;
        let reply = self.session.finish_turn(&mut self.turn);
        if reply.is_err() {
            self.session.abort_turn(&self.turn);
        }
        reply
    }
}

impl Iterator for ChatStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.is_eof() {
            return None;
        }
        loop {
            match self.session.chat_step(&mut self.turn) {
                Ok(Some(fragment)) if fragment.is_empty() => {
                    if self.turn.is_done() {
                        return None;
                    }
                }
                Ok(Some(fragment)) => return Some(Ok(fragment)),
                Ok(None) => return None,
                Err(e) => {
                    self.failed = true;
                    self.session.abort_turn(&self.turn);
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Drop for ChatStream<'_> {
    fn drop(&mut self) {
        if self.finished || self.failed {
            return;
        }
        if let Err(e) = self.finalize() {
            warn!(error = %e, "failed to record streamed chat reply");
        }
    }
}
