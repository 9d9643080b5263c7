use super::{Pos, SeqId, Token};
use crate::error::{Error, Result};

/// Tokens submitted to one decode or encode call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub tokens: Vec<Token>,
    pub pos: Vec<Pos>,
    pub seq_id: Vec<SeqId>,
    /// Whether output (logits or embeddings) is requested for each token.
    pub logits: Vec<bool>,
}

impl Batch {
    pub fn with_capacity(n: usize) -> Result<Self> {
        let mut batch = Batch::default();
        let oom = |_| Error::NoMem(format!("failed to allocate batch of {} tokens", n));
        batch.tokens.try_reserve_exact(n).map_err(oom)?;
        batch.pos.try_reserve_exact(n).map_err(oom)?;
        batch.seq_id.try_reserve_exact(n).map_err(oom)?;
        batch.logits.try_reserve_exact(n).map_err(oom)?;
        Ok(batch)
    }

    /// A batch of consecutive tokens in one sequence starting at `pos0`.
    /// Only the final token requests output when `last_logits` is set.
    pub fn sequence(tokens: &[Token], pos0: Pos, seq: SeqId, last_logits: bool) -> Result<Self> {
        let mut batch = Batch::with_capacity(tokens.len())?;
        let n = tokens.len();
        for (i, &t) in tokens.iter().enumerate() {
            batch.push(t, pos0 + i as Pos, seq, last_logits && i + 1 == n);
        }
        Ok(batch)
    }

    pub fn push(&mut self, token: Token, pos: Pos, seq: SeqId, logits: bool) {
        self.tokens.push(token);
        self.pos.push(pos);
        self.seq_id.push(seq);
        self.logits.push(logits);
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.pos.clear();
        self.seq_id.clear();
        self.logits.clear();
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Index of the last token that requested output.
    pub fn output_index(&self) -> Option<usize> {
        self.logits.iter().rposition(|&l| l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_marks_only_last_token() {
        let batch = Batch::sequence(&[5, 6, 7], 10, 0, true).unwrap();
        assert_eq!(batch.pos, vec![10, 11, 12]);
        assert_eq!(batch.logits, vec![false, false, true]);
        assert_eq!(batch.output_index(), Some(2));

        let quiet = Batch::sequence(&[5, 6], 0, 0, false).unwrap();
        assert_eq!(quiet.output_index(), None);
    }
}
