//! Append-only byte buffer shared by the embedding, chat and text
//! generation paths.
//!
//! Growth is amortised doubling plus a fixed slack, and every reservation
//! goes through `try_reserve` so allocation failure surfaces as
//! [`Error::NoMem`] instead of aborting the process.

use crate::error::{Error, Result};

const MIN_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut buffer = Self::new();
        buffer.reserve_total(capacity.max(MIN_BUFFER_SIZE))?;
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let needed = self.data.len() + bytes.len();
        if needed > self.data.capacity() {
            let grown = (self.data.capacity() * 2).max(needed + MIN_BUFFER_SIZE);
            self.reserve_total(grown)?;
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn append_str(&mut self, text: &str) -> Result<()> {
        self.append(text.as_bytes())
    }

    /// Replaces the contents, keeping the allocation.
    pub fn set(&mut self, bytes: &[u8]) -> Result<()> {
        self.data.clear();
        self.append(bytes)
    }

    pub fn reset(&mut self) {
        self.data.clear();
    }

    /// Bytes from `start` to the end, or an empty slice if `start` is past it.
    pub fn tail(&self, start: usize) -> &[u8] {
        self.data.get(start..).unwrap_or(&[])
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    fn reserve_total(&mut self, total: usize) -> Result<()> {
        let additional = total.saturating_sub(self.data.len());
        self.data.try_reserve_exact(additional).map_err(|_| {
            Error::NoMem(format!("failed to grow buffer to {} bytes", total))
        })
    }
}

/// Allocates a zeroed vector, reporting allocation failure as an error.
pub(crate) fn try_zeroed<T: Clone + Default>(len: usize, what: &str) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| Error::NoMem(format!("failed to allocate {} ({} elements)", what, len)))?;
    v.resize(len, T::default());
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_grows_past_initial_capacity() {
        let mut buffer = Buffer::with_capacity(16).unwrap();
        assert!(buffer.capacity() >= MIN_BUFFER_SIZE);

        let chunk = vec![b'x'; 3000];
        for _ in 0..5 {
            buffer.append(&chunk).unwrap();
        }
        assert_eq!(buffer.len(), 15000);
        assert!(buffer.capacity() >= 15000);
    }

    #[test]
    fn tail_past_end_is_empty() {
        let mut buffer = Buffer::new();
        buffer.append_str("hello").unwrap();
        assert_eq!(buffer.tail(2), b"llo");
        assert_eq!(buffer.tail(5), b"");
        assert_eq!(buffer.tail(10), b"");
    }

    #[test]
    fn set_replaces_contents() {
        let mut buffer = Buffer::new();
        buffer.append_str("first").unwrap();
        buffer.set(b"second").unwrap();
        assert_eq!(buffer.as_bytes(), b"second");
        buffer.reset();
        assert!(buffer.is_empty());
    }

    #[test]
    fn huge_allocation_reports_no_mem() {
        let err = try_zeroed::<u8>(usize::MAX / 2, "tokens").unwrap_err();
        assert!(matches!(err, Error::NoMem(_)));
    }
}
