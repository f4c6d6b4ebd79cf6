use super::MergeError;

/// Output buffer for a single merge call.
///
/// `capacity` is the logical size the merge budgets for, independent of the
/// allocator's own slack. It starts at the caller's estimate clamped to
/// `max_buf_size`, only grows by doubling, and never past `max_buf_size`.
#[derive(Debug)]
pub(crate) struct MergeBuffer<'a> {
    buf: Vec<u8>,
    capacity: usize,
    max_buf_size: usize,
    table_path: &'a str,
}

impl<'a> MergeBuffer<'a> {
    pub(crate) fn with_capacity(capacity: usize, max_buf_size: usize, table_path: &'a str) -> Self {
        let capacity = capacity.min(max_buf_size).max(1);
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            max_buf_size,
            table_path,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Doubles the logical capacity until `additional` more bytes fit.
    pub(crate) fn ensure(&mut self, additional: usize) -> Result<(), MergeError> {
        if self.remaining() >= additional {
            return Ok(());
        }
        let mut capacity = self.capacity;
        while capacity - self.buf.len() < additional {
            capacity = capacity.saturating_mul(2);
            if capacity > self.max_buf_size {
                return Err(MergeError::BufferOverflow {
                    table_path: self.table_path.to_owned(),
                    max_buf_size: self.max_buf_size,
                });
            }
        }
        tracing::debug!(
            table_path = self.table_path,
            used = self.buf.len(),
            from = self.capacity,
            to = capacity,
            "grow merge buffer"
        );
        self.buf.reserve_exact(capacity - self.buf.len());
        self.capacity = capacity;
        Ok(())
    }

    pub(crate) fn put_slice(&mut self, bytes: &[u8]) -> Result<(), MergeError> {
        self.ensure(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Overwrites already-written bytes at `offset`.
    pub(crate) fn patch(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        assert!(end <= self.buf.len(), "patch past written bytes");
        self.buf[offset..end].copy_from_slice(bytes);
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}
