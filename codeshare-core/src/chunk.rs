//! Chunks: split a file into byte ranges and check incoming chunks against the declared size.

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024; // 1 MiB

/// Byte range a chunk occupies within the file: [start, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Split a file of `total_len` bytes into fixed-size ranges. The last range may be short.
pub fn split_into_chunks(total_len: u64, chunk_size: u64) -> Vec<ChunkRange> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    let mut out = Vec::new();
    let mut start = 0u64;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(ChunkRange { start, end });
        start = end;
    }
    out
}

/// Slice an in-memory payload into chunks (sender side).
pub fn chunk_slices<'a>(data: &'a [u8], chunk_size: u64) -> impl Iterator<Item = &'a [u8]> + 'a {
    split_into_chunks(data.len() as u64, chunk_size)
        .into_iter()
        .map(move |r| &data[r.start as usize..r.end as usize])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("empty chunk")]
    Empty,
    #[error("chunk of {len} bytes exceeds remaining {remaining} bytes")]
    Overflow { len: u64, remaining: u64 },
}

/// Check that a chunk of `len` bytes fits after `transferred` bytes of a `total`-byte file.
/// Returns the range the chunk will occupy.
pub fn next_range(transferred: u64, total: u64, len: u64) -> Result<ChunkRange, ChunkError> {
    if len == 0 {
        return Err(ChunkError::Empty);
    }
    let remaining = total.saturating_sub(transferred);
    if len > remaining {
        return Err(ChunkError::Overflow { len, remaining });
    }
    Ok(ChunkRange {
        start: transferred,
        end: transferred + len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_chunks() {
        let chunks = split_into_chunks(100, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], ChunkRange { start: 0, end: 30 });
        assert_eq!(chunks[3], ChunkRange { start: 90, end: 100 });
        assert_eq!(chunks[3].len(), 10);
    }

    #[test]
    fn split_exact_multiple() {
        let chunks = split_into_chunks(90, 30);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].end, 90);
    }

    #[test]
    fn split_zero_length() {
        assert!(split_into_chunks(0, 30).is_empty());
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        let chunks = split_into_chunks(DEFAULT_CHUNK_SIZE * 2, 0);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn ten_mib_in_one_mib_chunks() {
        let chunks = split_into_chunks(10 * 1024 * 1024, DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.len() == DEFAULT_CHUNK_SIZE));
    }

    #[test]
    fn slices_cover_payload_in_order() {
        let data: Vec<u8> = (0..100u8).collect();
        let joined: Vec<u8> = chunk_slices(&data, 30).flatten().copied().collect();
        assert_eq!(joined, data);
        assert_eq!(chunk_slices(&data, 30).count(), 4);
    }

    #[test]
    fn next_range_accepts_fitting_chunk() {
        let r = next_range(40, 100, 60).unwrap();
        assert_eq!(r, ChunkRange { start: 40, end: 100 });
    }

    #[test]
    fn next_range_rejects_overflow_and_empty() {
        assert_eq!(
            next_range(90, 100, 11),
            Err(ChunkError::Overflow {
                len: 11,
                remaining: 10
            })
        );
        assert_eq!(next_range(0, 100, 0), Err(ChunkError::Empty));
        assert!(matches!(
            next_range(100, 100, 1),
            Err(ChunkError::Overflow { remaining: 0, .. })
        ));
    }
}
