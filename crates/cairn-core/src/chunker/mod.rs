use fastcdc::v2020::FastCDC;

/// Chunk-size policy for content-defined chunking.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerParams {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for ChunkerParams {
    fn default() -> Self {
        // ~1 MiB preferred chunk size.
        Self {
            min_size: 256 * 1024,
            avg_size: 1024 * 1024,
            max_size: 4 * 1024 * 1024,
        }
    }
}

/// One raw content-defined chunk: a window into the source buffer
/// plus its position in the chunk sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawChunk {
    pub seq: u64,
    pub offset: usize,
    pub length: usize,
}

/// Split a byte slice into content-defined chunks using FastCDC.
/// Boundaries depend on content, not offsets, so localized edits leave
/// the chunk sequence of unaffected regions intact. Sequence numbers
/// are contiguous from zero.
pub fn chunk_data(data: &[u8], params: &ChunkerParams) -> Vec<RawChunk> {
    FastCDC::new(data, params.min_size, params.avg_size, params.max_size)
        .enumerate()
        .map(|(seq, chunk)| RawChunk {
            seq: seq as u64,
            offset: chunk.offset,
            length: chunk.length,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random(len: usize) -> Vec<u8> {
        let mut state = 0x2545F4914F6CDD1Du64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state & 0xFF) as u8
            })
            .collect()
    }

    #[test]
    fn chunks_cover_input_contiguously() {
        let data = pseudo_random(10 * 1024 * 1024);
        let chunks = chunk_data(&data, &ChunkerParams::default());
        assert!(chunks.len() > 1);
        let mut expected_offset = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.seq, i as u64);
            assert_eq!(chunk.offset, expected_offset);
            expected_offset += chunk.length;
        }
        assert_eq!(expected_offset, data.len());
    }

    #[test]
    fn boundaries_survive_a_localized_edit() {
        let data = pseudo_random(8 * 1024 * 1024);
        let mut edited = data.clone();
        edited[42] ^= 0xFF;

        let params = ChunkerParams::default();
        let a = chunk_data(&data, &params);
        let b = chunk_data(&edited, &params);
        // All chunks after the edited region line up again.
        assert_eq!(a.last(), b.last());
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_data(&[], &ChunkerParams::default()).is_empty());
    }

    #[test]
    fn small_input_is_one_chunk() {
        let data = pseudo_random(1000);
        let chunks = chunk_data(&data, &ChunkerParams::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].length, 1000);
    }
}
