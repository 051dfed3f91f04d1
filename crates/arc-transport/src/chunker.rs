/// Payload chunking and reassembly.
///
/// Shared by every endpoint and by the simulator's auto-chunking path.
/// Chunks are contiguous, `max_chunk_size`-bounded slices; only the last
/// one may be shorter.
use std::collections::HashMap;

use crate::error::TransportError;

/// Split `payload` into `ceil(len / max_chunk_size)` contiguous slices.
///
/// Payloads that already fit (including the empty payload) come back as a
/// single slice.
pub fn chunk(payload: &[u8], max_chunk_size: usize) -> Result<Vec<&[u8]>, TransportError> {
    if max_chunk_size == 0 {
        return Err(TransportError::InvalidChunkSize {
            size: max_chunk_size,
        });
    }

    if payload.len() <= max_chunk_size {
        return Ok(vec![payload]);
    }

    Ok(payload.chunks(max_chunk_size).collect())
}

/// Number of chunks `chunk()` produces for a payload of `len` bytes.
pub fn chunk_count(len: usize, max_chunk_size: usize) -> usize {
    if max_chunk_size == 0 || len <= max_chunk_size {
        return 1;
    }
    len.div_ceil(max_chunk_size)
}

/// Rebuild a payload from `(index, bytes)` pairs.
///
/// Duplicate indices overwrite (last write wins). The indexed set must
/// cover exactly `[0, expected_total)`.
pub fn reassemble<I>(
    chunks: I,
    expected_total: u32,
    max_chunk_size: usize,
) -> Result<Vec<u8>, TransportError>
where
    I: IntoIterator<Item = (u32, Vec<u8>)>,
{
    if expected_total == 0 {
        return Err(TransportError::MissingChunks {
            expected: 0,
            received: 0,
        });
    }

    let mut buffer: HashMap<u32, Vec<u8>> = HashMap::new();
    for (index, bytes) in chunks {
        if bytes.len() > max_chunk_size {
            return Err(TransportError::ChunkTooLarge {
                index,
                size: bytes.len(),
                max: max_chunk_size,
            });
        }
        buffer.insert(index, bytes);
    }

    join_in_order(buffer, expected_total)
}

/// Concatenate `0..expected_total` from an index map.
pub(crate) fn join_in_order(
    mut buffer: HashMap<u32, Vec<u8>>,
    expected_total: u32,
) -> Result<Vec<u8>, TransportError> {
    let complete = buffer.len() == expected_total as usize
        && (0..expected_total).all(|idx| buffer.contains_key(&idx));
    if !complete {
        return Err(TransportError::MissingChunks {
            expected: expected_total,
            received: buffer.len(),
        });
    }

    let mut out = Vec::with_capacity(buffer.values().map(Vec::len).sum());
    for idx in 0..expected_total {
        if let Some(part) = buffer.remove(&idx) {
            out.extend_from_slice(&part);
        }
    }
    Ok(out)
}
