// Shared binary reading utilities for record source parsers
//
// Slice-based readers with bounds checking. Binary property lists are
// big-endian throughout.

// =============================================================================
// Slice Readers
// =============================================================================

fn take<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], String> {
    let end = offset
        .checked_add(N)
        .ok_or_else(|| format!("Offset overflow at {}", offset))?;
    data.get(offset..end)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| format!("Read of {} bytes at offset {} past end ({} bytes)", N, offset, data.len()))
}

/// Read a single byte at offset
pub fn read_u8_at(data: &[u8], offset: usize) -> Result<u8, String> {
    data.get(offset)
        .copied()
        .ok_or_else(|| format!("Failed to read u8 at offset {}", offset))
}

/// Read u16 big-endian at offset
pub fn read_u16_be_at(data: &[u8], offset: usize) -> Result<u16, String> {
    take::<2>(data, offset).map(u16::from_be_bytes)
}

/// Read u32 big-endian at offset
pub fn read_u32_be_at(data: &[u8], offset: usize) -> Result<u32, String> {
    take::<4>(data, offset).map(u32::from_be_bytes)
}

/// Read u64 big-endian at offset
pub fn read_u64_be_at(data: &[u8], offset: usize) -> Result<u64, String> {
    take::<8>(data, offset).map(u64::from_be_bytes)
}

/// Read an unsigned big-endian integer of 1, 2, 4 or 8 bytes
pub fn read_uint_be_at(data: &[u8], offset: usize, width: usize) -> Result<u64, String> {
    match width {
        1 => read_u8_at(data, offset).map(u64::from),
        2 => read_u16_be_at(data, offset).map(u64::from),
        4 => read_u32_be_at(data, offset).map(u64::from),
        8 => read_u64_be_at(data, offset),
        _ => Err(format!("Unsupported integer width {}", width)),
    }
}

/// Borrow `len` bytes at offset
pub fn read_bytes_at(data: &[u8], offset: usize, len: usize) -> Result<&[u8], String> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| format!("Offset overflow at {}", offset))?;
    data.get(offset..end)
        .ok_or_else(|| format!("Read of {} bytes at offset {} past end ({} bytes)", len, offset, data.len()))
}
