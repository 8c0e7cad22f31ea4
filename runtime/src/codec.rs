//! Tensor format codec
//!
//! Translates between the caller-facing tensor layout and the accelerator's
//! aligned/transposed on-device layout. Encode never reads past the source,
//! decode never writes past the destination (the caller's original tensor).
//! A layout or transpose combination the codec does not recognize degrades
//! to a plain copy with a warning; it is never an error.

use tracing::warn;

use crate::tensor::DataType;

/// Channel alignment unit of the accelerator, in elements
pub const ALIGN_UNIT: usize = 64;

/// Inbound (host to device) data layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Layout {
    /// Identity repack padded to the alignment unit
    PreFormatter,
    /// Im2col rearrangement sized by the last two shape dims
    PreIm2col,
    /// Channel-padded to the 64-wide unit
    Formatted,
    /// Device-aligned output layout (decode direction)
    Aligned,
    /// Post-processing output, copied verbatim
    PpuFiltered,
    /// No rearrangement
    Identity,
}

/// Transpose relationship between user and encoded layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransposeKind {
    None,
    /// User tensor is channel-first, device expects channel-last
    ChannelFirstToLast,
    /// Device output is channel-last, user tensor is channel-first
    ChannelLastToFirst,
}

pub fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

fn copy_clamped(src: &[u8], dst: &mut [u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

/// Identity-style repack: copy and zero-pad the remainder of `dst`.
pub fn encode_preformatter(src: &[u8], dst: &mut [u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    dst[n..].fill(0);
}

/// Im2col rearrangement over a `(width, channel)` trailing-dims view: each of
/// the `width` rows of `channel` bytes lands on an aligned row stride.
pub fn encode_preim2col(src: &[u8], dst: &mut [u8], width: usize, channel: usize) {
    if width == 0 || channel == 0 {
        dst.fill(0);
        return;
    }
    let stride = ceil_div(channel, ALIGN_UNIT) * ALIGN_UNIT;
    dst.fill(0);
    for w in 0..width {
        let s = w * channel;
        let d = w * stride;
        if s >= src.len() || d >= dst.len() {
            break;
        }
        let take = channel.min(src.len() - s).min(dst.len() - d);
        dst[d..d + take].copy_from_slice(&src[s..s + take]);
    }
}

/// Channel-pad rows of `channel` elements to `ceil_div(channel, 64) * 64`.
///
/// The inbound path is byte-quantized, so one element is one byte here.
pub fn encode_formatted(src: &[u8], dst: &mut [u8], channel: usize) {
    if channel == 0 {
        dst.fill(0);
        return;
    }
    let aligned = ceil_div(channel, ALIGN_UNIT) * ALIGN_UNIT;
    let rows = src.len() / channel;
    dst.fill(0);
    for r in 0..rows {
        let s = r * channel;
        let d = r * aligned;
        if d >= dst.len() {
            break;
        }
        let take = channel.min(dst.len() - d);
        dst[d..d + take].copy_from_slice(&src[s..s + take]);
    }
}

/// Out-of-place transpose of a `(row, col)` matrix for 1/2/4/8-byte elements.
pub fn bidirectional_transpose(src: &[u8], dst: &mut [u8], row: usize, col: usize, elem_size: usize) {
    let needed = row * col * elem_size;
    if src.len() < needed || dst.len() < needed {
        warn!(
            src = src.len(),
            dst = dst.len(),
            needed,
            "transpose buffers too small; falling back to copy"
        );
        copy_clamped(src, dst);
        return;
    }
    match elem_size {
        1 | 2 | 4 | 8 => transpose_elems(src, dst, row, col, elem_size),
        _ => {
            warn!(elem_size, "unsupported transpose element size; falling back to copy");
            copy_clamped(src, dst);
        }
    }
}

// byte-wise so source and destination need no element alignment
fn transpose_elems(src: &[u8], dst: &mut [u8], row: usize, col: usize, elem: usize) {
    for r in 0..row {
        for c in 0..col {
            let s = (r * col + c) * elem;
            let d = (c * row + r) * elem;
            dst[d..d + elem].copy_from_slice(&src[s..s + elem]);
        }
    }
}

/// Transpose a `(row, col)` matrix, then channel-pad with `channel = row`.
///
/// Used when the input tensor is declared channel-first but the accelerator
/// expects channel-last. Output needs `col * align(row) * elem_size` bytes.
pub fn encode_formatted_transposed(
    src: &[u8],
    dst: &mut [u8],
    row: usize,
    col: usize,
    elem_size: usize,
    unit: usize,
) {
    let unit = if unit == 0 { ALIGN_UNIT } else { unit };
    if row == 0 || col == 0 || elem_size == 0 {
        dst.fill(0);
        return;
    }
    let aligned_row = ceil_div(row, unit) * unit;
    dst.fill(0);
    for c in 0..col {
        for r in 0..row {
            let s = (r * col + c) * elem_size;
            let d = (c * aligned_row + r) * elem_size;
            if s + elem_size > src.len() || d + elem_size > dst.len() {
                continue;
            }
            dst[d..d + elem_size].copy_from_slice(&src[s..s + elem_size]);
        }
    }
}

/// Reverse of [`encode_formatted`]: strip the channel padding back out.
pub fn decode_aligned(src: &[u8], dst: &mut [u8], channel: usize, dtype: DataType) {
    let elem = dtype.elem_size();
    if channel == 0 || elem == 0 {
        return;
    }
    let row_bytes = channel * elem;
    let aligned_bytes = ceil_div(channel, ALIGN_UNIT) * ALIGN_UNIT * elem;
    let rows = dst.len() / row_bytes;
    for r in 0..rows {
        let s = r * aligned_bytes;
        let d = r * row_bytes;
        if s >= src.len() {
            break;
        }
        let take = row_bytes.min(src.len() - s);
        dst[d..d + take].copy_from_slice(&src[s..s + take]);
    }
}

/// Reverse of the formatted encode plus the inverse transpose.
///
/// `shape_encoded` is the logical device-side shape; the last dimension is
/// the decoded channel, the leading dimensions collapse into rows. A
/// transpose direction other than channel-last-to-first degrades to a plain
/// decode with a warning.
pub fn decode_aligned_transposed(
    src: &[u8],
    dst: &mut [u8],
    channel: usize,
    dtype: DataType,
    shape_encoded: &[i64],
    transpose: TransposeKind,
) {
    match transpose {
        TransposeKind::ChannelLastToFirst => {}
        other => {
            warn!(?other, "unexpected transpose direction; decoding without transpose");
            decode_aligned(src, dst, channel, dtype);
            return;
        }
    }
    let elem = dtype.elem_size();
    let mut rows: usize = 1;
    for &d in &shape_encoded[..shape_encoded.len().saturating_sub(1)] {
        if d > 0 {
            rows = rows.saturating_mul(d as usize);
        }
    }
    let mut scratch = vec![0u8; rows * channel * elem];
    decode_aligned(src, &mut scratch, channel, dtype);
    bidirectional_transpose(&scratch, dst, rows, channel, elem);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preformatter_pads() {
        let src = [1u8, 2, 3];
        let mut dst = [0xffu8; 8];
        encode_preformatter(&src, &mut dst);
        assert_eq!(dst, [1, 2, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_formatted_roundtrip() {
        // 2 rows of 3 channels, padded to 64-wide rows
        let channel = 3usize;
        let src: Vec<u8> = (1..=6).collect();
        let mut enc = vec![0u8; 2 * ALIGN_UNIT];
        encode_formatted(&src, &mut enc, channel);
        assert_eq!(&enc[..3], &[1, 2, 3]);
        assert_eq!(&enc[ALIGN_UNIT..ALIGN_UNIT + 3], &[4, 5, 6]);
        assert!(enc[3..ALIGN_UNIT].iter().all(|&b| b == 0));

        let mut dec = vec![0u8; src.len()];
        decode_aligned(&enc, &mut dec, channel, DataType::Uint8);
        assert_eq!(dec, src);
    }

    #[test]
    fn test_formatted_wide_channel_roundtrip() {
        let channel = 70usize;
        let rows = 3usize;
        let src: Vec<u8> = (0..rows * channel).map(|i| (i % 251) as u8).collect();
        let aligned = ceil_div(channel, ALIGN_UNIT) * ALIGN_UNIT;
        let mut enc = vec![0u8; rows * aligned];
        encode_formatted(&src, &mut enc, channel);
        let mut dec = vec![0u8; src.len()];
        decode_aligned(&enc, &mut dec, channel, DataType::Uint8);
        assert_eq!(dec, src);
    }

    #[test]
    fn test_transpose_involution() {
        let row = 5usize;
        let col = 7usize;
        let src: Vec<u8> = (0..row * col).map(|i| i as u8).collect();
        let mut once = vec![0u8; src.len()];
        let mut twice = vec![0u8; src.len()];
        bidirectional_transpose(&src, &mut once, row, col, 1);
        bidirectional_transpose(&once, &mut twice, col, row, 1);
        assert_eq!(twice, src);
    }

    #[test]
    fn test_transpose_u32() {
        let src: Vec<u32> = vec![1, 2, 3, 4, 5, 6];
        let mut dst = vec![0u32; 6];
        bidirectional_transpose(
            bytemuck::cast_slice(&src),
            bytemuck::cast_slice_mut(&mut dst),
            2,
            3,
            4,
        );
        assert_eq!(dst, vec![1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_encode_formatted_transposed_matches_two_pass() {
        let row = 3usize;
        let col = 4usize;
        let src: Vec<u8> = (0..row * col).map(|i| i as u8 + 1).collect();

        // two-pass reference: transpose then format with channel = row
        let mut transposed = vec![0u8; src.len()];
        bidirectional_transpose(&src, &mut transposed, row, col, 1);
        let aligned_row = ceil_div(row, ALIGN_UNIT) * ALIGN_UNIT;
        let mut reference = vec![0u8; col * aligned_row];
        encode_formatted(&transposed, &mut reference, row);

        let mut fused = vec![0u8; col * aligned_row];
        encode_formatted_transposed(&src, &mut fused, row, col, 1, ALIGN_UNIT);
        assert_eq!(fused, reference);
    }

    #[test]
    fn test_decode_aligned_transposed_roundtrip() {
        // user tensor is channel-first (channel, rows); device emits
        // (rows, channel) aligned
        let rows = 4usize;
        let channel = 3usize;
        let user: Vec<u8> = (0..rows * channel).map(|i| i as u8 + 10).collect();

        // device-side encode: transpose channel-first -> channel-last, format
        let aligned = ceil_div(channel, ALIGN_UNIT) * ALIGN_UNIT;
        let mut enc = vec![0u8; rows * aligned];
        encode_formatted_transposed(&user, &mut enc, channel, rows, 1, ALIGN_UNIT);

        let mut dec = vec![0u8; user.len()];
        decode_aligned_transposed(
            &enc,
            &mut dec,
            channel,
            DataType::Uint8,
            &[1, rows as i64, channel as i64],
            TransposeKind::ChannelLastToFirst,
        );
        assert_eq!(dec, user);
    }

    #[test]
    fn test_mismatched_transpose_degrades_to_decode() {
        let channel = 2usize;
        let src: Vec<u8> = vec![1, 2, 0, 0];
        let mut dst = vec![0u8; 2];
        decode_aligned_transposed(
            &src,
            &mut dst,
            channel,
            DataType::Uint8,
            &[1, 2],
            TransposeKind::None,
        );
        assert_eq!(dst, vec![1, 2]);
    }

    #[test]
    fn test_preim2col_row_stride() {
        let width = 2usize;
        let channel = 3usize;
        let src = [1u8, 2, 3, 4, 5, 6];
        let mut dst = vec![0u8; 2 * ALIGN_UNIT];
        encode_preim2col(&src, &mut dst, width, channel);
        assert_eq!(&dst[..3], &[1, 2, 3]);
        assert_eq!(&dst[ALIGN_UNIT..ALIGN_UNIT + 3], &[4, 5, 6]);
    }

    #[test]
    fn test_random_roundtrips() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let rows = rng.gen_range(1..8usize);
            let channel = rng.gen_range(1..130usize);
            let src: Vec<u8> = (0..rows * channel).map(|_| rng.gen()).collect();
            let aligned = ceil_div(channel, ALIGN_UNIT) * ALIGN_UNIT;
            let mut enc = vec![0u8; rows * aligned];
            encode_formatted(&src, &mut enc, channel);
            let mut dec = vec![0u8; src.len()];
            decode_aligned(&enc, &mut dec, channel, DataType::Uint8);
            assert_eq!(dec, src);

            let mut once = vec![0u8; src.len()];
            let mut twice = vec![0u8; src.len()];
            bidirectional_transpose(&src, &mut once, rows, channel, 1);
            bidirectional_transpose(&once, &mut twice, channel, rows, 1);
            assert_eq!(twice, src);
        }
    }

    #[test]
    fn test_decode_never_writes_past_dst() {
        let src = vec![7u8; 2 * ALIGN_UNIT];
        let mut dst = vec![0u8; 3];
        decode_aligned(&src, &mut dst, 4, DataType::Uint8);
        // dst holds fewer than one full row; nothing is written
        assert_eq!(dst, vec![0, 0, 0]);
    }
}
