use crate::structures::{SENTINEL_INDEX, SENTINEL_KEY};

/// Files at or above this size are rejected before anything is read.
pub const MAX_PLY_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Clipping radius used when none is configured.
pub const DEFAULT_CLIPPING_RADIUS: f32 = 4.0;

/// Threads per workgroup of every compute kernel in `shaders/`.
pub const WORKGROUP_SIZE: u32 = 256;

const MAX_WORKGROUPS_PER_DIM: u32 = 65535;

#[inline]
pub(crate) fn next_line<'b>(buffer: &'b [u8], offset: &mut usize) -> Option<&'b [u8]> {
    if *offset >= buffer.len() {
        return None;
    }
    let start = *offset;

    let line = match memchr::memchr(b'\n', &buffer[start..]) {
        Some(pos) => {
            *offset = start + pos + 1;
            &buffer[start..start + pos]
        }
        None => {
            *offset = buffer.len();
            &buffer[start..]
        }
    };
    Some(line.strip_suffix(b"\r").unwrap_or(line))
}

/// Number of sort slots for `count` splats.
#[inline]
pub fn padded_capacity(count: u32) -> u32 {
    count.max(1).next_power_of_two()
}

/// Workgroup grid covering `threads` invocations, folded into y past the
/// per-dimension limit. Kernels rebuild the linear id from `num_workgroups`.
pub(crate) fn dispatch_size(threads: u32) -> (u32, u32) {
    let groups = threads.div_ceil(WORKGROUP_SIZE).max(1);
    if groups <= MAX_WORKGROUPS_PER_DIM {
        (groups, 1)
    } else {
        (MAX_WORKGROUPS_PER_DIM, groups.div_ceil(MAX_WORKGROUPS_PER_DIM))
    }
}

#[inline]
pub(crate) const fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Key and value arrays as the init kernel leaves them: identity indices for
/// real splats, sentinels in the padding tail.
pub fn initial_sort_pairs(count: u32) -> (Vec<f32>, Vec<u32>) {
    let capacity = padded_capacity(count);
    let keys = (0..capacity)
        .map(|i| if i < count { 0.0 } else { SENTINEL_KEY })
        .collect();
    let values = (0..capacity)
        .map(|i| if i < count { i } else { SENTINEL_INDEX })
        .collect();
    (keys, values)
}
