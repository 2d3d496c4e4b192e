//! In-place fixups applied to freshly decoded records before upload.

use tracing::debug;

use crate::structures::{SplatRecord, SENTINEL_POSITION, SH_COUNT, SH_FLOATS};

/// Reorders the SH block of every record from planar (all red bands, then
/// green, then blue) to interleaved RGB per band.
pub fn reorder_sh(records: &mut [SplatRecord]) {
    let mut tmp = [0.0f32; SH_FLOATS];
    for record in records.iter_mut() {
        for j in 0..SH_COUNT {
            tmp[j * 3] = record.sh[j];
            tmp[j * 3 + 1] = record.sh[j + SH_COUNT];
            tmp[j * 3 + 2] = record.sh[j + SH_COUNT * 2];
        }
        record.sh = tmp;
    }
}

/// Moves every splat farther than `max_dist` from the origin, or with a
/// non-finite position, to [`SENTINEL_POSITION`]. Records are never removed,
/// so indices stay stable.
/// Returns the number of relocated splats.
pub fn remove_distant_splats(records: &mut [SplatRecord], max_dist: f32) -> usize {
    let max_dist = f64::from(max_dist);
    let mut relocated = 0;
    for record in records.iter_mut() {
        let [x, y, z] = record.pos.map(f64::from);
        let norm = (x * x + y * y + z * z).sqrt();
        if !norm.is_finite() || norm > max_dist {
            record.pos = SENTINEL_POSITION;
            relocated += 1;
        }
    }

    debug!(relocated, max_dist, "Pushed distant splats out of view");
    relocated
}
