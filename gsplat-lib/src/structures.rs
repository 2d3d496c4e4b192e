use glam::Vec3;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of spherical-harmonic bands stored per splat (degree 3, DC excluded).
pub const SH_COUNT: usize = 15;
/// Scalars in the SH block, three color channels per band.
pub const SH_FLOATS: usize = SH_COUNT * 3;
/// Float offset of the SH block inside a record.
pub const SH_START_OFFSET: usize = 9;
/// Float offset of the opacity scalar inside a record.
pub const OPACITY_OFFSET: usize = SH_START_OFFSET + SH_FLOATS;

/// Scalars per record.
pub const RECORD_FLOATS: usize = size_of::<SplatRecord>() / 4;

/// Position culled splats are moved to, far outside any view volume.
pub const SENTINEL_POSITION: [f32; 3] = [100000.0; 3];

/// Key stored in padding slots of the sort buffers.
pub const SENTINEL_KEY: f32 = f32::MAX;
/// Largest key a live splat can get. Non-finite depths are clamped to it so
/// they still sort ahead of the padding.
pub const MAX_LIVE_KEY: f32 = 3.0e38;
/// Value stored in padding slots of the sort buffers.
pub const SENTINEL_INDEX: u32 = u32::MAX;

/// One splat exactly as it is laid out in the PLY payload.
///
/// The SH block is planar in the file (all red bands, then green, then blue)
/// and interleaved per band once [`crate::preprocess::reorder_sh`] has run.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SplatRecord {
    pub pos: [f32; 3],
    pub nor: [f32; 3],
    pub dc0: [f32; 3],
    pub sh: [f32; SH_FLOATS],
    pub opacity: f32,
    pub scale: [f32; 3],
    pub rot: [f32; 4],
}

const _: () = assert!(size_of::<SplatRecord>() == 248);

impl SplatRecord {
    #[inline]
    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.pos)
    }

    /// Scalar at float offset `index`, or `None` past the end of the record.
    pub fn scalar(&self, index: usize) -> Option<f32> {
        let bytes = self.as_bytes().get(index * 4..index * 4 + 4)?;
        f32::read_from_bytes(bytes).ok()
    }

    /// RGB coefficient of `band`, valid once the SH block is interleaved.
    pub fn sh_coeff(&self, band: usize) -> Option<[f32; 3]> {
        let c = self.sh.get(band * 3..band * 3 + 3)?;
        Some([c[0], c[1], c[2]])
    }
}

/// A loaded splat set. Index position is the identity shared by every GPU buffer.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SplatCloud {
    pub records: Vec<SplatRecord>,
}

impl SplatCloud {
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn positions(&self) -> Vec<[f32; 3]> {
        self.records.iter().map(|r| r.pos).collect()
    }

    /// Bounds over all positions, `None` for an empty cloud.
    pub fn bounds(&self) -> Option<Bounds> {
        let first = self.records.first()?.position();
        let bounds = self.records[1..]
            .iter()
            .fold(Bounds::new(first, first), |b, r| b.encapsulate(r.position()));
        Some(bounds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn encapsulate(self, p: Vec3) -> Self {
        Self {
            min: self.min.min(p),
            max: self.max.max(p),
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Mirrors the box along z into the renderer's depth convention.
    pub fn flip_z(self) -> Self {
        Self {
            min: Vec3::new(self.min.x, self.min.y, -self.max.z),
            max: Vec3::new(self.max.x, self.max.y, -self.min.z),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    #[test]
    fn record_matches_file_layout() {
        assert_eq!(RECORD_FLOATS, 62);
        assert_eq!(OPACITY_OFFSET, 54);
        assert_eq!(std::mem::offset_of!(SplatRecord, sh), SH_START_OFFSET * 4);
        assert_eq!(std::mem::offset_of!(SplatRecord, opacity), OPACITY_OFFSET * 4);
        assert_eq!(std::mem::offset_of!(SplatRecord, rot), 58 * 4);
    }

    #[test]
    fn scalar_access_is_bounds_checked() {
        let mut r = SplatRecord::new_zeroed();
        r.opacity = 0.25;
        r.rot = [1.0, 0.0, 0.0, 0.5];
        assert_eq!(r.scalar(OPACITY_OFFSET), Some(0.25));
        assert_eq!(r.scalar(61), Some(0.5));
        assert_eq!(r.scalar(62), None);
    }

    #[test]
    fn bounds_flip_keeps_extents() {
        let cloud = SplatCloud {
            records: [[1.0, -2.0, 3.0], [-1.0, 4.0, 5.0]]
                .into_iter()
                .map(|pos| SplatRecord {
                    pos,
                    ..SplatRecord::new_zeroed()
                })
                .collect(),
        };
        let b = cloud.bounds().expect("non-empty");
        assert_eq!(b.center(), Vec3::new(0.0, 1.0, 4.0));

        let flipped = b.flip_z();
        assert_eq!(flipped.center(), Vec3::new(0.0, 1.0, -4.0));
        assert_eq!(flipped.extents(), b.extents());
        assert!(SplatCloud::default().bounds().is_none());
    }
}
