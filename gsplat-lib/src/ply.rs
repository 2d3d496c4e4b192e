use std::fs;
use std::io::{self, Write};
use std::path::Path;

use foldhash::HashMap;
use tracing::{debug, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::common::next_line;
use crate::error::{Result, SplatError};
use crate::structures::{SplatCloud, SplatRecord, SH_FLOATS};

/// Scalar types a PLY property may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Float,
    Double,
    UChar,
    /// Any other type name. Contributes nothing to the stride.
    Unknown,
}

impl PropertyKind {
    fn parse(token: &str) -> Self {
        match token {
            "float" => PropertyKind::Float,
            "double" => PropertyKind::Double,
            "uchar" => PropertyKind::UChar,
            _ => PropertyKind::Unknown,
        }
    }

    pub const fn size(self) -> usize {
        match self {
            PropertyKind::Float => 4,
            PropertyKind::Double => 8,
            PropertyKind::UChar => 1,
            PropertyKind::Unknown => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlyProperty {
    pub name: String,
    pub kind: PropertyKind,
}

#[derive(Debug, Clone, Default)]
pub struct PlyHeader {
    pub vertex_count: usize,
    /// Bytes per vertex, the sum of all declared property widths.
    pub stride: usize,
    pub properties: Vec<PlyProperty>,
    offsets: HashMap<String, usize>,
}

impl PlyHeader {
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|p| p.name.as_str())
    }

    /// Byte offset of a field inside one vertex.
    pub fn field_offset(&self, name: &str) -> Option<usize> {
        self.offsets.get(name).copied()
    }

    /// `vertex_count * stride`, the exact payload size.
    pub fn payload_len(&self) -> Result<usize> {
        self.vertex_count
            .checked_mul(self.stride)
            .ok_or_else(|| SplatError::ParseHeader("Overflow in byte calculation".to_string()))
    }
}

/// Parsed header plus exactly `vertex_count * stride` payload bytes.
#[derive(Debug, Clone)]
pub struct PlyData {
    pub header: PlyHeader,
    pub payload: Vec<u8>,
}

impl PlyData {
    /// Splits a whole file read into memory into header and payload.
    pub fn from_bytes(mut raw: Vec<u8>) -> Result<Self> {
        let (header, offset) = parse_header(&raw)?;
        let expected = header.payload_len()?;
        let found = raw.len() - offset;
        if found < expected {
            return Err(SplatError::Truncated { expected, found });
        }

        raw.drain(..offset);
        raw.truncate(expected);
        Ok(Self {
            header,
            payload: raw,
        })
    }
}

fn header_str(line: &[u8]) -> Result<&str> {
    std::str::from_utf8(line)
        .map_err(|e| SplatError::ParseHeader(format!("UTF-8 error: {}", e)))
}

/// Parses the ASCII header, returning it with the offset of the first payload byte.
pub fn parse_header(raw: &[u8]) -> Result<(PlyHeader, usize)> {
    let mut offset = 0;

    let first = next_line(raw, &mut offset)
        .ok_or_else(|| SplatError::ParseHeader("No 'ply' line".to_string()))?;
    if first != b"ply" {
        return Err(SplatError::ParseHeader(
            "Not a .ply file (missing 'ply' header)".to_string(),
        ));
    }

    let mut header = PlyHeader::default();
    loop {
        let line = next_line(raw, &mut offset).ok_or_else(|| {
            SplatError::ParseHeader("No 'end_header' found before EOF".to_string())
        })?;
        if line == b"end_header" {
            break;
        }

        let tokens: Vec<&str> = header_str(line)?.split_whitespace().collect();
        match tokens.as_slice() {
            ["format", format, ..] if *format != "binary_little_endian" => {
                return Err(SplatError::ParseHeader(format!(
                    "Unsupported .ply format '{}' (only binary_little_endian is supported)",
                    format
                )));
            }
            ["element", "vertex", count] => {
                header.vertex_count = count.parse().map_err(|e| {
                    SplatError::ParseHeader(format!("Bad vertex count '{}': {}", count, e))
                })?;
            }
            ["property", kind, name] => {
                let kind = PropertyKind::parse(kind);
                if kind == PropertyKind::Unknown {
                    warn!(property = *name, "Unknown property type, it adds no bytes to the stride");
                }
                header.offsets.insert(name.to_string(), header.stride);
                header.stride += kind.size();
                header.properties.push(PlyProperty {
                    name: name.to_string(),
                    kind,
                });
            }
            _ => {}
        }
    }

    debug!(
        vertex_count = header.vertex_count,
        stride = header.stride,
        fields = header.properties.len(),
        "Parsed PLY header"
    );
    Ok((header, offset))
}

fn file_size(path: &Path, metadata: io::Result<fs::Metadata>) -> Result<u64> {
    match metadata {
        Ok(m) => Ok(m.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(SplatError::FileNotFound(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

#[inline]
fn check_size(size: u64, max_size: u64) -> Result<()> {
    if size >= max_size {
        return Err(SplatError::FileTooLarge {
            size,
            limit: max_size,
        });
    }
    Ok(())
}

/// Reads a binary PLY file. Files of `max_size` bytes or more are rejected
/// from their metadata, before the payload is touched.
pub fn read_file(path: impl AsRef<Path>, max_size: u64) -> Result<PlyData> {
    let path = path.as_ref();
    let size = file_size(path, fs::metadata(path))?;
    check_size(size, max_size)?;

    PlyData::from_bytes(fs::read(path)?)
}

cfg_if::cfg_if! {
if #[cfg(feature = "async")] {
    /// [`read_file`] on top of `tokio::fs`.
    pub async fn read_file_async(path: impl AsRef<Path>, max_size: u64) -> Result<PlyData> {
        let path = path.as_ref();
        let size = file_size(path, tokio::fs::metadata(path).await)?;
        check_size(size, max_size)?;

        PlyData::from_bytes(tokio::fs::read(path).await?)
    }
}
}

impl SplatCloud {
    /// Decodes the payload into owned records. The declared stride must equal
    /// the size of [`SplatRecord`]; field names are not checked.
    pub fn from_ply(data: PlyData) -> Result<Self> {
        let PlyData { header, payload } = data;
        if header.vertex_count == 0 {
            return Ok(SplatCloud::default());
        }

        let expected = size_of::<SplatRecord>();
        if header.stride != expected {
            return Err(SplatError::StrideMismatch {
                expected,
                found: header.stride,
            });
        }

        let records = payload
            .chunks_exact(expected)
            .map(|chunk| {
                SplatRecord::read_from_bytes(chunk).map_err(|_| SplatError::StrideMismatch {
                    expected,
                    found: chunk.len(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SplatCloud { records })
    }
}

/// Writes records as a binary PLY with the field list the loader expects.
/// The SH block is written as stored, so pass records in file (planar) order.
pub fn write_ply(output: &mut Vec<u8>, records: &[SplatRecord]) -> Result<()> {
    output.clear();
    output.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
    writeln!(output, "element vertex {}", records.len())?;
    output.extend_from_slice(
        b"property float x\nproperty float y\nproperty float z\n\
          property float nx\nproperty float ny\nproperty float nz\n\
          property float f_dc_0\nproperty float f_dc_1\nproperty float f_dc_2\n",
    );
    for i in 0..SH_FLOATS {
        writeln!(output, "property float f_rest_{}", i)?;
    }
    output.extend_from_slice(
        b"property float opacity\n\
          property float scale_0\nproperty float scale_1\nproperty float scale_2\n\
          property float rot_0\nproperty float rot_1\nproperty float rot_2\nproperty float rot_3\n\
          end_header\n",
    );

    output.extend_from_slice(records.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    fn record(i: usize) -> SplatRecord {
        let mut r = SplatRecord::new_zeroed();
        r.pos = [i as f32, 0.5, -1.0];
        r.opacity = 0.1 * i as f32;
        r.rot = [1.0, 0.0, 0.0, 0.0];
        for (k, v) in r.sh.iter_mut().enumerate() {
            *v = (i * 100 + k) as f32;
        }
        r
    }

    #[test]
    fn header_stride_is_sum_of_declared_widths() {
        let data = b"ply\nformat binary_little_endian 1.0\ncomment made by hand\n\
element vertex 7\nproperty float x\nproperty double t\nproperty uchar red\n\
property float y\nend_header\n";
        let (header, offset) = parse_header(data).expect("valid header");
        assert_eq!(header.vertex_count, 7);
        assert_eq!(header.stride, 4 + 8 + 1 + 4);
        assert_eq!(offset, data.len());
        assert_eq!(
            header.field_names().collect::<Vec<_>>(),
            vec!["x", "t", "red", "y"]
        );
        assert_eq!(header.field_offset("red"), Some(12));
        assert_eq!(header.field_offset("y"), Some(13));
        assert_eq!(header.field_offset("z"), None);
    }

    #[test]
    fn unknown_property_types_add_nothing() {
        let data = b"ply\nelement vertex 1\nproperty half h\nproperty float x\nend_header\n";
        let (header, _) = parse_header(data).expect("valid header");
        assert_eq!(header.stride, 4);
        assert_eq!(header.properties[0].kind, PropertyKind::Unknown);
    }

    #[test]
    fn header_errors() {
        assert!(matches!(
            parse_header(b"obj\nend_header\n"),
            Err(SplatError::ParseHeader(_))
        ));
        assert!(matches!(
            parse_header(b"ply\nelement vertex 3\n"),
            Err(SplatError::ParseHeader(_))
        ));
        assert!(matches!(
            parse_header(b"ply\nformat ascii 1.0\nend_header\n"),
            Err(SplatError::ParseHeader(_))
        ));
        assert!(matches!(
            parse_header(b"ply\nelement vertex many\nend_header\n"),
            Err(SplatError::ParseHeader(_))
        ));
    }

    #[test]
    fn zero_vertex_file_is_empty_cloud() {
        // minimal .ply, 0 vertices, no trailing newline
        let data =
            b"ply\nformat binary_little_endian 1.0\nelement vertex 0\nproperty float x\nend_header";
        let ply = PlyData::from_bytes(data.to_vec()).expect("empty file parses");
        assert_eq!(ply.header.vertex_count, 0);
        let cloud = SplatCloud::from_ply(ply).expect("zero records is not an error");
        assert!(cloud.is_empty());
    }

    #[test]
    fn round_trips_records() {
        let records: Vec<_> = (0..3).map(record).collect();
        let mut raw = Vec::new();
        write_ply(&mut raw, &records).expect("write");

        let ply = PlyData::from_bytes(raw).expect("parse");
        assert_eq!(ply.header.stride, size_of::<SplatRecord>());
        assert_eq!(ply.header.field_offset("opacity"), Some(54 * 4));
        let cloud = SplatCloud::from_ply(ply).expect("decode");
        assert_eq!(cloud.records, records);
    }

    #[test]
    fn stride_mismatch_is_fatal() {
        let data = b"ply\nformat binary_little_endian 1.0\nelement vertex 1\n\
property float x\nproperty float y\nproperty float z\nend_header\n\0\0\0\0\0\0\0\0\0\0\0\0";
        let ply = PlyData::from_bytes(data.to_vec()).expect("payload is complete");
        assert!(matches!(
            SplatCloud::from_ply(ply),
            Err(SplatError::StrideMismatch {
                expected: 248,
                found: 12
            })
        ));
    }

    #[test]
    fn short_payload_is_truncation() {
        let records: Vec<_> = (0..2).map(record).collect();
        let mut raw = Vec::new();
        write_ply(&mut raw, &records).expect("write");
        raw.truncate(raw.len() - 10);

        match PlyData::from_bytes(raw) {
            Err(SplatError::Truncated { expected, found }) => {
                assert_eq!(expected, 2 * 248);
                assert_eq!(found, 2 * 248 - 10);
            }
            other => panic!("expected truncation, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut raw = Vec::new();
        write_ply(&mut raw, &[record(4)]).expect("write");
        raw.extend_from_slice(b"trailing garbage");
        let ply = PlyData::from_bytes(raw).expect("parse");
        assert_eq!(ply.payload.len(), 248);
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nope.ply");
        assert!(matches!(
            read_file(&path, u64::MAX),
            Err(SplatError::FileNotFound(p)) if p == path
        ));
    }

    #[test]
    fn oversized_file_fails_on_metadata() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"not even a header").expect("write");
        let err = read_file(file.path(), 17).expect_err("17 bytes hits a 17 byte limit");
        assert!(matches!(err, SplatError::FileTooLarge { size: 17, limit: 17 }));
        assert!(matches!(
            read_file(file.path(), 18),
            Err(SplatError::ParseHeader(_))
        ));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_read_file_async() {
        let records: Vec<_> = (0..2).map(record).collect();
        let mut raw = Vec::new();
        write_ply(&mut raw, &records).expect("write");
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&raw).expect("write");

        let ply = read_file_async(file.path(), u64::MAX).await.expect("read");
        assert_eq!(ply.header.vertex_count, 2);
        assert_eq!(SplatCloud::from_ply(ply).expect("decode").records, records);
    }
}
