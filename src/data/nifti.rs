use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::ThermometryError;

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// NIfTI-1 datatype codes.
const DT_UINT8: i16 = 2;
const DT_INT16: i16 = 4;
const DT_INT32: i16 = 8;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;
const DT_INT8: i16 = 256;
const DT_UINT16: i16 = 512;
const DT_UINT32: i16 = 768;

// ---------------------------------------------------------------------------
// Geometry – the spatial part of the header carried into derived images
// ---------------------------------------------------------------------------

/// Voxel sizes and orientation fields, copied verbatim from a source image so
/// derived maps overlay it in any viewer.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub pixdim: [f32; 8],
    pub xyzt_units: u8,
    pub qform_code: i16,
    pub sform_code: i16,
    /// quatern_b, quatern_c, quatern_d, qoffset_x, qoffset_y, qoffset_z
    pub quatern: [f32; 6],
    pub srow: [[f32; 4]; 3],
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            pixdim: [1.0; 8],
            xyzt_units: 2 | 8, // mm, s
            qform_code: 0,
            sform_code: 1,
            quatern: [0.0; 6],
            srow: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// A NIfTI image held as scaled `f32` samples, x fastest then y, z, t.
#[derive(Debug, Clone)]
pub struct Volume {
    /// nx, ny, nz, nt. Missing trailing dimensions are 1.
    pub dims: [usize; 4],
    pub geometry: Geometry,
    pub data: Vec<f32>,
}

impl Volume {
    /// A volume filled with `fill`.
    pub fn filled(dims: [usize; 4], geometry: Geometry, fill: f32) -> Self {
        let n = dims.iter().product();
        Volume {
            dims,
            geometry,
            data: vec![fill; n],
        }
    }

    /// Spatial grid (nx, ny, nz).
    pub fn grid(&self) -> [usize; 3] {
        [self.dims[0], self.dims[1], self.dims[2]]
    }

    /// Voxels per 3D frame.
    pub fn voxels_per_frame(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Number of frames (echoes for a multi-echo series).
    pub fn frames(&self) -> usize {
        self.dims[3]
    }

    /// Sample of voxel `voxel` (linear spatial index) in frame `t`.
    pub fn sample(&self, voxel: usize, t: usize) -> f32 {
        self.data[voxel + self.voxels_per_frame() * t]
    }

    /// One frame as a slice.
    pub fn frame(&self, t: usize) -> &[f32] {
        let n = self.voxels_per_frame();
        &self.data[t * n..(t + 1) * n]
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read a `.nii` or `.nii.gz` file. Compression is detected from the content.
pub fn read_volume(path: &Path) -> Result<Volume> {
    let mut raw = Vec::new();
    File::open(path)
        .with_context(|| format!("opening {}", path.display()))?
        .read_to_end(&mut raw)
        .with_context(|| format!("reading {}", path.display()))?;

    let bytes = if raw.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .with_context(|| format!("decompressing {}", path.display()))?;
        out
    } else {
        raw
    };

    parse_volume(&bytes).with_context(|| format!("parsing {}", path.display()))
}

/// Little helper that reads header fields in the file's byte order.
struct HeaderReader<'a> {
    bytes: &'a [u8],
    big_endian: bool,
}

impl HeaderReader<'_> {
    fn array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[offset..offset + N]);
        if self.big_endian {
            out.reverse();
        }
        out
    }

    fn i16(&self, offset: usize) -> i16 {
        i16::from_le_bytes(self.array(offset))
    }

    fn f32(&self, offset: usize) -> f32 {
        f32::from_le_bytes(self.array(offset))
    }
}

/// Parse an uncompressed single-file NIfTI-1 image.
pub fn parse_volume(bytes: &[u8]) -> Result<Volume, ThermometryError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ThermometryError::InvalidNifti(format!(
            "file is {} bytes, shorter than the header",
            bytes.len()
        )));
    }

    let le_size = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let big_endian = match le_size {
        348 => false,
        _ if i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == 348 => true,
        other => {
            return Err(ThermometryError::InvalidNifti(format!(
                "sizeof_hdr is {other}, expected 348"
            )))
        }
    };
    let hdr = HeaderReader { bytes, big_endian };

    if &bytes[344..347] != b"n+1" {
        return Err(ThermometryError::InvalidNifti(
            "magic is not n+1 (only single-file NIfTI-1 is supported)".into(),
        ));
    }

    let ndim = hdr.i16(40);
    if !(1..=7).contains(&ndim) {
        return Err(ThermometryError::InvalidNifti(format!("dim[0] is {ndim}")));
    }
    let mut dims = [1usize; 4];
    for (i, slot) in dims.iter_mut().enumerate().take(ndim.min(4) as usize) {
        let d = hdr.i16(42 + 2 * i);
        if d < 1 {
            return Err(ThermometryError::InvalidNifti(format!("dim[{}] is {d}", i + 1)));
        }
        *slot = d as usize;
    }
    for i in 4..ndim as usize {
        if hdr.i16(42 + 2 * i) > 1 {
            return Err(ThermometryError::InvalidNifti(format!(
                "dimension {} is larger than 1; only up to 4D images are supported",
                i + 1
            )));
        }
    }

    let datatype = hdr.i16(70);
    let mut pixdim = [0f32; 8];
    for (i, p) in pixdim.iter_mut().enumerate() {
        *p = hdr.f32(76 + 4 * i);
    }
    let vox_offset = hdr.f32(108);
    let scl_slope = hdr.f32(112);
    let scl_inter = hdr.f32(116);

    let mut quatern = [0f32; 6];
    for (i, q) in quatern.iter_mut().enumerate() {
        *q = hdr.f32(256 + 4 * i);
    }
    let mut srow = [[0f32; 4]; 3];
    for (r, row) in srow.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = hdr.f32(280 + 16 * r + 4 * c);
        }
    }
    let geometry = Geometry {
        pixdim,
        xyzt_units: bytes[123],
        qform_code: hdr.i16(252),
        sform_code: hdr.i16(254),
        quatern,
        srow,
    };

    let n: usize = dims.iter().product();
    let width = datatype_width(datatype)?;
    let start = if vox_offset.is_finite() && vox_offset >= HEADER_SIZE as f32 {
        vox_offset as usize
    } else {
        VOX_OFFSET
    };
    let end = n
        .checked_mul(width)
        .and_then(|len| start.checked_add(len))
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| {
            ThermometryError::InvalidNifti(format!(
                "expected {n} voxels of {width} byte(s) after offset {start}, file has {} bytes",
                bytes.len()
            ))
        })?;

    let mut data = decode_samples(&bytes[start..end], datatype, big_endian)?;
    if scl_slope != 0.0 && scl_slope.is_finite() && (scl_slope != 1.0 || scl_inter != 0.0) {
        for v in &mut data {
            *v = *v * scl_slope + scl_inter;
        }
    }

    Ok(Volume {
        dims,
        geometry,
        data,
    })
}

fn datatype_width(datatype: i16) -> Result<usize, ThermometryError> {
    match datatype {
        DT_UINT8 | DT_INT8 => Ok(1),
        DT_INT16 | DT_UINT16 => Ok(2),
        DT_INT32 | DT_UINT32 | DT_FLOAT32 => Ok(4),
        DT_FLOAT64 => Ok(8),
        other => Err(ThermometryError::UnsupportedDatatype(other)),
    }
}

fn decode_samples(raw: &[u8], datatype: i16, big_endian: bool) -> Result<Vec<f32>, ThermometryError> {
    let width = datatype_width(datatype)?;
    let chunks = raw.chunks_exact(width).map(|chunk| {
        let mut buf = [0u8; 8];
        buf[..width].copy_from_slice(chunk);
        if big_endian {
            buf[..width].reverse();
        }
        buf
    });

    let data = match datatype {
        DT_UINT8 => chunks.map(|b| b[0] as f32).collect(),
        DT_INT8 => chunks.map(|b| b[0] as i8 as f32).collect(),
        DT_INT16 => chunks.map(|b| i16::from_le_bytes([b[0], b[1]]) as f32).collect(),
        DT_UINT16 => chunks.map(|b| u16::from_le_bytes([b[0], b[1]]) as f32).collect(),
        DT_INT32 => chunks
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32)
            .collect(),
        DT_UINT32 => chunks
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32)
            .collect(),
        DT_FLOAT32 => chunks
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        DT_FLOAT64 => chunks.map(|b| f64::from_le_bytes(b) as f32).collect(),
        other => return Err(ThermometryError::UnsupportedDatatype(other)),
    };
    Ok(data)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Encode a volume as little-endian float32 NIfTI-1.
pub fn encode_volume(volume: &Volume, description: &str) -> Vec<u8> {
    let mut out = vec![0u8; VOX_OFFSET];
    let put = |out: &mut Vec<u8>, offset: usize, bytes: &[u8]| {
        out[offset..offset + bytes.len()].copy_from_slice(bytes);
    };

    put(&mut out, 0, &(HEADER_SIZE as i32).to_le_bytes());
    let ndim: i16 = if volume.dims[3] > 1 { 4 } else { 3 };
    put(&mut out, 40, &ndim.to_le_bytes());
    for i in 0..7 {
        let d = volume.dims.get(i).copied().unwrap_or(1) as i16;
        put(&mut out, 42 + 2 * i, &d.to_le_bytes());
    }
    put(&mut out, 70, &DT_FLOAT32.to_le_bytes());
    put(&mut out, 72, &32i16.to_le_bytes());

    let g = &volume.geometry;
    let mut pixdim = g.pixdim;
    if pixdim[0] != -1.0 {
        pixdim[0] = 1.0;
    }
    for (i, p) in pixdim.iter().enumerate() {
        put(&mut out, 76 + 4 * i, &p.to_le_bytes());
    }
    put(&mut out, 108, &(VOX_OFFSET as f32).to_le_bytes());
    put(&mut out, 112, &1.0f32.to_le_bytes());
    put(&mut out, 116, &0.0f32.to_le_bytes());
    out[123] = g.xyzt_units;

    let desc = description.as_bytes();
    let desc_len = desc.len().min(79);
    put(&mut out, 148, &desc[..desc_len]);

    put(&mut out, 252, &g.qform_code.to_le_bytes());
    put(&mut out, 254, &g.sform_code.to_le_bytes());
    for (i, q) in g.quatern.iter().enumerate() {
        put(&mut out, 256 + 4 * i, &q.to_le_bytes());
    }
    for (r, row) in g.srow.iter().enumerate() {
        for (c, v) in row.iter().enumerate() {
            put(&mut out, 280 + 16 * r + 4 * c, &v.to_le_bytes());
        }
    }
    put(&mut out, 344, b"n+1\0");

    out.reserve(volume.data.len() * 4);
    for v in &volume.data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Write a volume; a `.gz` file name selects gzip compression.
pub fn write_volume(path: &Path, volume: &Volume, description: &str) -> Result<()> {
    let bytes = encode_volume(volume, description);
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let writer = BufWriter::new(file);

    let gzip = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"));
    if gzip {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        encoder
            .write_all(&bytes)
            .with_context(|| format!("writing {}", path.display()))?;
        encoder
            .finish()
            .and_then(|mut w| w.flush())
            .with_context(|| format!("finishing {}", path.display()))?;
    } else {
        let mut writer = writer;
        writer
            .write_all(&bytes)
            .and_then(|_| writer.flush())
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}
