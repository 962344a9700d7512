//! Planar YUV (4:2:0) to RGBA conversion, no resize (spec.md section 4.4).
//!
//! The teacher's own pack-mate `angkira-rpi-webrtc-streamer` names the `yuv`
//! crate for this exact conversion (commented out in its Cargo.toml, never
//! hand-rolled); we use it for real here rather than writing BT.601 matrix
//! math by hand.

use yuv::{yuv420_to_rgba, YuvPlanarImage, YuvRange, YuvStandardMatrix};

use crate::error::DecoderError;

/// Borrowed planar YUV 4:2:0 data as produced by `H264Decoder::poll`.
pub struct YuvPlanes<'a> {
    pub y: &'a [u8],
    pub y_stride: u32,
    pub u: &'a [u8],
    pub u_stride: u32,
    pub v: &'a [u8],
    pub v_stride: u32,
    pub width: u32,
    pub height: u32,
}

/// Converts `planes` to a tightly-packed RGBA buffer of `width * height * 4`
/// bytes. Never resizes; the caller is responsible for enforcing the
/// no-resize invariant against the cached SPS dimensions before calling this.
pub fn yuv420_to_rgba_buf(planes: &YuvPlanes<'_>) -> Result<Vec<u8>, DecoderError> {
    let image = YuvPlanarImage {
        y_plane: planes.y,
        y_stride: planes.y_stride,
        u_plane: planes.u,
        u_stride: planes.u_stride,
        v_plane: planes.v,
        v_stride: planes.v_stride,
        width: planes.width,
        height: planes.height,
    };
    let rgba_stride = planes.width * 4;
    let mut rgba = vec![0u8; (rgba_stride as usize) * (planes.height as usize)];
    yuv420_to_rgba(
        &image,
        &mut rgba,
        rgba_stride,
        YuvRange::Limited,
        YuvStandardMatrix::Bt601,
    )
    .map_err(|e| DecoderError::Backend(format!("YUV->RGBA conversion failed: {e}")))?;
    Ok(rgba)
}
