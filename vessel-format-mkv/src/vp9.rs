// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VP9 uncompressed-frame-header colour patching.
//!
//! Encoders frequently leave the colour-space field of VP9 key frames at `unknown`
//! even when the caller supplied a full colour description. The container cannot carry
//! that information for VP9, so the bits are patched directly into the frame header.

use log::debug;

use vessel_core::codecs::{color, ColorSpace};
use vessel_core::errors::Result;
use vessel_core::io::{overwrite_bits, BitReader};

/// The VP9 colour-space identifier derived from a matrix-coefficients code point.
fn vp9_color_space(matrix: u8) -> u32 {
    match matrix {
        color::MATRIX_BT709 => 2,
        color::MATRIX_BT470BG => 1,
        color::MATRIX_SMPTE170M => 3,
        color::MATRIX_BT2020_NCL => 5,
        color::MATRIX_RGB => 7,
        _ => 0,
    }
}

/// Patch the colour-space bits of a VP9 key frame in place. Frames that are not key
/// frames, or whose header cannot be walked, are left untouched.
pub(crate) fn patch_vp9_color_space(data: &mut [u8], color_space: &ColorSpace) -> Result<()> {
    let matrix = match color_space.matrix {
        Some(matrix) => matrix,
        None => return Ok(()),
    };
    let cs_id = vp9_color_space(matrix);

    let mut bits = BitReader::new(data);

    // Uncompressed header: frame marker, profile bits.
    if bits.read_bits(2)? != 0b10 {
        debug!("not a vp9 frame, skipping colour patch");
        return Ok(());
    }

    let profile_low = bits.read_bits(1)?;
    let profile_high = bits.read_bits(1)?;
    let profile = (profile_high << 1) | profile_low;
    if profile == 3 {
        bits.ignore_bits(1)?;
    }

    // A shown-existing frame has no header to patch.
    if bits.read_bit()? {
        return Ok(());
    }

    // Only key frames carry the colour config.
    let frame_type = bits.read_bits(1)?;
    if frame_type != 0 {
        return Ok(());
    }

    let _show_frame = bits.read_bits(1)?;
    let _error_resilient = bits.read_bits(1)?;

    // Frame sync code.
    if bits.read_bits(24)? != 0x49_83_42 {
        debug!("bad vp9 sync code, skipping colour patch");
        return Ok(());
    }

    if profile >= 2 {
        // ten_or_twelve_bit
        bits.ignore_bits(1)?;
    }

    let cs_offset = bits.bit_pos();
    overwrite_bits(data, cs_offset, cs_id, 3)?;

    // Colour spaces other than RGB are followed by the range flag.
    if cs_id != 7 {
        if let Some(full_range) = color_space.full_range {
            overwrite_bits(data, cs_offset + 3, u32::from(full_range), 1)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal VP9 profile-0 key frame header prefix with colour space `unknown`.
    fn key_frame_header() -> Vec<u8> {
        let mut data = vec![0u8; 8];
        // marker 10, profile 00, show_existing 0, frame_type 0 (key), show_frame 1,
        // error_resilient 0.
        overwrite_bits(&mut data, 0, 0b1000_0010, 8).unwrap();
        // sync code.
        overwrite_bits(&mut data, 8, 0x49, 8).unwrap();
        overwrite_bits(&mut data, 16, 0x83, 8).unwrap();
        overwrite_bits(&mut data, 24, 0x42, 8).unwrap();
        data
    }

    #[test]
    fn verify_bt709_patch() {
        let mut data = key_frame_header();
        let color_space = ColorSpace {
            primaries: Some(color::PRIMARIES_BT709),
            transfer: Some(color::TRANSFER_BT709),
            matrix: Some(color::MATRIX_BT709),
            full_range: Some(false),
        };

        patch_vp9_color_space(&mut data, &color_space).unwrap();

        // The colour space id sits right after the 32-bit prefix for profile 0.
        let mut bits = BitReader::new(&data);
        bits.ignore_bits(32).unwrap();
        assert_eq!(bits.read_bits(3).unwrap(), 2);
        assert_eq!(bits.read_bits(1).unwrap(), 0);
    }

    #[test]
    fn verify_delta_frame_untouched() {
        let mut data = key_frame_header();
        // Flip frame_type to non-key.
        overwrite_bits(&mut data, 5, 1, 1).unwrap();
        let snapshot = data.clone();

        let color_space = ColorSpace {
            primaries: Some(color::PRIMARIES_BT709),
            transfer: Some(color::TRANSFER_BT709),
            matrix: Some(color::MATRIX_BT709),
            full_range: Some(true),
        };
        patch_vp9_color_space(&mut data, &color_space).unwrap();

        assert_eq!(data, snapshot);
    }
}
