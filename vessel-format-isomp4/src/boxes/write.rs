// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Box serialization: a byte-buffer builder with the classical MP4 field encodings, and
//! a recursive box writer with size backpatching.

use vessel_core::io::Writer;

/// Seconds between 1904-01-01 (the MP4 epoch) and 1970-01-01.
pub const MP4_EPOCH_OFFSET: u64 = 2_082_844_800;

/// The packed ISO 639-2 code for an undetermined language.
pub const LANGUAGE_UNDETERMINED: u16 = 0x55c4;

/// A big-endian byte-buffer builder for box payloads.
#[derive(Default)]
pub struct ByteBuf {
    buf: Vec<u8>,
}

impl ByteBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i16(&mut self, v: i16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u24(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes()[1..]);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn zeros(&mut self, count: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + count, 0);
        self
    }

    pub fn fourcc(&mut self, v: &[u8; 4]) -> &mut Self {
        self.bytes(v)
    }

    pub fn ascii(&mut self, v: &str) -> &mut Self {
        self.bytes(v.as_bytes())
    }

    /// 16.16 signed fixed point.
    pub fn fixed_16_16(&mut self, v: f64) -> &mut Self {
        self.i32((v * 65_536.0).round() as i32)
    }

    /// 8.8 signed fixed point.
    pub fn fixed_8_8(&mut self, v: f64) -> &mut Self {
        self.i16((v * 256.0).round() as i16)
    }

    /// A 3x3 transformation matrix of raw fixed-point entries: 16.16 for the linear
    /// part and 2.30 for the last column.
    pub fn matrix(&mut self, m: &[i32; 9]) -> &mut Self {
        for &entry in m {
            self.i32(entry);
        }
        self
    }

    /// A packed ISO 639-2 language code, three lowercase letters in 5 bits each.
    pub fn language(&mut self, code: Option<&str>) -> &mut Self {
        let packed = pack_language(code);
        self.u16(packed)
    }

    /// An MPEG-4 descriptor: class tag, variable-length payload size, payload.
    pub fn descriptor(&mut self, tag: u8, payload: &[u8]) -> &mut Self {
        self.u8(tag);

        // Variable-length size: 7 bits per byte, high bit flags continuation.
        let len = payload.len() as u32;
        let mut shift = (28 / 7) * 7;
        let mut started = false;
        while shift > 0 {
            let septet = (len >> shift) & 0x7f;
            if septet != 0 || started {
                self.u8(0x80 | septet as u8);
                started = true;
            }
            shift -= 7;
        }
        self.u8((len & 0x7f) as u8);

        self.bytes(payload)
    }
}

fn pack_language(code: Option<&str>) -> u16 {
    let code = match code {
        Some(code) if code.len() == 3 => code,
        _ => return LANGUAGE_UNDETERMINED,
    };

    let mut packed = 0u16;
    for byte in code.bytes() {
        if !byte.is_ascii_lowercase() {
            return LANGUAGE_UNDETERMINED;
        }
        packed = (packed << 5) | u16::from(byte - 0x60);
    }
    packed
}

/// A box under construction: a fourcc, flat payload bytes, and child boxes. The
/// serialized size is computed while writing and backpatched into the header.
pub struct MuxBox {
    pub fourcc: [u8; 4],
    pub contents: Vec<u8>,
    pub children: Vec<MuxBox>,
    /// Force the 64-bit size encoding.
    pub large_size: bool,
}

impl MuxBox {
    pub fn new(fourcc: &[u8; 4], contents: Vec<u8>) -> Self {
        MuxBox { fourcc: *fourcc, contents, children: Vec::new(), large_size: false }
    }

    pub fn with_children(fourcc: &[u8; 4], contents: Vec<u8>, children: Vec<MuxBox>) -> Self {
        MuxBox { fourcc: *fourcc, contents, children, large_size: false }
    }

    /// A full box: version and flags precede the payload.
    pub fn full(fourcc: &[u8; 4], version: u8, flags: u32, payload: ByteBuf) -> Self {
        let mut contents = ByteBuf::new();
        contents.u8(version).u24(flags);
        contents.bytes(&payload.into_inner());
        MuxBox::new(fourcc, contents.into_inner())
    }

    pub fn push(&mut self, child: MuxBox) {
        self.children.push(child);
    }

    fn header_len(&self) -> u64 {
        if self.large_size {
            16
        }
        else {
            8
        }
    }

    /// The exact number of bytes `write_box` will produce.
    pub fn measure(&self) -> u64 {
        self.header_len()
            + self.contents.len() as u64
            + self.children.iter().map(MuxBox::measure).sum::<u64>()
    }
}

/// Write a box and its children, backpatching the size field from the final position.
/// Returns the box's file offset, which can later be handed to [`patch_box`].
pub fn write_box(writer: &mut Writer, bx: &MuxBox) -> u64 {
    let start = writer.pos();

    if bx.large_size {
        writer.write(&1u32.to_be_bytes());
        writer.write(&bx.fourcc);
        // Size placeholder, patched below.
        writer.write(&0u64.to_be_bytes());
    }
    else {
        // Size placeholder, patched below.
        writer.write(&0u32.to_be_bytes());
        writer.write(&bx.fourcc);
    }

    writer.write(&bx.contents);

    for child in &bx.children {
        write_box(writer, child);
    }

    let end = writer.pos();
    let size = end - start;

    if bx.large_size {
        writer.seek(start + 8);
        writer.write(&size.to_be_bytes());
    }
    else {
        writer.seek(start);
        writer.write(&(size as u32).to_be_bytes());
    }
    writer.seek(end);

    start
}

/// Re-serialize a box in place at a previously recorded offset.
pub fn patch_box(writer: &mut Writer, offset: u64, bx: &MuxBox) {
    let saved = writer.pos();
    writer.seek(offset);
    write_box(writer, bx);
    writer.seek(saved);
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_core::io::{BufferTarget, OutputTarget};

    #[tokio::test]
    async fn verify_box_serialization() {
        let target = BufferTarget::new();
        let mut writer = OutputTarget::buffer(target.clone()).into_writer(false);

        let mut payload = ByteBuf::new();
        payload.u32(0xdead_beef);

        let child = MuxBox::new(b"free", vec![0xaa]);
        let bx = MuxBox::with_children(b"moov", payload.into_inner(), vec![child]);

        assert_eq!(bx.measure(), 8 + 4 + 8 + 1);
        write_box(&mut writer, &bx);
        writer.finalize().await.unwrap();

        let buf = target.buffer().unwrap();
        assert_eq!(buf.len(), 21);
        assert_eq!(&buf[0..4], &21u32.to_be_bytes());
        assert_eq!(&buf[4..8], b"moov");
        assert_eq!(&buf[8..12], &0xdead_beefu32.to_be_bytes());
        assert_eq!(&buf[12..16], &9u32.to_be_bytes());
        assert_eq!(&buf[16..20], b"free");
        assert_eq!(buf[20], 0xaa);
    }

    #[tokio::test]
    async fn verify_large_size_serialization() {
        let target = BufferTarget::new();
        let mut writer = OutputTarget::buffer(target.clone()).into_writer(false);

        let mut bx = MuxBox::new(b"mdat", vec![1, 2, 3]);
        bx.large_size = true;

        write_box(&mut writer, &bx);
        writer.finalize().await.unwrap();

        let buf = target.buffer().unwrap();
        assert_eq!(&buf[0..4], &1u32.to_be_bytes());
        assert_eq!(&buf[4..8], b"mdat");
        assert_eq!(&buf[8..16], &19u64.to_be_bytes());
    }

    #[tokio::test]
    async fn verify_patch_box_in_place() {
        let target = BufferTarget::new();
        let mut writer = OutputTarget::buffer(target.clone()).into_writer(false);

        let bx = MuxBox::new(b"free", vec![0; 4]);
        let offset = write_box(&mut writer, &bx);
        writer.write(&[0xee]);

        patch_box(&mut writer, offset, &MuxBox::new(b"free", vec![1, 2, 3, 4]));
        assert_eq!(writer.pos(), 13);

        writer.finalize().await.unwrap();
        let buf = target.buffer().unwrap();
        assert_eq!(&buf[8..12], &[1, 2, 3, 4]);
        assert_eq!(buf[12], 0xee);
    }

    #[test]
    fn verify_language_packing() {
        let mut buf = ByteBuf::new();
        buf.language(Some("und"));
        assert_eq!(buf.into_inner(), LANGUAGE_UNDETERMINED.to_be_bytes());

        let mut buf = ByteBuf::new();
        buf.language(Some("eng"));
        let packed = u16::from_be_bytes([buf.buf[0], buf.buf[1]]);
        assert_eq!(packed, (5 << 10) | (14 << 5) | 7);

        let mut buf = ByteBuf::new();
        buf.language(None);
        assert_eq!(buf.into_inner(), LANGUAGE_UNDETERMINED.to_be_bytes());
    }

    #[test]
    fn verify_descriptor_length_encoding() {
        let mut buf = ByteBuf::new();
        buf.descriptor(0x05, &[0u8; 2]);
        assert_eq!(&buf.into_inner()[..2], &[0x05, 0x02]);

        let mut buf = ByteBuf::new();
        let payload = vec![0u8; 200];
        buf.descriptor(0x05, &payload);
        let bytes = buf.into_inner();
        assert_eq!(&bytes[..3], &[0x05, 0x81, 0x48]);
    }

    #[test]
    fn verify_fixed_point() {
        let mut buf = ByteBuf::new();
        buf.fixed_16_16(1.0).fixed_8_8(-1.5);
        assert_eq!(buf.into_inner(), vec![0x00, 0x01, 0x00, 0x00, 0xfe, 0x80]);
    }
}
