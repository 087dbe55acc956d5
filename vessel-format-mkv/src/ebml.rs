// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! EBML primitives: variable-length integers and element headers on the read side, and
//! a typed element writer with deferred-size master elements on the write side.

use vessel_core::errors::{decode_error, Result};
use vessel_core::io::{ReadBytes, Writer};

use crate::schema::{Type, ELEMENTS};

/// Reads a single EBML element id (as in RFC 8794) from the stream and returns its
/// value and length in bytes (1 to 4).
pub(crate) fn read_tag<R: ReadBytes>(mut reader: R) -> Result<(u32, u32)> {
    let byte = reader.read_byte()?;
    let remaining_octets = byte.leading_zeros();
    if remaining_octets > 3 {
        return decode_error("mkv: invalid element id");
    }

    // Read remaining octets.
    let mut tag = u32::from(byte);
    for _ in 0..remaining_octets {
        let byte = reader.read_byte()?;
        tag = (tag << 8) | u32::from(byte);
    }

    Ok((tag, remaining_octets + 1))
}

/// Reads an element size. `None` stands for the unknown-size sentinel.
pub(crate) fn read_size<R: ReadBytes>(reader: R) -> Result<Option<u64>> {
    let (size, len) = read_vint(reader)?;
    if size == u64::MAX && len == 1 {
        return Ok(None);
    }
    Ok(Some(size))
}

/// Reads a single unsigned variable-size integer from the stream.
pub(crate) fn read_unsigned_vint<R: ReadBytes>(reader: R) -> Result<u64> {
    Ok(read_vint(reader)?.0)
}

/// Reads a single signed variable-size integer from the stream.
pub(crate) fn read_signed_vint<R: ReadBytes>(mut reader: R) -> Result<i64> {
    let (value, len) = read_vint(&mut reader)?;
    // Convert to a signed integer by range shifting.
    let half_range = i64::pow(2, (len * 7) - 1) - 1;
    Ok(value as i64 - half_range)
}

/// Reads a single unsigned variable-size integer and returns both its value and its
/// length in octets.
fn read_vint<R: ReadBytes>(mut reader: R) -> Result<(u64, u32)> {
    let byte = reader.read_byte()?;
    if byte == 0xFF {
        // Special case: unknown size elements.
        return Ok((u64::MAX, 1));
    }

    let vint_width = byte.leading_zeros();
    if vint_width > 7 {
        return decode_error("mkv: invalid variable-size integer");
    }

    let mut vint = u64::from(byte);
    // Clear the VINT_MARKER bit.
    vint ^= 1 << (7 - vint_width);

    // Read remaining octets.
    for _ in 0..vint_width {
        let byte = reader.read_byte()?;
        vint = (vint << 8) | u64::from(byte);
    }

    Ok((vint, vint_width + 1))
}

/// A parsed element header.
#[derive(Copy, Clone, Debug)]
pub(crate) struct ElementHeader {
    /// The element id, including the length marker.
    pub id: u32,
    /// The element's offset in the stream.
    pub pos: u64,
    /// The element's data offset in the stream.
    pub data_pos: u64,
    /// The size of the payload data. `None` for unknown-size elements.
    pub data_len: Option<u64>,
}

impl ElementHeader {
    /// Reads a single EBML element header from the stream.
    pub(crate) fn read<R: ReadBytes>(reader: &mut R) -> Result<ElementHeader> {
        let pos = reader.pos();
        let (id, _) = read_tag(&mut *reader)?;
        let data_len = read_size(&mut *reader)?;

        Ok(ElementHeader { id, pos, data_pos: reader.pos(), data_len })
    }

    /// The payload type per the schema, if the element is known.
    pub(crate) fn element_type(&self) -> Option<Type> {
        ELEMENTS.get(&self.id).copied()
    }

    pub(crate) fn end(&self) -> Option<u64> {
        self.data_len.map(|len| self.data_pos + len)
    }
}

/// Iterator over sibling elements within a parent element or byte range.
pub(crate) struct ElementIterator<R: ReadBytes> {
    reader: R,
    /// Position of the next element header to read.
    next_pos: u64,
    /// Position immediately past the last byte of the parent, if bounded.
    end: Option<u64>,
}

impl<R: ReadBytes> ElementIterator<R> {
    /// Creates a new iterator over elements starting from the current stream position.
    pub(crate) fn new(reader: R, end: Option<u64>) -> Self {
        let next_pos = reader.pos();
        Self { reader, next_pos, end }
    }

    /// Creates a new iterator over children of the given parent element.
    pub(crate) fn new_in(reader: R, parent: &ElementHeader) -> Self {
        Self { reader, next_pos: parent.data_pos, end: parent.end() }
    }

    pub(crate) fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Reads the next sibling header, skipping any unread payload of the previous
    /// element. Descend into master elements with [`ElementIterator::new_in`].
    pub(crate) fn next(&mut self) -> Result<Option<ElementHeader>> {
        let pos = self.reader.pos();
        if pos < self.next_pos {
            self.reader.ignore_bytes(self.next_pos - pos)?;
        }

        if let Some(end) = self.end {
            if self.next_pos >= end {
                return Ok(None);
            }
        }

        let header = ElementHeader::read(&mut self.reader)?;

        self.next_pos = match header.data_len {
            Some(len) => header.data_pos + len,
            // An unknown-size element runs to the end of the parent; only descending
            // into it makes progress.
            None => self.end.unwrap_or(u64::MAX),
        };

        Ok(Some(header))
    }

    /// Read the current element's payload as an unsigned integer.
    pub(crate) fn read_unsigned(&mut self, header: &ElementHeader) -> Result<u64> {
        debug_assert_eq!(header.element_type(), Some(Type::Unsigned));

        let len = expect_len(header)?;
        if len > 8 {
            return decode_error("mkv: unsigned integer too wide");
        }

        let mut value = 0u64;
        for _ in 0..len {
            value = (value << 8) | u64::from(self.reader.read_byte()?);
        }
        Ok(value)
    }

    /// Read the current element's payload as a signed integer.
    pub(crate) fn read_signed(&mut self, header: &ElementHeader) -> Result<i64> {
        debug_assert_eq!(header.element_type(), Some(Type::Signed));

        let len = expect_len(header)?;
        if len > 8 {
            return decode_error("mkv: signed integer too wide");
        }

        let mut value = 0u64;
        for _ in 0..len {
            value = (value << 8) | u64::from(self.reader.read_byte()?);
        }

        // Sign extend.
        if len > 0 {
            let shift = 64 - 8 * len;
            Ok(((value << shift) as i64) >> shift)
        }
        else {
            Ok(0)
        }
    }

    /// Read the current element's payload as a float.
    pub(crate) fn read_float(&mut self, header: &ElementHeader) -> Result<f64> {
        debug_assert_eq!(header.element_type(), Some(Type::Float));

        match expect_len(header)? {
            0 => Ok(0.0),
            4 => Ok(f64::from(self.reader.read_be_f32()?)),
            8 => self.reader.read_be_f64(),
            _ => decode_error("mkv: invalid float width"),
        }
    }

    /// Read the current element's payload as a string.
    pub(crate) fn read_string(&mut self, header: &ElementHeader) -> Result<String> {
        let bytes = self.read_binary(header)?;
        // Strings may be zero padded.
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Read the current element's payload as raw bytes.
    pub(crate) fn read_binary(&mut self, header: &ElementHeader) -> Result<Box<[u8]>> {
        let len = expect_len(header)?;
        self.reader.read_boxed_slice_exact(len as usize)
    }
}

fn expect_len(header: &ElementHeader) -> Result<u64> {
    match header.data_len {
        Some(len) => Ok(len),
        None => decode_error("mkv: expected a sized element"),
    }
}

/// The number of octets the minimal vint encoding of `value` occupies.
pub(crate) fn vint_width(value: u64) -> u8 {
    for width in 1..=8u8 {
        // The all-ones pattern is reserved for the unknown-size sentinel.
        if value < (1u64 << (7 * width)) - 1 {
            return width;
        }
    }
    8
}

/// The number of octets the minimal unsigned integer payload of `value` occupies.
pub(crate) fn uint_width(value: u64) -> u8 {
    let mut width = 1u8;
    while width < 8 && value >= (1u64 << (8 * width)) {
        width += 1;
    }
    width
}

/// An open master element awaiting its size backpatch.
#[derive(Copy, Clone, Debug)]
pub(crate) struct OpenElement {
    size_pos: u64,
    size_width: u8,
}

/// EBML element writer over an append-with-seek byte writer.
pub(crate) struct EbmlWriter<'a> {
    writer: &'a mut Writer,
}

impl<'a> EbmlWriter<'a> {
    pub(crate) fn new(writer: &'a mut Writer) -> Self {
        EbmlWriter { writer }
    }

    pub(crate) fn writer(&mut self) -> &mut Writer {
        self.writer
    }

    pub(crate) fn pos(&self) -> u64 {
        self.writer.pos()
    }

    /// Write an element id. Ids carry their length marker, so they are emitted as their
    /// minimal big-endian byte string.
    pub(crate) fn write_id(&mut self, id: u32) {
        let bytes = id.to_be_bytes();
        let skip = (id.leading_zeros() / 8) as usize;
        self.writer.write(&bytes[skip..]);
    }

    /// Write an element size using the given width in octets.
    pub(crate) fn write_size(&mut self, size: u64, width: u8) {
        debug_assert!(width >= vint_width(size));

        let marked = size | (1u64 << (7 * width));
        let bytes = marked.to_be_bytes();
        self.writer.write(&bytes[8 - width as usize..]);
    }

    /// Write the one-byte unknown-size sentinel.
    pub(crate) fn write_unknown_size(&mut self) {
        self.writer.write(&[0xFF]);
    }

    /// Begin a master element whose size is backpatched by [`EbmlWriter::end_master`].
    pub(crate) fn begin_master(&mut self, id: u32, size_width: u8) -> OpenElement {
        self.write_id(id);
        let size_pos = self.writer.pos();
        self.write_size(0, size_width);
        OpenElement { size_pos, size_width }
    }

    /// Begin a master element of unknown size, for streamable output.
    pub(crate) fn begin_master_unsized(&mut self, id: u32) {
        self.write_id(id);
        self.write_unknown_size();
    }

    /// Close a master element by backpatching its size field.
    pub(crate) fn end_master(&mut self, open: OpenElement) {
        let end = self.writer.pos();
        let size = end - open.size_pos - u64::from(open.size_width);

        self.writer.seek(open.size_pos);
        self.write_size(size, open.size_width);
        self.writer.seek(end);
    }

    /// Write an unsigned integer element with a minimal-width payload.
    pub(crate) fn element_uint(&mut self, id: u32, value: u64) {
        let width = uint_width(value);
        self.write_id(id);
        self.write_size(u64::from(width), 1);
        let bytes = value.to_be_bytes();
        self.writer.write(&bytes[8 - width as usize..]);
    }

    /// Write a 64-bit float element.
    pub(crate) fn element_f64(&mut self, id: u32, value: f64) {
        self.write_id(id);
        self.write_size(8, 1);
        self.writer.write(&value.to_be_bytes());
    }

    /// Write an ASCII or UTF-8 string element.
    pub(crate) fn element_str(&mut self, id: u32, value: &str) {
        self.element_bin(id, value.as_bytes());
    }

    /// Write a binary element.
    pub(crate) fn element_bin(&mut self, id: u32, value: &[u8]) {
        self.write_id(id);
        let width = vint_width(value.len() as u64);
        self.write_size(value.len() as u64, width);
        self.writer.write(value);
    }

    /// Append raw bytes.
    pub(crate) fn raw(&mut self, bytes: &[u8]) {
        self.writer.write(bytes);
    }
}

/// Append a signed variable-size integer with the range-shifted encoding.
pub(crate) fn write_signed_vint_into(out: &mut Vec<u8>, value: i64) {
    // Find the smallest width able to carry the value.
    let mut width = 1u8;
    while width < 8 {
        let half_range = i64::pow(2, (u32::from(width) * 7) - 1) - 1;
        if value.abs() <= half_range {
            break;
        }
        width += 1;
    }

    let half_range = i64::pow(2, (u32::from(width) * 7) - 1) - 1;
    let shifted = (value + half_range) as u64 | (1u64 << (7 * width));
    let bytes = shifted.to_be_bytes();
    out.extend_from_slice(&bytes[8 - width as usize..]);
}

/// Append an unsigned variable-size integer with its marker.
pub(crate) fn write_vint_into(out: &mut Vec<u8>, value: u64) {
    let width = vint_width(value);
    let marked = value | (1u64 << (7 * width));
    let bytes = marked.to_be_bytes();
    out.extend_from_slice(&bytes[8 - width as usize..]);
}

#[cfg(test)]
mod tests {
    use vessel_core::io::BufReader;

    use super::*;

    #[test]
    fn verify_element_tag_parsing() {
        assert_eq!(read_tag(BufReader::new(&[0x82])).unwrap(), (0x82, 1));
        assert_eq!(read_tag(BufReader::new(&[0x40, 0x02])).unwrap(), (0x4002, 2));
        assert_eq!(read_tag(BufReader::new(&[0x20, 0x00, 0x02])).unwrap(), (0x200002, 3));
        assert_eq!(
            read_tag(BufReader::new(&[0x10, 0x00, 0x00, 0x02])).unwrap(),
            (0x10000002, 4)
        );
    }

    #[test]
    fn verify_variable_unsigned_integer_parsing() {
        assert_eq!(read_unsigned_vint(BufReader::new(&[0x82])).unwrap(), 2);
        assert_eq!(read_unsigned_vint(BufReader::new(&[0x40, 0x02])).unwrap(), 2);
        assert_eq!(read_unsigned_vint(BufReader::new(&[0x20, 0x00, 0x02])).unwrap(), 2);
        assert_eq!(read_unsigned_vint(BufReader::new(&[0x10, 0x00, 0x00, 0x02])).unwrap(), 2);
        assert_eq!(
            read_unsigned_vint(BufReader::new(&[0x08, 0x00, 0x00, 0x00, 0x02])).unwrap(),
            2
        );
    }

    #[test]
    fn verify_variable_signed_integer_parsing() {
        assert_eq!(read_signed_vint(BufReader::new(&[0x80])).unwrap(), -63);
        assert_eq!(read_signed_vint(BufReader::new(&[0x40, 0x00])).unwrap(), -8191);
    }

    #[test]
    fn verify_signed_vint_round_trip() {
        for value in [-8191i64, -63, -1, 0, 1, 63, 8191] {
            let mut bytes = Vec::new();
            write_signed_vint_into(&mut bytes, value);
            assert_eq!(read_signed_vint(BufReader::new(&bytes)).unwrap(), value, "{}", value);
        }
    }

    #[test]
    fn verify_vint_widths() {
        assert_eq!(vint_width(0), 1);
        assert_eq!(vint_width(126), 1);
        // 127 collides with the reserved all-ones pattern.
        assert_eq!(vint_width(127), 2);
        assert_eq!(vint_width(16_382), 2);
        assert_eq!(uint_width(0), 1);
        assert_eq!(uint_width(255), 1);
        assert_eq!(uint_width(256), 2);
    }

    #[tokio::test]
    async fn verify_master_element_backpatch() {
        use vessel_core::io::{BufferTarget, OutputTarget};

        let target = BufferTarget::new();
        let mut writer = OutputTarget::buffer(target.clone()).into_writer(false);

        let mut ebml = EbmlWriter::new(&mut writer);
        let open = ebml.begin_master(crate::schema::ids::INFO, 2);
        ebml.element_uint(crate::schema::ids::TIMESTAMP_SCALE, 1_000_000);
        ebml.end_master(open);

        writer.finalize().await.unwrap();
        let buf = target.buffer().unwrap();

        let mut reader = BufReader::new(&buf);
        let header = ElementHeader::read(&mut reader).unwrap();
        assert_eq!(header.id, crate::schema::ids::INFO);
        assert_eq!(header.data_len, Some(buf.len() as u64 - 6));

        let mut iter = ElementIterator::new_in(reader, &header);
        let child = iter.next().unwrap().unwrap();
        assert_eq!(child.id, crate::schema::ids::TIMESTAMP_SCALE);
        assert_eq!(iter.read_unsigned(&child).unwrap(), 1_000_000);
    }
}
