// Vessel
// Copyright (c) 2025-2026 The Project Vessel Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Readers for the movie structure: mvhd, tkhd, mdhd, hdlr, trak, mvex, trex, moov.

use log::{debug, warn};

use vessel_core::errors::{decode_error, Result};
use vessel_core::io::ReadBytes;

use super::stsd::StsdBox;
use super::{BoxHeader, BoxIter, BoxType, ReadBox};

/// Movie header box.
#[allow(dead_code)]
#[derive(Debug)]
pub struct MvhdBox {
    pub timescale: u32,
    pub duration: u64,
    pub next_track_id: u32,
}

impl ReadBox for MvhdBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (version, _) = header.read_extended_header(reader)?;

        let (timescale, duration) = match version {
            0 => {
                // Creation and modification time.
                reader.ignore_bytes(8)?;
                let timescale = reader.read_be_u32()?;
                let duration = u64::from(reader.read_be_u32()?);
                (timescale, duration)
            }
            1 => {
                reader.ignore_bytes(16)?;
                let timescale = reader.read_be_u32()?;
                let duration = reader.read_be_u64()?;
                (timescale, duration)
            }
            _ => return decode_error("isomp4 (mvhd): invalid version"),
        };

        // Rate, volume, reserved, matrix, pre-defined.
        reader.ignore_bytes(4 + 2 + 2 + 8 + 36 + 24)?;

        let next_track_id = reader.read_be_u32()?;

        Ok(MvhdBox { timescale, duration, next_track_id })
    }
}

/// Track header box.
#[allow(dead_code)]
#[derive(Debug)]
pub struct TkhdBox {
    pub id: u32,
    /// Track duration in movie timescale units.
    pub duration: u64,
    /// Raw fixed-point transformation matrix.
    pub matrix: [i32; 9],
    /// Presentation width in pixels (16.16 integer part).
    pub width: u32,
    /// Presentation height in pixels (16.16 integer part).
    pub height: u32,
}

impl ReadBox for TkhdBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (version, _) = header.read_extended_header(reader)?;

        let (id, duration) = match version {
            0 => {
                reader.ignore_bytes(8)?;
                let id = reader.read_be_u32()?;
                reader.ignore_bytes(4)?;
                let duration = u64::from(reader.read_be_u32()?);
                (id, duration)
            }
            1 => {
                reader.ignore_bytes(16)?;
                let id = reader.read_be_u32()?;
                reader.ignore_bytes(4)?;
                let duration = reader.read_be_u64()?;
                (id, duration)
            }
            _ => return decode_error("isomp4 (tkhd): invalid version"),
        };

        // Reserved, layer, alternate group, volume, reserved.
        reader.ignore_bytes(8 + 2 + 2 + 2 + 2)?;

        let mut matrix = [0i32; 9];
        for entry in matrix.iter_mut() {
            *entry = reader.read_be_i32()?;
        }

        let width = reader.read_be_u32()? >> 16;
        let height = reader.read_be_u32()? >> 16;

        Ok(TkhdBox { id, duration, matrix, width, height })
    }
}

/// Media header box.
#[derive(Debug)]
pub struct MdhdBox {
    pub timescale: u32,
    /// Duration of the media in the media timescale.
    pub duration: u64,
    pub language: Option<String>,
}

fn parse_language(code: u16) -> Option<String> {
    // An ISO language code outside of these bounds is not valid.
    if code < 0x400 || code > 0x7fff {
        return None;
    }

    let chars = [
        ((code >> 10) & 0x1f) as u8 + 0x60,
        ((code >> 5) & 0x1f) as u8 + 0x60,
        (code & 0x1f) as u8 + 0x60,
    ];

    Some(String::from_utf8_lossy(&chars).to_string())
}

impl ReadBox for MdhdBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (version, _) = header.read_extended_header(reader)?;

        let (timescale, duration) = match version {
            0 => {
                reader.ignore_bytes(8)?;
                let timescale = reader.read_be_u32()?;
                // 0xffff_ffff marks an unknown duration.
                let duration = match reader.read_be_u32()? {
                    u32::MAX => u64::MAX,
                    duration => u64::from(duration),
                };
                (timescale, duration)
            }
            1 => {
                reader.ignore_bytes(16)?;
                let timescale = reader.read_be_u32()?;
                let duration = reader.read_be_u64()?;
                (timescale, duration)
            }
            _ => return decode_error("isomp4 (mdhd): invalid version"),
        };

        let language = parse_language(reader.read_be_u16()?);

        Ok(MdhdBox { timescale, duration, language })
    }
}

/// Track handler kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandlerType {
    Video,
    Sound,
    Subtitle,
    Other([u8; 4]),
}

/// Handler reference box.
#[derive(Debug)]
pub struct HdlrBox {
    pub handler: HandlerType,
}

impl ReadBox for HdlrBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (_, _) = header.read_extended_header(reader)?;

        // Pre-defined.
        reader.ignore_bytes(4)?;

        let handler = match &reader.read_quad_bytes()? {
            b"vide" => HandlerType::Video,
            b"soun" => HandlerType::Sound,
            b"text" | b"sbtl" | b"subt" => HandlerType::Subtitle,
            other => HandlerType::Other(*other),
        };

        Ok(HdlrBox { handler })
    }
}

/// Track extends box: per-track defaults for fragmented movies.
#[allow(dead_code)]
#[derive(Copy, Clone, Debug)]
pub struct TrexBox {
    pub track_id: u32,
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

impl ReadBox for TrexBox {
    fn read<B: ReadBytes>(reader: &mut B, mut header: BoxHeader) -> Result<Self> {
        let (_, _) = header.read_extended_header(reader)?;

        Ok(TrexBox {
            track_id: reader.read_be_u32()?,
            default_sample_description_index: reader.read_be_u32()?,
            default_sample_duration: reader.read_be_u32()?,
            default_sample_size: reader.read_be_u32()?,
            default_sample_flags: reader.read_be_u32()?,
        })
    }
}

/// Movie extends box.
#[derive(Debug, Default)]
pub struct MvexBox {
    pub trexs: Vec<TrexBox>,
}

impl ReadBox for MvexBox {
    fn read<B: ReadBytes>(reader: &mut B, header: BoxHeader) -> Result<Self> {
        let mut trexs = Vec::new();

        let mut iter = BoxIter::new_in(&mut *reader, &header);

        while let Some(child) = iter.next()? {
            match child.box_type() {
                BoxType::TrackExtends => {
                    let trex = iter.read_box::<TrexBox>(child)?;
                    trexs.push(trex);
                }
                BoxType::MovieExtendsHeader => (),
                other => debug!("skipping box {:?} in mvex", other),
            }
        }

        Ok(MvexBox { trexs })
    }
}

/// Track box. The heavyweight sample tables are not parsed here; their byte range is
/// recorded so a sample table can be built on the first packet query.
#[derive(Debug)]
pub struct TrakBox {
    pub tkhd: TkhdBox,
    pub mdhd: MdhdBox,
    pub handler: HandlerType,
    pub stsd: StsdBox,
    /// File position of the stbl box header.
    pub stbl_pos: u64,
    /// Exclusive file position of the stbl box end.
    pub stbl_end: u64,
}

impl ReadBox for TrakBox {
    fn read<B: ReadBytes>(reader: &mut B, header: BoxHeader) -> Result<Self> {
        let mut tkhd = None;
        let mut mdhd = None;
        let mut handler = None;
        let mut stsd = None;
        let mut stbl_range = None;

        let mut iter = BoxIter::new_in(&mut *reader, &header);

        while let Some(child) = iter.next()? {
            match child.box_type() {
                BoxType::TrackHeader => {
                    tkhd = Some(iter.read_box::<TkhdBox>(child)?);
                }
                BoxType::Media => {
                    read_mdia(&mut iter, child, &mut mdhd, &mut handler, &mut stsd, &mut stbl_range)?;
                }
                BoxType::Edit => {
                    debug!("ignoring edit list");
                }
                _ => (),
            }
        }

        let tkhd = tkhd.ok_or_else(|| missing("trak missing tkhd"))?;
        let mdhd = mdhd.ok_or_else(|| missing("trak missing mdhd"))?;
        let handler = handler.ok_or_else(|| missing("trak missing hdlr"))?;
        let stsd = stsd.ok_or_else(|| missing("trak missing stsd"))?;
        let (stbl_pos, stbl_end) = stbl_range.ok_or_else(|| missing("trak missing stbl"))?;

        Ok(TrakBox { tkhd, mdhd, handler, stsd, stbl_pos, stbl_end })
    }
}

fn missing(msg: &'static str) -> vessel_core::errors::Error {
    vessel_core::errors::Error::DecodeError(msg)
}

fn read_mdia<B: ReadBytes>(
    iter: &mut BoxIter<&mut B>,
    mdia: BoxHeader,
    mdhd: &mut Option<MdhdBox>,
    handler: &mut Option<HandlerType>,
    stsd: &mut Option<StsdBox>,
    stbl_range: &mut Option<(u64, u64)>,
) -> Result<()> {
    let mut mdia_iter = BoxIter::new_in(iter.inner_mut(), &mdia);

    while let Some(child) = mdia_iter.next()? {
        match child.box_type() {
            BoxType::MediaHeader => {
                *mdhd = Some(mdia_iter.read_box::<MdhdBox>(child)?);
            }
            BoxType::Handler => {
                *handler = Some(mdia_iter.read_box::<HdlrBox>(child)?.handler);
            }
            BoxType::MediaInfo => {
                let mut minf_iter = BoxIter::new_in(mdia_iter.inner_mut(), &child);

                while let Some(minf_child) = minf_iter.next()? {
                    if minf_child.box_type() == BoxType::SampleTable {
                        let end = match minf_child.box_len() {
                            Some(len) => minf_child.box_pos() + len,
                            None => return decode_error("isomp4 (stbl): unsized stbl"),
                        };
                        *stbl_range = Some((minf_child.box_pos(), end));

                        let mut stbl_iter = BoxIter::new_in(minf_iter.inner_mut(), &minf_child);

                        while let Some(stbl_child) = stbl_iter.next()? {
                            if stbl_child.box_type() == BoxType::SampleDescription {
                                *stsd = Some(stbl_iter.read_box::<StsdBox>(stbl_child)?);
                            }
                        }
                    }
                }
            }
            _ => (),
        }
    }

    Ok(())
}

/// Movie box.
#[derive(Debug)]
pub struct MoovBox {
    pub mvhd: MvhdBox,
    pub traks: Vec<TrakBox>,
    pub mvex: Option<MvexBox>,
}

impl MoovBox {
    pub fn is_fragmented(&self) -> bool {
        self.mvex.is_some()
    }
}

impl ReadBox for MoovBox {
    fn read<B: ReadBytes>(reader: &mut B, header: BoxHeader) -> Result<Self> {
        let mut mvhd = None;
        let mut traks = Vec::new();
        let mut mvex = None;

        let mut iter = BoxIter::new_in(&mut *reader, &header);

        while let Some(child) = iter.next()? {
            match child.box_type() {
                BoxType::MovieHeader => {
                    mvhd = Some(iter.read_box::<MvhdBox>(child)?);
                }
                BoxType::Track => match iter.read_box::<TrakBox>(child) {
                    Ok(trak) => traks.push(trak),
                    Err(err) => warn!("skipping unreadable trak: {}", err),
                },
                BoxType::MovieExtends => {
                    mvex = Some(iter.read_box::<MvexBox>(child)?);
                }
                other => debug!("skipping box {:?} in moov", other),
            }
        }

        let mvhd = match mvhd {
            Some(mvhd) => mvhd,
            None => return decode_error("isomp4 (moov): missing mvhd"),
        };

        Ok(MoovBox { mvhd, traks, mvex })
    }
}
