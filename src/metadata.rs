// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The FLAC metadata blocks written ahead of the frame stream
//!
//! The encoder emits a STREAMINFO block, a SEEKTABLE block,
//! a VORBIS_COMMENT block and an optional PADDING block,
//! in that order.  Reading them back is supported so that
//! finished streams can be inspected.

use crate::Error;
use bitstream_io::{
    BigEndian, BitRead, BitReader, BitWrite, FromBitStream, FromBitStreamUsing, LittleEndian,
    SignedBitCount, ToBitStream, ToBitStreamUsing,
};
use std::num::NonZero;

const FLAC_TAG: &[u8; 4] = b"fLaC";

/// A FLAC metadata block header
///
/// | Bits | Field | Meaning |
/// |-----:|------:|---------|
/// | 1    | `last` | final metadata block in file |
/// | 7    | `block_type` | type of block |
/// | 24   | `size` | block size, in bytes |
#[derive(Debug, Eq, PartialEq)]
pub struct BlockHeader {
    /// Whether we are the final block
    pub last: bool,
    /// Our block type
    pub block_type: BlockType,
    /// Our block size in bytes, excluding this header
    pub size: u32,
}

impl BlockHeader {
    /// The maximum size of a block's contents, in bytes (2²⁴ - 1)
    pub const MAX_SIZE: u32 = (1 << 24) - 1;
}

impl FromBitStream for BlockHeader {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        Ok(Self {
            last: r.read::<1, _>()?,
            block_type: r.parse()?,
            size: r.read::<24, _>()?,
        })
    }
}

impl ToBitStream for BlockHeader {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write::<1, _>(self.last)?;
        w.build(&self.block_type)?;
        w.write::<24, _>(self.size)
    }
}

/// A defined FLAC metadata block type
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockType {
    /// The STREAMINFO block
    Streaminfo = 0,
    /// The PADDING block
    Padding = 1,
    /// The APPLICATION block
    Application = 2,
    /// The SEEKTABLE block
    SeekTable = 3,
    /// The VORBIS_COMMENT block
    VorbisComment = 4,
    /// The CUESHEET block
    Cuesheet = 5,
    /// The PICTURE block
    Picture = 6,
}

impl FromBitStream for BlockType {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        match r.read::<7, u8>()? {
            0 => Ok(Self::Streaminfo),
            1 => Ok(Self::Padding),
            2 => Ok(Self::Application),
            3 => Ok(Self::SeekTable),
            4 => Ok(Self::VorbisComment),
            5 => Ok(Self::Cuesheet),
            6 => Ok(Self::Picture),
            _ => Err(Error::ReservedMetadataBlock),
        }
    }
}

impl ToBitStream for BlockType {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write::<7, u8>(*self as u8)
    }
}

/// A FLAC metadata block written by the encoder
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Block {
    /// The STREAMINFO block
    Streaminfo(Streaminfo),
    /// The PADDING block
    Padding(Padding),
    /// The SEEKTABLE block
    SeekTable(SeekTable),
    /// The VORBIS_COMMENT block
    VorbisComment(VorbisComment),
}

impl Block {
    /// Our block type
    pub fn block_type(&self) -> BlockType {
        match self {
            Self::Streaminfo(_) => BlockType::Streaminfo,
            Self::Padding(_) => BlockType::Padding,
            Self::SeekTable(_) => BlockType::SeekTable,
            Self::VorbisComment(_) => BlockType::VorbisComment,
        }
    }

    /// The size of our contents in bytes, excluding the block header
    fn byte_len(&self) -> u64 {
        match self {
            Self::Streaminfo(_) => 34,
            Self::Padding(padding) => padding.size.into(),
            Self::SeekTable(seektable) => seektable.points.len() as u64 * 18,
            Self::VorbisComment(comment) => {
                4 + comment.vendor_string.len() as u64
                    + 4
                    + comment
                        .fields
                        .iter()
                        .map(|f| 4 + f.len() as u64)
                        .sum::<u64>()
            }
        }
    }
}

impl ToBitStreamUsing for Block {
    type Context = bool;
    type Error = Error;

    // builds to writer with header
    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W, is_last: bool) -> Result<(), Error> {
        w.build(&BlockHeader {
            last: is_last,
            block_type: self.block_type(),
            size: u32::try_from(self.byte_len())
                .ok()
                .filter(|size| *size <= BlockHeader::MAX_SIZE)
                .ok_or(Error::ExcessiveBlockSize)?,
        })?;

        match self {
            Self::Streaminfo(streaminfo) => w.build(streaminfo).map_err(Error::Io),
            Self::Padding(padding) => w.build(padding).map_err(Error::Io),
            Self::SeekTable(seektable) => w.build(seektable).map_err(Error::Io),
            Self::VorbisComment(comment) => w.build(comment),
        }
    }
}

/// Writes a single metadata block, with header, to the given stream
pub(crate) fn write_block<W: std::io::Write>(
    w: &mut W,
    is_last: bool,
    block: &Block,
) -> Result<(), Error> {
    let mut w = bitstream_io::BitWriter::endian(w, BigEndian);
    w.build_using(block, is_last)
}

/// Reads back the metadata blocks of a finished FLAC stream
///
/// Stops after the final metadata block, leaving the reader
/// positioned at the stream's first frame.  Block types this
/// encoder never writes (APPLICATION, CUESHEET, PICTURE) are
/// skipped rather than returned.
///
/// # Errors
///
/// Returns an error if the stream's leading `fLaC` tag is missing,
/// the first block is not a STREAMINFO block, a block is malformed,
/// or an I/O error occurs when reading.
pub fn read_blocks<R: std::io::Read>(reader: R) -> Result<Vec<Block>, Error> {
    let mut r = BitReader::endian(reader, BigEndian);

    if &r.read_to::<[u8; 4]>()? != FLAC_TAG {
        return Err(Error::MissingFlacTag);
    }

    let mut blocks = Vec::new();

    loop {
        let header: BlockHeader = r.parse()?;

        match header.block_type {
            BlockType::Streaminfo => blocks.push(Block::Streaminfo(r.parse()?)),
            BlockType::Padding => blocks.push(Block::Padding(r.parse_using(header.size)?)),
            BlockType::SeekTable => blocks.push(Block::SeekTable(r.parse_using(header.size)?)),
            BlockType::VorbisComment => blocks.push(Block::VorbisComment(r.parse()?)),
            BlockType::Application | BlockType::Cuesheet | BlockType::Picture => {
                r.skip(header.size * 8)?;
            }
        }

        if header.last {
            break;
        }
    }

    match blocks.first() {
        Some(Block::Streaminfo(_)) => Ok(blocks),
        _ => Err(Error::MissingStreaminfo),
    }
}

/// A STREAMINFO metadata block
///
/// This block is always present and always first in the file.
///
/// | Bits | Field | Meaning |
/// |-----:|------:|---------|
/// | 16   | `minimum_block_size` | minimum block size (in samples) in the stream
/// | 16   | `maximum_block_size` | maximum block size (in samples) in the stream
/// | 24   | `minimum_frame_size` | minimum frame size (in bytes) in the stream
/// | 24   | `maximum_frame_size` | maximum frame size (in bytes) in the stream
/// | 20   | `sample_rate` | stream's sample rate, in Hz
/// | 3    | `channels` | stream's channel count (+1)
/// | 5    | `bits_per_sample` | stream's bits-per-sample (+1)
/// | 36   | `total_samples` | stream's total channel-independent samples
/// | 16×8 | `md5` | decoded stream's MD5 sum hash
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Streaminfo {
    /// The minimum block size (in samples) used in the stream
    pub minimum_block_size: u16,
    /// The maximum block size (in samples) used in the stream
    pub maximum_block_size: u16,
    /// The minimum frame size (in bytes) used in the stream
    ///
    /// `None` indicates the value is unknown.
    pub minimum_frame_size: Option<NonZero<u32>>,
    /// The maximum frame size (in bytes) used in the stream
    ///
    /// `None` indicates the value is unknown.
    pub maximum_frame_size: Option<NonZero<u32>>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels, from 1 to 8
    pub channels: NonZero<u8>,
    /// Number of bits-per-sample, from 1 to 32
    pub bits_per_sample: SignedBitCount<32>,
    /// Total number of interchannel samples in the stream
    ///
    /// `None` indicates the value is unknown.
    pub total_samples: Option<NonZero<u64>>,
    /// MD5 hash of the unencoded audio data
    ///
    /// `None` indicates the value is unknown.
    pub md5: Option<[u8; 16]>,
}

impl Streaminfo {
    /// The maximum size of a frame, in bytes (2²⁴ - 1)
    pub const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

    /// The maximum number of total samples (2³⁶ - 1)
    pub const MAX_TOTAL_SAMPLES: u64 = (1 << 36) - 1;
}

impl FromBitStream for Streaminfo {
    type Error = std::io::Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        Ok(Self {
            minimum_block_size: r.read_to()?,
            maximum_block_size: r.read_to()?,
            minimum_frame_size: r.read::<24, _>()?,
            maximum_frame_size: r.read::<24, _>()?,
            sample_rate: r.read::<20, _>()?,
            channels: r.read::<3, _>()?,
            bits_per_sample: r
                .read_count::<0b11111>()?
                .checked_add(1)
                .and_then(|c| c.signed_count())
                .unwrap(),
            total_samples: r.read::<36, _>()?,
            md5: r
                .read_to()
                .map(|md5: [u8; 16]| md5.iter().any(|b| *b != 0).then_some(md5))?,
        })
    }
}

impl ToBitStream for Streaminfo {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write_from(self.minimum_block_size)?;
        w.write_from(self.maximum_block_size)?;
        w.write::<24, _>(self.minimum_frame_size)?;
        w.write::<24, _>(self.maximum_frame_size)?;
        w.write::<20, _>(self.sample_rate)?;
        w.write::<3, _>(self.channels)?;
        w.write_count(
            self.bits_per_sample
                .checked_sub::<0b11111>(1)
                .unwrap()
                .count(),
        )?;
        w.write::<36, _>(self.total_samples)?;
        w.write_from(self.md5.unwrap_or([0; 16]))
    }
}

/// A PADDING metadata block, whose contents are all 0 bytes
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Padding {
    /// The size of the padding, in bytes
    pub size: u32,
}

impl FromBitStreamUsing for Padding {
    type Context = u32;
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R, size: u32) -> Result<Self, Self::Error> {
        r.skip(size * 8)?;
        Ok(Self { size })
    }
}

impl ToBitStream for Padding {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.pad(self.size * 8)
    }
}

/// A SEEKTABLE metadata block
///
/// Its seek points occupy the entire block.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SeekTable {
    /// The table's individual seek points
    pub points: Vec<SeekPoint>,
}

impl FromBitStreamUsing for SeekTable {
    type Context = u32;
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R, size: u32) -> Result<Self, Self::Error> {
        match (size / 18, size % 18) {
            (points, 0) => Ok(Self {
                points: (0..points)
                    .map(|_| r.parse())
                    .collect::<Result<Vec<_>, _>>()?,
            }),
            _ => Err(Error::InvalidSeekTableSize),
        }
    }
}

impl ToBitStream for SeekTable {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        self.points.iter().try_for_each(|point| w.build(point))
    }
}

/// An individual SEEKTABLE seek point
///
/// | Bits | Field | Meaning |
/// |-----:|------:|---------|
/// | 64   | `sample_offset` | sample number of first sample in target frame
/// | 64   | `byte_offset` | offset, in bytes, from first frame to target frame's header
/// | 16   | `frame_samples` | number of samples in target frame
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SeekPoint {
    /// The sample number of the first sample in the target frame,
    /// or `None` for placeholder points
    pub sample_offset: Option<u64>,
    /// Offset, in bytes, from the first byte of the first frame header
    /// to the first byte of the target frame's header
    pub byte_offset: u64,
    /// Number of samples in the target frame
    pub frame_samples: u16,
}

impl FromBitStream for SeekPoint {
    type Error = std::io::Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        Ok(Self {
            sample_offset: r.read_to().map(|o| (o != u64::MAX).then_some(o))?,
            byte_offset: r.read_to()?,
            frame_samples: r.read_to()?,
        })
    }
}

impl ToBitStream for SeekPoint {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write_from(self.sample_offset.unwrap_or(u64::MAX))?;
        w.write_from(self.byte_offset)?;
        w.write_from(self.frame_samples)
    }
}

/// A VORBIS_COMMENT metadata block
///
/// Unlike the rest of a FLAC file, its length fields
/// are stored in little-endian byte order.
///
/// | Bits | Field | Meaning |
/// |-----:|------:|---------|
/// | 32   | vendor string len | length of vendor string, in bytes
/// | `vendor string len`×8 | `vendor_string` | vendor string, in UTF-8
/// | 32   | field count | number of fields
/// | 32   | field₀ len | length of field₀, in bytes
/// | `field₀ len`×8 | `fields₀` | first field value, in UTF-8
/// | | | ⋮
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VorbisComment {
    /// The vendor string
    pub vendor_string: String,
    /// The individual metadata comment strings
    pub fields: Vec<String>,
}

impl Default for VorbisComment {
    fn default() -> Self {
        Self {
            vendor_string: concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"))
                .to_owned(),
            fields: vec![],
        }
    }
}

impl VorbisComment {
    /// The channel mask of multi-channel or high-depth audio streams
    pub const CHANNEL_MASK: &str = "WAVEFORMATEXTENSIBLE_CHANNEL_MASK";
}

impl FromBitStream for VorbisComment {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        fn read_string<R: BitRead + ?Sized>(r: &mut R) -> Result<String, Error> {
            let size = r.read_as_to::<LittleEndian, u32>()?.try_into().unwrap();
            Ok(String::from_utf8(r.read_to_vec(size)?)?)
        }

        Ok(Self {
            vendor_string: read_string(r)?,
            fields: (0..r.read_as_to::<LittleEndian, u32>()?)
                .map(|_| read_string(r))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

impl ToBitStream for VorbisComment {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        fn write_string<W: BitWrite + ?Sized>(w: &mut W, s: &str) -> Result<(), Error> {
            w.write_as_from::<LittleEndian, u32>(
                s.len()
                    .try_into()
                    .map_err(|_| Error::ExcessiveStringLength)?,
            )?;
            w.write_bytes(s.as_bytes())?;
            Ok(())
        }

        write_string(w, &self.vendor_string)?;
        w.write_as_from::<LittleEndian, u32>(
            self.fields
                .len()
                .try_into()
                .map_err(|_| Error::ExcessiveVorbisEntries)?,
        )?;
        self.fields.iter().try_for_each(|s| write_string(w, s))
    }
}

/// A channel mask in the WAVEFORMATEXTENSIBLE style
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelMask {
    mask: u32,
}

impl ChannelMask {
    /// FLAC's standard channel assignment for the given channel count
    pub fn from_channels(channels: u8) -> Self {
        const FRONT_LEFT: u32 = 0x1;
        const FRONT_RIGHT: u32 = 0x2;
        const FRONT_CENTER: u32 = 0x4;
        const LFE: u32 = 0x8;
        const BACK_LEFT: u32 = 0x10;
        const BACK_RIGHT: u32 = 0x20;
        const BACK_CENTER: u32 = 0x100;
        const SIDE_LEFT: u32 = 0x200;
        const SIDE_RIGHT: u32 = 0x400;

        Self {
            mask: match channels {
                1 => FRONT_CENTER,
                2 => FRONT_LEFT | FRONT_RIGHT,
                3 => FRONT_LEFT | FRONT_RIGHT | FRONT_CENTER,
                4 => FRONT_LEFT | FRONT_RIGHT | BACK_LEFT | BACK_RIGHT,
                5 => FRONT_LEFT | FRONT_RIGHT | FRONT_CENTER | BACK_LEFT | BACK_RIGHT,
                6 => FRONT_LEFT | FRONT_RIGHT | FRONT_CENTER | BACK_LEFT | BACK_RIGHT | LFE,
                7 => {
                    FRONT_LEFT
                        | FRONT_RIGHT
                        | FRONT_CENTER
                        | LFE
                        | BACK_CENTER
                        | SIDE_LEFT
                        | SIDE_RIGHT
                }
                8 => {
                    FRONT_LEFT
                        | FRONT_RIGHT
                        | FRONT_CENTER
                        | LFE
                        | BACK_LEFT
                        | BACK_RIGHT
                        | SIDE_LEFT
                        | SIDE_RIGHT
                }
                _ => 0,
            },
        }
    }
}

impl std::fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "0x{:04x}", self.mask)
    }
}

impl From<u32> for ChannelMask {
    fn from(mask: u32) -> ChannelMask {
        ChannelMask { mask }
    }
}

impl From<ChannelMask> for u32 {
    fn from(mask: ChannelMask) -> u32 {
        mask.mask
    }
}
