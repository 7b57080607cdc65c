// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A library for encoding PCM audio samples to FLAC files
//!
//! The encoder pulls batches of interleaved samples from a
//! [`PcmReader`](pcm::PcmReader), encodes one FLAC frame per batch
//! and finalizes the stream's metadata once all samples are consumed.
//!
//! # Example
//! ```
//! use flac_encoder::encode::{Options, encode};
//! use flac_encoder::pcm::RawPcmReader;
//! use flac_encoder::byteorder::LittleEndian;
//! use std::io::Cursor;
//! use std::num::NonZero;
//!
//! // a second of 16-bit silence
//! let pcm = vec![0u8; 44100 * 2];
//!
//! let mut reader: RawPcmReader<_, LittleEndian> =
//!     RawPcmReader::new(Cursor::new(pcm), 44100, 1, 16);
//!
//! let mut flac = Cursor::new(Vec::new());
//!
//! encode(
//!     &mut reader,
//!     &mut flac,
//!     Options::default(),
//!     NonZero::new(44100),
//! )
//! .unwrap();
//!
//! assert!(flac.into_inner().starts_with(b"fLaC"));
//! ```

pub mod byteorder;
mod crc;
pub mod encode;
mod lpc;
pub mod metadata;
pub mod pcm;
mod rice;
mod stream;

/// An error when encoding a FLAC file
#[derive(Debug)]
pub enum Error {
    /// An I/O error from the output stream
    Io(std::io::Error),
    /// A read failure from the PCM source
    SourceRead(std::io::Error),
    /// Scratch storage could not be set up for
    /// a stream of unknown total length
    ScratchStorage(std::io::Error),
    /// A string isn't valid UTF-8
    Utf8(std::string::FromUtf8Error),
    /// The number of samples read differs from the declared total
    SampleCountMismatch,
    /// Block size is 0
    InvalidBlockSize,
    /// Residual partition orders exceed 15, or minimum exceeds maximum
    InvalidPartitionOrder,
    /// LPC order exceeds 32
    ExcessiveLpcOrder,
    /// Padding doesn't fit a metadata block
    ExcessivePadding,
    /// Sample rate doesn't fit a 20 bit field
    InvalidSampleRate,
    /// Bits-per-sample not in the range 1 to 32
    InvalidBitsPerSample,
    /// Channel count not in the range 1 to 8
    ExcessiveChannels,
    /// Total samples don't fit a 36 bit field
    ExcessiveTotalSamples,
    /// Frame number doesn't fit its variable-length field
    ExcessiveFrames,
    /// A metadata block's size doesn't fit a 24 bit field
    ExcessiveBlockSize,
    /// A comment string's length doesn't fit a 32 bit field
    ExcessiveStringLength,
    /// The number of comment strings doesn't fit a 32 bit field
    ExcessiveVorbisEntries,
    /// Missing initial "fLaC" tag
    MissingFlacTag,
    /// STREAMINFO block not first in file
    MissingStreaminfo,
    /// A reserved metadata block was encountered
    ReservedMetadataBlock,
    /// A SEEKTABLE block's size isn't an even number of seek points
    InvalidSeekTableSize,
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(error: std::string::FromUtf8Error) -> Self {
        Self::Utf8(error)
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::SourceRead(e) => write!(f, "PCM source read failure: {e}"),
            Self::ScratchStorage(e) => write!(f, "scratch storage unavailable: {e}"),
            Self::Utf8(e) => e.fmt(f),
            Self::SampleCountMismatch => "total PCM frames mismatch".fmt(f),
            Self::InvalidBlockSize => "invalid block size".fmt(f),
            Self::InvalidPartitionOrder => "invalid residual partition order".fmt(f),
            Self::ExcessiveLpcOrder => "maximum LPC order too large".fmt(f),
            Self::ExcessivePadding => "padding too large for metadata block".fmt(f),
            Self::InvalidSampleRate => "invalid sample rate".fmt(f),
            Self::InvalidBitsPerSample => "invalid bits-per-sample".fmt(f),
            Self::ExcessiveChannels => "excessive number of channels".fmt(f),
            Self::ExcessiveTotalSamples => "excessive number of total samples".fmt(f),
            Self::ExcessiveFrames => "excessive number of frames".fmt(f),
            Self::ExcessiveBlockSize => "metadata block too large".fmt(f),
            Self::ExcessiveStringLength => "comment string too large".fmt(f),
            Self::ExcessiveVorbisEntries => "excessive number of comment strings".fmt(f),
            Self::MissingFlacTag => "missing FLAC tag".fmt(f),
            Self::MissingStreaminfo => "STREAMINFO block not first in file".fmt(f),
            Self::ReservedMetadataBlock => "reserved metadata block".fmt(f),
            Self::InvalidSeekTableSize => "invalid SEEKTABLE block size".fmt(f),
        }
    }
}

/// A stream wrapper which counts the bytes passing through it
pub(crate) struct Counter<S> {
    pub stream: S,
    pub count: u64,
}

impl<S> Counter<S> {
    pub fn new(stream: S) -> Self {
        Self { stream, count: 0 }
    }
}

impl<W: std::io::Write> std::io::Write for Counter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf).inspect(|written| {
            self.count += *written as u64;
        })
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}
