// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The PCM sample source pulled from by the encoder

use crate::byteorder::Endianness;
use crate::metadata::ChannelMask;

/// A pull-based source of interleaved PCM samples
pub trait PcmReader {
    /// Returns sample rate, in Hz
    fn sample_rate(&self) -> u32;

    /// Returns channel count
    fn channels(&self) -> u8;

    /// Returns bits-per-sample
    fn bits_per_sample(&self) -> u32;

    /// Returns the stream's channel mask
    ///
    /// Defaults to FLAC's standard assignment for the channel count.
    fn channel_mask(&self) -> ChannelMask {
        ChannelMask::from_channels(self.channels())
    }

    /// Reads as many whole PCM frames as fit the given buffer
    ///
    /// Samples are written in interleaved order, so the buffer
    /// should hold a multiple of the channel count and the
    /// number of PCM frames read is `buf.len()` divided by
    /// the channel count, at most.
    ///
    /// Readers should deliver full buffers whenever that many
    /// frames remain in the stream; a short read signals that
    /// the stream's final frames have been reached.
    ///
    /// # Errors
    ///
    /// Returns `Ok(0)` on a clean end of stream.  Any error
    /// is a read failure which aborts encoding entirely.
    fn read(&mut self, buf: &mut [i32]) -> std::io::Result<usize>;
}

/// A reader of raw, interleaved, fixed-width signed PCM samples
///
/// Samples occupy the smallest whole number of bytes
/// which holds their bits-per-sample.
pub struct RawPcmReader<R, E: Endianness> {
    reader: R,
    sample_rate: u32,
    channels: u8,
    bits_per_sample: u32,
    bytes_per_sample: usize,
    buf: Vec<u8>,
    phantom: std::marker::PhantomData<E>,
}

impl<R: std::io::Read, E: Endianness> RawPcmReader<R, E> {
    /// Builds a raw PCM reader from the given stream and parameters
    pub fn new(reader: R, sample_rate: u32, channels: u8, bits_per_sample: u32) -> Self {
        Self {
            reader,
            sample_rate,
            channels,
            bits_per_sample,
            bytes_per_sample: bits_per_sample.div_ceil(8) as usize,
            buf: Vec::new(),
            phantom: std::marker::PhantomData,
        }
    }
}

impl<R: std::io::Read, E: Endianness> PcmReader for RawPcmReader<R, E> {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u8 {
        self.channels
    }

    fn bits_per_sample(&self) -> u32 {
        self.bits_per_sample
    }

    fn read(&mut self, buf: &mut [i32]) -> std::io::Result<usize> {
        let convert: fn(&[u8]) -> i32 = match self.bytes_per_sample {
            1 => |b| E::bytes_to_i8([b[0]]).into(),
            2 => |b| E::bytes_to_i16([b[0], b[1]]).into(),
            3 => |b| E::bytes_to_i24([b[0], b[1], b[2]]),
            4 => |b| E::bytes_to_i32([b[0], b[1], b[2], b[3]]),
            _ => panic!("unsupported number of bytes per sample"),
        };

        let frame_bytes = usize::from(self.channels) * self.bytes_per_sample;
        let byte_len = (buf.len() / usize::from(self.channels)) * frame_bytes;
        self.buf.resize(byte_len, 0);

        // fill as much of the buffer as the stream allows
        let mut filled = 0;
        while filled < byte_len {
            match self.reader.read(&mut self.buf[filled..byte_len])? {
                0 => break,
                read => filled += read,
            }
        }

        // any trailing partial PCM frame is dropped
        let pcm_frames = filled / frame_bytes;

        for (sample, bytes) in buf
            .iter_mut()
            .zip(self.buf[0..pcm_frames * frame_bytes].chunks_exact(self.bytes_per_sample))
        {
            *sample = convert(bytes);
        }

        Ok(pcm_frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byteorder::LittleEndian;
    use std::io::Cursor;

    #[test]
    fn test_raw_pcm_reader() {
        let mut bytes = Vec::new();
        for sample in [0i16, 1, -1, 32767, -32768, 100, -100, 12345] {
            bytes.extend(LittleEndian::i16_to_bytes(sample));
        }

        let mut r: RawPcmReader<_, LittleEndian> =
            RawPcmReader::new(Cursor::new(bytes), 44100, 2, 16);

        let mut buf = vec![0; 6];
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [0, 1, -1, 32767, -32768, 100]);

        // only one whole PCM frame left
        assert_eq!(r.read(&mut buf).unwrap(), 1);
        assert_eq!(&buf[0..2], [-100, 12345]);

        // clean end of stream
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_partial_frame_dropped() {
        // three bytes is one and a half 16-bit samples
        let mut r: RawPcmReader<_, LittleEndian> =
            RawPcmReader::new(Cursor::new(vec![0x01, 0x00, 0x02]), 44100, 1, 16);

        let mut buf = vec![0; 4];
        assert_eq!(r.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 1);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }
}
