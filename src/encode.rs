// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For encoding PCM samples to FLAC files
//!
//! One FLAC frame is produced per batch of samples pulled from
//! the source.  Within each frame, every channel's subframe is
//! chosen by trial: FIXED and LPC candidates are speculatively
//! encoded into size-bounded scratch buffers and the smallest
//! result wins, with VERBATIM as the fallback that can never
//! overflow.  Two-channel frames additionally try the stereo
//! decorrelation strategies and keep the cheapest assignment.

use crate::crc::{Crc16, CrcWriter};
use crate::lpc::{self, LpcAnalysis, QuantizedLpc};
use crate::metadata::{Block, Padding, SeekPoint, SeekTable, Streaminfo, VorbisComment, write_block};
use crate::pcm::PcmReader;
use crate::rice::{TrialError, within_budget, write_residual_block};
use crate::stream::{ChannelAssignment, FrameHeader, FrameNumber, SubframeHeader, SubframeType};
use crate::{Counter, Error};
use bitstream_io::{BigEndian, BitRecorder, BitWrite, BitWriter, LittleEndian};
use std::io::{Seek, SeekFrom, Write};
use std::num::NonZero;

/// FLAC encoding options
///
/// ```
/// use flac_encoder::encode::Options;
///
/// let options = Options::default()
///     .block_size(2048)
///     .unwrap()
///     .mid_side()
///     .exhaustive_model_search();
/// ```
#[derive(Clone, Debug)]
pub struct Options {
    block_size: u16,
    min_residual_partition_order: u8,
    max_residual_partition_order: u8,
    max_lpc_order: u8,
    exhaustive_model_search: bool,
    mid_side: bool,
    adaptive_mid_side: bool,
    use_constant: bool,
    use_verbatim: bool,
    use_fixed: bool,
    padding_size: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            block_size: 4096,
            min_residual_partition_order: 0,
            max_residual_partition_order: 6,
            max_lpc_order: 12,
            exhaustive_model_search: false,
            mid_side: false,
            adaptive_mid_side: false,
            use_constant: true,
            use_verbatim: true,
            use_fixed: true,
            padding_size: 4096,
        }
    }
}

impl Options {
    /// Assigns a new block size, in PCM frames
    ///
    /// # Errors
    ///
    /// Returns an error if the block size is 0.
    pub fn block_size(self, block_size: u16) -> Result<Self, Error> {
        (block_size > 0)
            .then_some(Self { block_size, ..self })
            .ok_or(Error::InvalidBlockSize)
    }

    /// Assigns minimum and maximum residual partition orders
    ///
    /// # Errors
    ///
    /// Returns an error if the minimum exceeds the maximum,
    /// or either exceeds 15.
    pub fn partition_orders(self, min: u8, max: u8) -> Result<Self, Error> {
        (min <= max && max <= 15)
            .then_some(Self {
                min_residual_partition_order: min,
                max_residual_partition_order: max,
                ..self
            })
            .ok_or(Error::InvalidPartitionOrder)
    }

    /// Assigns a new maximum LPC order
    ///
    /// An order of 0 disables LPC subframes entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the order exceeds 32.
    pub fn max_lpc_order(self, max_lpc_order: u8) -> Result<Self, Error> {
        (max_lpc_order <= 32)
            .then_some(Self {
                max_lpc_order,
                ..self
            })
            .ok_or(Error::ExcessiveLpcOrder)
    }

    /// Trial-encodes every candidate LPC order instead of
    /// estimating the best one analytically
    pub fn exhaustive_model_search(self) -> Self {
        Self {
            exhaustive_model_search: true,
            ..self
        }
    }

    /// Enables stereo decorrelation of 2-channel streams
    pub fn mid_side(self) -> Self {
        Self {
            mid_side: true,
            ..self
        }
    }

    /// Enables adaptive stereo decorrelation of 2-channel streams
    pub fn adaptive_mid_side(self) -> Self {
        Self {
            adaptive_mid_side: true,
            ..self
        }
    }

    /// Disables CONSTANT subframes
    pub fn no_constant_subframes(self) -> Self {
        Self {
            use_constant: false,
            ..self
        }
    }

    /// Disables VERBATIM subframes
    pub fn no_verbatim_subframes(self) -> Self {
        Self {
            use_verbatim: false,
            ..self
        }
    }

    /// Disables FIXED subframes
    pub fn no_fixed_subframes(self) -> Self {
        Self {
            use_fixed: false,
            ..self
        }
    }

    /// Disables LPC subframes
    pub fn no_lpc_subframes(self) -> Self {
        Self {
            max_lpc_order: 0,
            ..self
        }
    }

    /// Assigns a new PADDING block size, in bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the padding doesn't fit
    /// a metadata block's 24 bit length field.
    pub fn padding(self, padding_size: u32) -> Result<Self, Error> {
        (padding_size < 1 << 24)
            .then_some(Self {
                padding_size,
                ..self
            })
            .ok_or(Error::ExcessivePadding)
    }

    /// Omits the PADDING block entirely
    pub fn no_padding(self) -> Self {
        Self {
            padding_size: 0,
            ..self
        }
    }
}

/// Everything one encode needs, derived once before the first frame
/// and fixed thereafter
pub(crate) struct Parameters {
    pub block_size: u16,
    pub min_partition_order: u32,
    pub max_partition_order: u32,
    pub max_lpc_order: usize,
    pub exhaustive_model_search: bool,
    pub mid_side: bool,
    pub adaptive_mid_side: bool,
    pub use_constant: bool,
    pub use_verbatim: bool,
    pub use_fixed: bool,
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u32,
    /// LPC coefficient precision, derived from block size
    pub qlp_precision: u32,
    /// Largest permitted Rice parameter, derived from bit depth
    pub max_rice_parameter: u32,
    /// The analysis window, sized to the block size
    pub window: Box<[f64]>,
}

impl Parameters {
    fn new<P: PcmReader + ?Sized>(options: &Options, pcmreader: &P) -> Result<Self, Error> {
        let sample_rate = pcmreader.sample_rate();
        let channels = pcmreader.channels();
        let bits_per_sample = pcmreader.bits_per_sample();

        if sample_rate >= 1 << 20 {
            return Err(Error::InvalidSampleRate);
        } else if !(1..=8).contains(&channels) {
            return Err(Error::ExcessiveChannels);
        } else if !(1..=32).contains(&bits_per_sample) {
            return Err(Error::InvalidBitsPerSample);
        }

        Ok(Self {
            block_size: options.block_size,
            min_partition_order: options.min_residual_partition_order.into(),
            max_partition_order: options.max_residual_partition_order.into(),
            max_lpc_order: options.max_lpc_order.into(),
            exhaustive_model_search: options.exhaustive_model_search,
            mid_side: options.mid_side,
            adaptive_mid_side: options.adaptive_mid_side,
            use_constant: options.use_constant,
            use_verbatim: options.use_verbatim,
            use_fixed: options.use_fixed,
            sample_rate,
            channels,
            bits_per_sample,
            qlp_precision: match options.block_size {
                ..=192 => 7,
                ..=384 => 8,
                ..=576 => 9,
                ..=1152 => 10,
                ..=2304 => 11,
                ..=4608 => 12,
                _ => 13,
            },
            max_rice_parameter: if bits_per_sample <= 16 { 15 } else { 31 },
            window: if options.max_lpc_order > 0 {
                lpc::tukey_window(0.5, options.block_size.into())
            } else {
                Box::new([])
            },
        })
    }

    fn streaminfo(
        &self,
        minimum_frame_size: u32,
        maximum_frame_size: u32,
        total_samples: Option<NonZero<u64>>,
        md5: Option<[u8; 16]>,
    ) -> Streaminfo {
        Streaminfo {
            minimum_block_size: self.block_size,
            maximum_block_size: self.block_size,
            minimum_frame_size: NonZero::new(minimum_frame_size),
            maximum_frame_size: NonZero::new(maximum_frame_size),
            sample_rate: self.sample_rate,
            channels: NonZero::new(self.channels).unwrap(),
            bits_per_sample: self.bits_per_sample.try_into().ok().unwrap(),
            total_samples,
            md5,
        }
    }
}

/// The size of one encoded frame
#[derive(Copy, Clone, Debug)]
struct FrameSize {
    byte_size: u32,
    pcm_frames: u16,
}

/// Encodes all samples from the given PCM source to a FLAC stream
///
/// When `total_pcm_frames` is known, provisional STREAMINFO and
/// SEEKTABLE blocks are written up front and rewritten in place
/// once all frames are on disk.  The number of PCM frames read
/// from the source *must* then equal the declared total or the
/// encode fails, leaving the output in an undefined state.
///
/// When the total is unknown, frames are encoded to temporary
/// scratch storage first and copied behind the finished metadata,
/// so nothing reaches the output until the totals are known.
///
/// # Errors
///
/// Returns an error if the source's parameters are unsupported,
/// the source fails mid-read, the declared total doesn't match
/// the samples actually read, scratch storage can't be created,
/// or the output stream fails.
pub fn encode<P, W>(
    pcmreader: &mut P,
    mut output: W,
    options: Options,
    total_pcm_frames: Option<NonZero<u64>>,
) -> Result<(), Error>
where
    P: PcmReader + ?Sized,
    W: Write + Seek,
{
    let params = Parameters::new(&options, pcmreader)?;

    // seek points every 10 seconds or every 10 frames,
    // whichever interval is larger
    let seekpoint_interval = u64::from(params.sample_rate.max(params.block_size.into())) * 10;

    let mut md5 = BitWriter::endian(md5::Context::new(), LittleEndian);

    let comment = {
        let mut comment = VorbisComment::default();
        let channel_mask = pcmreader.channel_mask();
        if (params.channels > 2 || params.bits_per_sample > 16) && u32::from(channel_mask) != 0 {
            comment
                .fields
                .push(format!("{}={}", VorbisComment::CHANNEL_MASK, channel_mask));
        }
        comment
    };

    match total_pcm_frames {
        Some(total) if total.get() > Streaminfo::MAX_TOTAL_SAMPLES => {
            Err(Error::ExcessiveTotalSamples)
        }
        Some(total) => {
            // the total is known up front, so provisional blocks
            // go straight to the output and are rewritten in place
            // once the real frame statistics are known
            output.write_all(b"fLaC")?;
            let header_start = output.stream_position()?;

            write_block(
                &mut output,
                false,
                &Block::Streaminfo(params.streaminfo(
                    Streaminfo::MAX_FRAME_SIZE,
                    0,
                    Some(total),
                    None,
                )),
            )?;

            // sized from the frame layout the declared total implies,
            // so the final SEEKTABLE overwrites it exactly
            let seek_points = seek_table(
                dummy_frame_sizes(total.get(), params.block_size),
                seekpoint_interval,
            )
            .points
            .len();

            write_block(
                &mut output,
                false,
                &Block::Padding(Padding {
                    size: u32::try_from(seek_points * 18).map_err(|_| Error::ExcessiveBlockSize)?,
                }),
            )?;

            write_block(
                &mut output,
                options.padding_size == 0,
                &Block::VorbisComment(comment),
            )?;

            if options.padding_size > 0 {
                write_block(
                    &mut output,
                    true,
                    &Block::Padding(Padding {
                        size: options.padding_size,
                    }),
                )?;
            }

            let sizes = encode_frames(pcmreader, &mut output, &params, &mut md5)?;

            let (minimum_frame_size, maximum_frame_size, encoded_pcm_frames) =
                frame_sizes_info(&sizes);

            if encoded_pcm_frames != total.get() {
                // no rewrite happens, so the provisional header's
                // zeroed hash and placeholder frame sizes remain
                return Err(Error::SampleCountMismatch);
            }

            let md5 = md5.aligned_writer()?.clone().compute().0;

            output.seek(SeekFrom::Start(header_start))?;

            write_block(
                &mut output,
                false,
                &Block::Streaminfo(params.streaminfo(
                    minimum_frame_size,
                    maximum_frame_size,
                    Some(total),
                    Some(md5),
                )),
            )?;

            write_block(
                &mut output,
                false,
                &Block::SeekTable(seek_table(sizes.iter().copied(), seekpoint_interval)),
            )?;

            Ok(())
        }
        None => {
            // the total isn't known until every frame is encoded,
            // so frames go to scratch storage and nothing reaches
            // the output until the metadata can be final
            let mut scratch = tempfile::tempfile().map_err(Error::ScratchStorage)?;

            let sizes = {
                let mut buffered = std::io::BufWriter::new(&mut scratch);
                let sizes = encode_frames(pcmreader, &mut buffered, &params, &mut md5)?;
                buffered.flush()?;
                sizes
            };

            let (minimum_frame_size, maximum_frame_size, total) = frame_sizes_info(&sizes);

            if total > Streaminfo::MAX_TOTAL_SAMPLES {
                return Err(Error::ExcessiveTotalSamples);
            }

            let md5 = md5.aligned_writer()?.clone().compute().0;

            output.write_all(b"fLaC")?;

            write_block(
                &mut output,
                false,
                &Block::Streaminfo(params.streaminfo(
                    minimum_frame_size,
                    maximum_frame_size,
                    NonZero::new(total),
                    Some(md5),
                )),
            )?;

            write_block(
                &mut output,
                false,
                &Block::SeekTable(seek_table(sizes.iter().copied(), seekpoint_interval)),
            )?;

            write_block(
                &mut output,
                options.padding_size == 0,
                &Block::VorbisComment(comment),
            )?;

            if options.padding_size > 0 {
                write_block(
                    &mut output,
                    true,
                    &Block::Padding(Padding {
                        size: options.padding_size,
                    }),
                )?;
            }

            scratch.rewind()?;
            std::io::copy(&mut scratch, &mut output)?;

            Ok(())
        }
    }
}

/// Encodes one frame per PCM batch until the source runs dry
fn encode_frames<P, W>(
    pcmreader: &mut P,
    output: &mut W,
    params: &Parameters,
    md5: &mut BitWriter<md5::Context, LittleEndian>,
) -> Result<Vec<FrameSize>, Error>
where
    P: PcmReader + ?Sized,
    W: Write,
{
    let channels = usize::from(params.channels);
    let mut pcm = vec![0; usize::from(params.block_size) * channels];
    let mut sizes = Vec::new();
    let mut frame_number = FrameNumber::default();

    loop {
        let pcm_frames = pcmreader.read(&mut pcm).map_err(Error::SourceRead)?;
        if pcm_frames == 0 {
            return Ok(sizes);
        }

        let block = &pcm[0..pcm_frames * channels];

        // running digest of the stream's raw little-endian bytes
        for sample in block {
            md5.write_var(params.bits_per_sample, *sample)?;
            md5.byte_align()?;
        }

        let byte_size = encode_frame(output, params, block, pcm_frames, frame_number)?;

        sizes.push(FrameSize {
            byte_size,
            pcm_frames: pcm_frames as u16,
        });

        frame_number.try_increment()?;
    }
}

/// Encodes exactly one frame and returns its byte size
fn encode_frame<W: Write>(
    output: &mut W,
    params: &Parameters,
    pcm: &[i32],
    pcm_frames: usize,
    frame_number: FrameNumber,
) -> Result<u32, Error> {
    let mut w: CrcWriter<_, Crc16> = CrcWriter::new(Counter::new(output.by_ref()));

    let channels = usize::from(params.channels);

    if channels == 2 && (params.mid_side || params.adaptive_mid_side) {
        let mut left: Vec<i32> = pcm.iter().copied().step_by(2).collect();
        let mut right: Vec<i32> = pcm.iter().copied().skip(1).step_by(2).collect();

        // floor division, as an arithmetic right shift
        let mut average: Vec<i32> = left.iter().zip(&right).map(|(l, r)| (l + r) >> 1).collect();
        let mut difference: Vec<i32> = left.iter().zip(&right).map(|(l, r)| l - r).collect();

        let left_subframe = record_subframe(params, &mut left, params.bits_per_sample)?;
        let right_subframe = record_subframe(params, &mut right, params.bits_per_sample)?;
        let average_subframe = record_subframe(params, &mut average, params.bits_per_sample)?;
        // the difference channel is one bit wider
        let difference_subframe =
            record_subframe(params, &mut difference, params.bits_per_sample + 1)?;

        let independent = left_subframe.written() + right_subframe.written();
        let left_side = left_subframe.written() + difference_subframe.written();
        let side_right = difference_subframe.written() + right_subframe.written();
        let mid_side = average_subframe.written() + difference_subframe.written();

        // exact ties fall to the earliest strategy,
        // keeping the output bit-reproducible
        let (assignment, subframes) =
            if independent < left_side && independent < side_right && independent < mid_side {
                (
                    ChannelAssignment::Independent(2),
                    [&left_subframe, &right_subframe],
                )
            } else if left_side < side_right && left_side < mid_side {
                (
                    ChannelAssignment::LeftSide,
                    [&left_subframe, &difference_subframe],
                )
            } else if side_right < mid_side {
                (
                    ChannelAssignment::SideRight,
                    [&difference_subframe, &right_subframe],
                )
            } else {
                (
                    ChannelAssignment::MidSide,
                    [&average_subframe, &difference_subframe],
                )
            };

        FrameHeader {
            block_size: pcm_frames as u16,
            sample_rate: params.sample_rate,
            bits_per_sample: params.bits_per_sample,
            channel_assignment: assignment,
            frame_number,
        }
        .write(&mut w)?;

        let mut w = BitWriter::endian(w, BigEndian);
        for subframe in subframes {
            subframe.playback(&mut w)?;
        }

        finish_frame(w)
    } else {
        FrameHeader {
            block_size: pcm_frames as u16,
            sample_rate: params.sample_rate,
            bits_per_sample: params.bits_per_sample,
            channel_assignment: ChannelAssignment::Independent(params.channels),
            frame_number,
        }
        .write(&mut w)?;

        let mut w = BitWriter::endian(w, BigEndian);
        for channel in 0..channels {
            let mut samples: Vec<i32> = pcm.iter().copied().skip(channel).step_by(channels).collect();
            encode_subframe(&mut w, params, &mut samples, params.bits_per_sample)?;
        }

        finish_frame(w)
    }
}

/// Aligns the frame, appends its CRC-16 and returns the byte count
fn finish_frame<W: Write>(
    mut w: BitWriter<CrcWriter<Counter<W>, Crc16>, BigEndian>,
) -> Result<u32, Error> {
    w.byte_align()?;
    let crc16 = w.aligned_writer()?.checksum();
    w.write_from(crc16)?;
    Ok(w.into_writer().into_writer().count as u32)
}

/// Trial-encodes one channel's subframe into a fresh recorder
fn record_subframe(
    params: &Parameters,
    samples: &mut [i32],
    bits_per_sample: u32,
) -> Result<BitRecorder<u32, BigEndian>, Error> {
    let mut recorder = BitRecorder::new();
    encode_subframe(&mut recorder, params, samples, bits_per_sample)?;
    Ok(recorder)
}

/// Selects and emits the cheapest lossless encoding
/// of one channel's samples
fn encode_subframe<W: BitWrite>(
    w: &mut W,
    params: &Parameters,
    samples: &mut [i32],
    bits_per_sample: u32,
) -> Result<(), Error> {
    debug_assert!(!samples.is_empty());

    if params.use_constant && samples_identical(samples) {
        w.build(&SubframeHeader {
            type_: SubframeType::Constant,
            wasted_bps: 0,
        })?;
        return Ok(w.write_var(bits_per_sample, samples[0])?);
    }

    // shared low-order zero bits come out before prediction
    // and are re-added by the subframe header
    let wasted_bps = wasted_bits(samples);
    let bits_per_sample = bits_per_sample - wasted_bps;
    if wasted_bps > 0 {
        samples.iter_mut().for_each(|sample| *sample >>= wasted_bps);
    }

    // VERBATIM's fixed cost bounds every trial encoding,
    // letting a losing candidate bail out early
    let mut budget = params
        .use_verbatim
        .then_some(8 + wasted_bps + bits_per_sample * samples.len() as u32);

    let mut best: Option<BitRecorder<u32, BigEndian>> = None;

    if params.use_fixed {
        let mut recorder = BitRecorder::new();
        match encode_fixed_subframe(&mut recorder, budget, params, samples, bits_per_sample, wasted_bps)
        {
            Ok(()) => {
                budget = Some(recorder.written());
                best = Some(recorder);
            }
            Err(TrialError::Oversize) => {}
            Err(TrialError::Io(err)) => return Err(Error::Io(err)),
        }
    }

    if params.max_lpc_order > 0 {
        let mut recorder = BitRecorder::new();
        match encode_lpc_subframe(&mut recorder, budget, params, samples, bits_per_sample, wasted_bps)
        {
            // a bounded LPC result supersedes the FIXED candidate
            Ok(()) => best = Some(recorder),
            Err(TrialError::Oversize) => {}
            Err(TrialError::Io(err)) => return Err(Error::Io(err)),
        }
    }

    match best {
        Some(subframe) => Ok(subframe.playback(w)?),
        None => {
            // VERBATIM can't overflow and always terminates the subframe
            w.build(&SubframeHeader {
                type_: SubframeType::Verbatim,
                wasted_bps,
            })?;
            samples
                .iter()
                .try_for_each(|sample| w.write_var(bits_per_sample, *sample))?;
            Ok(())
        }
    }
}

/// Encodes a FIXED subframe of the best successive-difference order
fn encode_fixed_subframe(
    w: &mut BitRecorder<u32, BigEndian>,
    budget: Option<u32>,
    params: &Parameters,
    samples: &[i32],
    bits_per_sample: u32,
    wasted_bps: u32,
) -> Result<(), TrialError> {
    let (order, residuals) = best_fixed_order(samples);

    w.build(&SubframeHeader {
        type_: SubframeType::Fixed(order as u32),
        wasted_bps,
    })?;

    for sample in &samples[0..order] {
        w.write_var(bits_per_sample, *sample)?;
    }
    within_budget(w, budget)?;

    write_residual_block(w, budget, params, samples.len(), order, &residuals)
}

/// Computes every difference order incrementally and picks the one
/// whose residuals have the smallest sum of magnitudes
fn best_fixed_order(samples: &[i32]) -> (usize, Vec<i32>) {
    let max_order = samples.len().saturating_sub(1).min(4);

    let mut orders: Vec<Vec<i32>> = Vec::with_capacity(max_order + 1);
    orders.push(samples.to_vec());
    for order in 1..=max_order {
        // each order is the first difference of the one before it
        orders.push(next_fixed_order(&orders[order - 1]));
    }

    let mut best_order = 0;
    let mut best_sum = abs_sum(&orders[0]);

    for (order, residuals) in orders.iter().enumerate().skip(1) {
        let sum = abs_sum(residuals);
        if sum < best_sum {
            best_order = order;
            best_sum = sum;
        }
    }

    let residuals = orders.swap_remove(best_order);
    (best_order, residuals)
}

fn next_fixed_order(previous: &[i32]) -> Vec<i32> {
    previous.windows(2).map(|pair| pair[1] - pair[0]).collect()
}

fn abs_sum(values: &[i32]) -> u64 {
    values.iter().map(|v| u64::from(v.unsigned_abs())).sum()
}

/// Encodes an LPC subframe after modeling and quantizing
/// the block's predictor coefficients
fn encode_lpc_subframe(
    w: &mut BitRecorder<u32, BigEndian>,
    budget: Option<u32>,
    params: &Parameters,
    samples: &[i32],
    bits_per_sample: u32,
    wasted_bps: u32,
) -> Result<(), TrialError> {
    let max_order = params.max_lpc_order.min(samples.len().saturating_sub(1));

    let predictor = match lpc::analyze(&params.window, samples, max_order) {
        LpcAnalysis::Trivial => QuantizedLpc::trivial(),
        LpcAnalysis::Model(table) => {
            if !params.exhaustive_model_search {
                let order = table.estimate_order(bits_per_sample, params.qlp_precision, samples.len());
                table.quantize(order, params.qlp_precision)
            } else {
                // one recursion already produced every order's
                // coefficients, so quantize and trial-encode each
                // candidate order and keep the smallest
                let mut best: Option<(u32, QuantizedLpc)> = None;

                for order in 1..=table.max_order() {
                    let candidate = table.quantize(order, params.qlp_precision);

                    let mut trial = BitRecorder::new();
                    match write_lpc_subframe(
                        &mut trial,
                        best.as_ref().map(|(bits, _)| *bits),
                        params,
                        samples,
                        bits_per_sample,
                        &candidate,
                    ) {
                        Ok(()) => match &best {
                            Some((bits, _)) if trial.written() >= *bits => {}
                            _ => best = Some((trial.written(), candidate)),
                        },
                        Err(TrialError::Oversize) => {}
                        Err(err) => return Err(err),
                    }
                }

                // the first candidate had no budget, so one always lands
                let (_, predictor) = best.unwrap();
                predictor
            }
        }
    };

    w.build(&SubframeHeader {
        type_: SubframeType::Lpc(predictor.order() as u32),
        wasted_bps,
    })?;

    write_lpc_subframe(w, budget, params, samples, bits_per_sample, &predictor)
}

/// Writes an LPC subframe's body: warm-up samples, quantization
/// fields, coefficients, and the coded residuals
fn write_lpc_subframe(
    w: &mut BitRecorder<u32, BigEndian>,
    budget: Option<u32>,
    params: &Parameters,
    samples: &[i32],
    bits_per_sample: u32,
    predictor: &QuantizedLpc,
) -> Result<(), TrialError> {
    let order = predictor.order();

    for sample in &samples[0..order] {
        w.write_var(bits_per_sample, *sample)?;
    }
    w.write_var(4, predictor.precision - 1)?;
    w.write_var(5, predictor.shift)?;
    for coefficient in &predictor.coefficients {
        w.write_var(predictor.precision, *coefficient)?;
    }
    within_budget(w, budget)?;

    let residuals: Vec<i32> = (order..samples.len())
        .map(|i| {
            let prediction = predictor
                .coefficients
                .iter()
                .zip(samples[0..i].iter().rev())
                .map(|(c, s)| i64::from(*c) * i64::from(*s))
                .sum::<i64>()
                >> predictor.shift;

            samples[i] - prediction as i32
        })
        .collect();

    write_residual_block(w, budget, params, samples.len(), order, &residuals)
}

/// Walks the frame sizes, emitting one seek point per frame
/// which exhausts the nominal interval
fn seek_table(sizes: impl IntoIterator<Item = FrameSize>, seekpoint_interval: u64) -> SeekTable {
    let mut points = Vec::new();
    let mut first_sample = 0;
    let mut byte_offset = 0;

    let mut sizes = sizes.into_iter().peekable();

    while let Some(size) = sizes.peek().copied() {
        points.push(SeekPoint {
            sample_offset: Some(first_sample),
            byte_offset,
            frame_samples: size.pcm_frames,
        });

        let mut interval = seekpoint_interval;
        if interval > u64::from(size.pcm_frames) {
            while let Some(size) = sizes.peek().copied() {
                if interval > u64::from(size.pcm_frames) {
                    interval -= u64::from(size.pcm_frames);
                    first_sample += u64::from(size.pcm_frames);
                    byte_offset += u64::from(size.byte_size);
                    sizes.next();
                } else {
                    break;
                }
            }
        } else {
            first_sample += u64::from(size.pcm_frames);
            byte_offset += u64::from(size.byte_size);
            sizes.next();
        }
    }

    SeekTable { points }
}

/// The frame layout a declared total implies, for sizing
/// the provisional seek table
fn dummy_frame_sizes(mut total_pcm_frames: u64, block_size: u16) -> impl Iterator<Item = FrameSize> {
    std::iter::from_fn(move || {
        (total_pcm_frames > 0).then(|| {
            let pcm_frames = total_pcm_frames.min(block_size.into()) as u16;
            total_pcm_frames -= u64::from(pcm_frames);
            FrameSize {
                byte_size: 0,
                pcm_frames,
            }
        })
    })
}

/// Folds the frame sizes into minimum/maximum byte sizes
/// and the total sample count
fn frame_sizes_info(sizes: &[FrameSize]) -> (u32, u32, u64) {
    sizes
        .iter()
        .fold((Streaminfo::MAX_FRAME_SIZE, 0, 0), |(min, max, total), size| {
            (
                min.min(size.byte_size),
                max.max(size.byte_size),
                total + u64::from(size.pcm_frames),
            )
        })
}

fn samples_identical(samples: &[i32]) -> bool {
    match samples {
        [first, rest @ ..] => rest.iter().all(|sample| sample == first),
        [] => true,
    }
}

/// The number of low-order zero bits shared by every sample
fn wasted_bits(samples: &[i32]) -> u32 {
    let mut wasted = u32::MAX;

    for sample in samples {
        match sample.trailing_zeros() {
            // one odd sample settles it
            0 => return 0,
            // zero samples share any number of wasted bits
            32 => {}
            bits => wasted = wasted.min(bits),
        }
    }

    match wasted {
        u32::MAX => 0,
        wasted => wasted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wasted_bits() {
        // every sample a multiple of 2³ but not 2⁴
        assert_eq!(wasted_bits(&[8, 16, 24, -8]), 3);
        assert_eq!(wasted_bits(&[4, 8, 12]), 2);

        // one odd sample means none are wasted
        assert_eq!(wasted_bits(&[8, 16, 3]), 0);
        assert_eq!(wasted_bits(&[1]), 0);

        // zero samples don't constrain the count
        assert_eq!(wasted_bits(&[0, 8, 16]), 3);
        assert_eq!(wasted_bits(&[0, 0, 0]), 0);
    }

    #[test]
    fn test_samples_identical() {
        assert!(samples_identical(&[7; 100]));
        assert!(samples_identical(&[0]));

        let mut samples = [7; 100];
        samples[42] = 8;
        assert!(!samples_identical(&samples));
    }

    #[test]
    fn test_fixed_order_of_ramp() {
        // a pure ramp has a constant first difference,
        // so an order past 0 must win
        let ramp: Vec<i32> = (0..4096).map(|i| i * 3).collect();
        let (order, _) = best_fixed_order(&ramp);
        assert!(order >= 1);

        // and its chosen order's residuals are all zero
        let (order, residuals) = best_fixed_order(&(0..4096).collect::<Vec<i32>>());
        assert!(order >= 1);
        assert_eq!(abs_sum(&residuals), 0);
    }

    #[test]
    fn test_fixed_order_minimal() {
        // whatever order wins, it must be no worse
        // than every other computed order
        let noise: Vec<i32> = (0..4096).map(|_| fastrand::i32(-1000..1000)).collect();

        let (best, best_residuals) = best_fixed_order(&noise);
        let best_sum = abs_sum(&best_residuals);

        let mut orders = vec![noise.clone()];
        for order in 1..=4 {
            let next = next_fixed_order(&orders[order - 1]);
            orders.push(next);
        }

        for (order, residuals) in orders.iter().enumerate() {
            let sum = abs_sum(residuals);
            assert!(best_sum <= sum, "order {best} beaten by order {order}");
        }
    }

    #[test]
    fn test_fixed_order_short_blocks() {
        assert_eq!(best_fixed_order(&[5]).0, 0);

        let (order, residuals) = best_fixed_order(&[5, 5, 5]);
        assert!(order <= 2);
        assert_eq!(abs_sum(&residuals), 0);
    }

    #[test]
    fn test_dummy_frame_sizes() {
        let sizes: Vec<FrameSize> = dummy_frame_sizes(10000, 4096).collect();
        assert_eq!(
            sizes.iter().map(|s| u64::from(s.pcm_frames)).sum::<u64>(),
            10000
        );
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes[2].pcm_frames, 10000 - 2 * 4096);
    }

    #[test]
    fn test_seek_table_walk() {
        // 4096-sample frames against a 441000-sample interval:
        // the interval stays ahead of the walk for 107 frames
        let sizes = vec![
            FrameSize {
                byte_size: 100,
                pcm_frames: 4096
            };
            120
        ];

        let table = seek_table(sizes.iter().copied(), 44100 * 10);

        assert_eq!(table.points[0].sample_offset, Some(0));
        assert_eq!(table.points[0].byte_offset, 0);

        // the next point comes at frame granularity,
        // past the nominal interval
        assert_eq!(table.points[1].sample_offset, Some(4096 * 107));
        assert_eq!(table.points[1].byte_offset, 100 * 107);

        // the remaining 13 frames never exhaust another interval
        assert_eq!(table.points.len(), 2);
    }

    #[test]
    fn test_options_validation() {
        assert!(Options::default().block_size(0).is_err());
        assert!(Options::default().block_size(192).is_ok());
        assert!(Options::default().partition_orders(3, 2).is_err());
        assert!(Options::default().partition_orders(0, 16).is_err());
        assert!(Options::default().max_lpc_order(33).is_err());
        assert!(Options::default().padding(1 << 24).is_err());
    }
}
