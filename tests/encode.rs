use bitstream_io::{BigEndian, BitRead, BitReader, SignedBitCount};
use flac_encoder::Error;
use flac_encoder::encode::{Options, encode};
use flac_encoder::metadata::{Block, SeekTable, Streaminfo, VorbisComment, read_blocks};
use flac_encoder::pcm::PcmReader;
use std::io::Cursor;
use std::num::NonZero;

/// An in-memory PCM source of interleaved samples
struct SyntheticReader {
    samples: Vec<i32>,
    position: usize,
    sample_rate: u32,
    channels: u8,
    bits_per_sample: u32,
}

impl SyntheticReader {
    fn new(samples: Vec<i32>, sample_rate: u32, channels: u8, bits_per_sample: u32) -> Self {
        Self {
            samples,
            position: 0,
            sample_rate,
            channels,
            bits_per_sample,
        }
    }
}

impl PcmReader for SyntheticReader {
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
        let channels = usize::from(self.channels);
        let remaining = (self.samples.len() - self.position) / channels;
        let frames = remaining.min(buf.len() / channels);
        let count = frames * channels;

        buf[0..count].copy_from_slice(&self.samples[self.position..self.position + count]);
        self.position += count;

        Ok(frames)
    }
}

/// A source which errors out partway through the stream
struct FailingReader {
    frames_before_failure: usize,
}

impl PcmReader for FailingReader {
    fn sample_rate(&self) -> u32 {
        44100
    }

    fn channels(&self) -> u8 {
        1
    }

    fn bits_per_sample(&self) -> u32 {
        16
    }

    fn read(&mut self, buf: &mut [i32]) -> std::io::Result<usize> {
        let frames = self.frames_before_failure.min(buf.len());
        if frames == 0 {
            Err(std::io::Error::other("device unplugged"))
        } else {
            buf[0..frames].fill(0);
            self.frames_before_failure -= frames;
            Ok(frames)
        }
    }
}

fn streaminfo(flac: &[u8]) -> Streaminfo {
    match read_blocks(Cursor::new(flac)).unwrap().remove(0) {
        Block::Streaminfo(streaminfo) => streaminfo,
        block => panic!("expected STREAMINFO, got {block:?}"),
    }
}

fn seek_table(flac: &[u8]) -> SeekTable {
    read_blocks(Cursor::new(flac))
        .unwrap()
        .into_iter()
        .find_map(|block| match block {
            Block::SeekTable(table) => Some(table),
            _ => None,
        })
        .expect("missing SEEKTABLE block")
}

fn vorbis_comment(flac: &[u8]) -> VorbisComment {
    read_blocks(Cursor::new(flac))
        .unwrap()
        .into_iter()
        .find_map(|block| match block {
            Block::VorbisComment(comment) => Some(comment),
            _ => None,
        })
        .expect("missing VORBIS_COMMENT block")
}

/// Byte offset of the first frame, found by walking block headers
fn frame_data_offset(flac: &[u8]) -> usize {
    assert_eq!(&flac[0..4], b"fLaC");

    let mut offset = 4;
    loop {
        let header = u32::from_be_bytes(flac[offset..offset + 4].try_into().unwrap());
        offset += 4 + (header & 0xffffff) as usize;
        if header >> 31 == 1 {
            return offset;
        }
    }
}

struct ParsedFrame {
    block_size: u32,
    channel_assignment: u8,
    /// (type code bits, wasted bits) per subframe header read
    subframe: (u8, u32),
}

/// Parses one frame header plus the first subframe's header,
/// enough to see what the encoder chose
fn parse_frame<R: std::io::Read>(r: &mut BitReader<R, BigEndian>, sample_rate: u32) -> ParsedFrame {
    assert_eq!(r.read::<14, u16>().unwrap(), 0b11111111111110);
    r.skip(1).unwrap(); // reserved
    assert_eq!(r.read::<1, u8>().unwrap(), 0); // fixed block size
    let block_size_code = r.read::<4, u8>().unwrap();
    let sample_rate_code = r.read::<4, u8>().unwrap();
    let channel_assignment = r.read::<4, u8>().unwrap();
    let _bps_code = r.read::<3, u8>().unwrap();
    r.skip(1).unwrap(); // reserved

    // frame number varint
    match r.read_unary::<0>().unwrap() {
        0 => r.skip(7).unwrap(),
        bytes @ 2..=6 => {
            r.skip(7 - bytes).unwrap();
            for _ in 1..bytes {
                assert_eq!(r.read_unary::<0>().unwrap(), 1);
                r.skip(6).unwrap();
            }
        }
        _ => panic!("invalid frame number"),
    }

    let block_size = match block_size_code {
        0b0001 => 192,
        code @ 0b0010..=0b0101 => 144u32 << code,
        0b0110 => r.read::<8, u32>().unwrap() + 1,
        0b0111 => r.read::<16, u32>().unwrap() + 1,
        code @ 0b1000..=0b1111 => 1u32 << code,
        _ => panic!("invalid block size code"),
    };

    match sample_rate_code {
        0b1100 => assert_eq!(r.read::<8, u32>().unwrap(), sample_rate / 1000),
        0b1101 => assert_eq!(r.read::<16, u32>().unwrap(), sample_rate),
        0b1110 => assert_eq!(r.read::<16, u32>().unwrap(), sample_rate / 10),
        _ => {}
    }

    r.skip(8).unwrap(); // CRC-8

    // first subframe header
    assert_eq!(r.read::<1, u8>().unwrap(), 0);
    let type_code = r.read::<6, u8>().unwrap();
    let wasted = match r.read::<1, u8>().unwrap() {
        0 => 0,
        _ => r.read_unary::<1>().unwrap() + 1,
    };

    ParsedFrame {
        block_size,
        channel_assignment,
        subframe: (type_code, wasted),
    }
}

#[test]
fn test_all_zero_mono_second() {
    let mut reader = SyntheticReader::new(vec![0; 44100], 44100, 1, 16);
    let mut flac = Cursor::new(Vec::new());

    encode(
        &mut reader,
        &mut flac,
        Options::default(),
        NonZero::new(44100),
    )
    .unwrap();

    let flac = flac.into_inner();
    let streaminfo = streaminfo(&flac);

    assert_eq!(streaminfo.total_samples, NonZero::new(44100));
    assert_eq!(streaminfo.bits_per_sample, SignedBitCount::new::<16>());
    assert_eq!(streaminfo.channels, NonZero::new(1).unwrap());
    assert_eq!(streaminfo.sample_rate, 44100);
    assert_eq!(streaminfo.minimum_block_size, 4096);

    // the hash matches a second of raw zero bytes
    assert_eq!(streaminfo.md5, Some(md5::compute(vec![0u8; 88200]).0));

    // every frame is a CONSTANT subframe of value 0
    let mut frames = &flac[frame_data_offset(&flac)..];
    let mut r = BitReader::endian(&mut frames, BigEndian);
    let mut samples = 0;

    while samples < 44100 {
        let frame = parse_frame(&mut r, 44100);
        assert_eq!(frame.channel_assignment, 0);
        assert_eq!(frame.subframe, (0b000000, 0));
        assert_eq!(r.read::<16, u32>().unwrap(), 0); // the constant itself
        r.byte_align();
        r.skip(16).unwrap(); // CRC-16
        samples += frame.block_size;
    }

    assert_eq!(samples, 44100);
}

#[test]
fn test_declared_total_mismatch() {
    // declaring 1000 PCM frames but supplying 999
    let mut reader = SyntheticReader::new(vec![0; 999], 44100, 1, 16);
    let mut flac = Cursor::new(Vec::new());

    assert!(matches!(
        encode(
            &mut reader,
            &mut flac,
            Options::default(),
            NonZero::new(1000),
        ),
        Err(Error::SampleCountMismatch)
    ));

    // the header was never patched: its hash is still zeroed
    // and its frame sizes are still placeholders, so no valid
    // stream claims 1000 samples
    let streaminfo = streaminfo(&flac.into_inner());
    assert_eq!(streaminfo.md5, None);
    assert_eq!(streaminfo.minimum_frame_size, NonZero::new((1 << 24) - 1));
    assert_eq!(streaminfo.maximum_frame_size, None);
}

#[test]
fn test_excess_samples_also_mismatch() {
    let mut reader = SyntheticReader::new(vec![0; 1001], 44100, 1, 16);
    let mut flac = Cursor::new(Vec::new());

    assert!(matches!(
        encode(
            &mut reader,
            &mut flac,
            Options::default(),
            NonZero::new(1000),
        ),
        Err(Error::SampleCountMismatch)
    ));
}

#[test]
fn test_source_read_failure() {
    // one-pass mode propagates the failure
    let mut flac = Cursor::new(Vec::new());
    assert!(matches!(
        encode(
            &mut FailingReader {
                frames_before_failure: 5000
            },
            &mut flac,
            Options::default(),
            NonZero::new(100000),
        ),
        Err(Error::SourceRead(_))
    ));

    // two-pass mode fails before anything reaches the output
    let mut flac = Cursor::new(Vec::new());
    assert!(matches!(
        encode(
            &mut FailingReader {
                frames_before_failure: 5000
            },
            &mut flac,
            Options::default(),
            None,
        ),
        Err(Error::SourceRead(_))
    ));
    assert!(flac.into_inner().is_empty());
}

fn noise(samples: usize, magnitude: i32, seed: u64) -> Vec<i32> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..samples).map(|_| rng.i32(-magnitude..magnitude)).collect()
}

#[test]
fn test_known_and_unknown_totals_encode_identically() {
    let samples = noise(44100 * 2, 10000, 42);

    let mut known = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(samples.clone(), 44100, 2, 16),
        &mut known,
        Options::default().mid_side(),
        NonZero::new(44100),
    )
    .unwrap();

    let mut unknown = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(samples, 44100, 2, 16),
        &mut unknown,
        Options::default().mid_side(),
        None,
    )
    .unwrap();

    assert_eq!(known.into_inner(), unknown.into_inner());
}

#[test]
fn test_identical_channels_pick_mid_side() {
    // with both channels equal, the difference channel is constant
    // and every side strategy beats independent; exact ties fall
    // through to the mid-side assignment
    let left: Vec<i32> = (0..8192).map(|i| (f64::from(i) * 0.01).sin() as i32 * 100 + i % 37).collect();
    let interleaved: Vec<i32> = left.iter().flat_map(|s| [*s, *s]).collect();

    let mut flac = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(interleaved, 44100, 2, 16),
        &mut flac,
        Options::default().mid_side(),
        NonZero::new(8192),
    )
    .unwrap();

    let flac = flac.into_inner();
    let mut frames = &flac[frame_data_offset(&flac)..];
    let mut r = BitReader::endian(&mut frames, BigEndian);

    let frame = parse_frame(&mut r, 44100);
    assert_eq!(frame.channel_assignment, 0b1010); // mid-side
}

#[test]
fn test_channel_mask_comment() {
    // a 24-bit stream gets the channel mask comment
    let mut flac = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(noise(8000, 100000, 7), 48000, 1, 24),
        &mut flac,
        Options::default(),
        NonZero::new(8000),
    )
    .unwrap();

    let comment = vorbis_comment(&flac.into_inner());
    assert!(
        comment
            .fields
            .contains(&"WAVEFORMATEXTENSIBLE_CHANNEL_MASK=0x0004".to_owned())
    );

    // but a 16-bit stereo stream doesn't
    let mut flac = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(noise(8000, 1000, 8), 48000, 2, 16),
        &mut flac,
        Options::default(),
        NonZero::new(4000),
    )
    .unwrap();

    let comment = vorbis_comment(&flac.into_inner());
    assert!(comment.fields.is_empty());
    assert!(comment.vendor_string.starts_with("flac-encoder"));
}

#[test]
fn test_seek_table_shape() {
    // 30 seconds at 8000 Hz: seek interval is
    // max(80000, 40960) = 80000 samples
    let total = 240000;
    let mut flac = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(noise(total, 1000, 9), 8000, 1, 16),
        &mut flac,
        Options::default(),
        NonZero::new(total as u64),
    )
    .unwrap();

    let table = seek_table(&flac.into_inner());

    assert_eq!(table.points[0].sample_offset, Some(0));
    assert_eq!(table.points[0].byte_offset, 0);

    // offsets ascend and land on frame boundaries
    for pair in table.points.windows(2) {
        assert!(pair[1].sample_offset > pair[0].sample_offset);
        assert!(pair[1].byte_offset > pair[0].byte_offset);
        assert_eq!(pair[1].sample_offset.unwrap() % 4096, 0);
    }

    // each stride covers 19 frames (77824 samples), so 59 frames
    // put points at frames 0, 19, 38 and 57
    assert_eq!(table.points.len(), 4);
    assert_eq!(table.points[1].sample_offset, Some(19 * 4096));
}

#[test]
fn test_forced_verbatim() {
    let total = 4096;
    let mut flac = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(noise(total, 30000, 10), 44100, 1, 16),
        &mut flac,
        Options::default()
            .no_constant_subframes()
            .no_fixed_subframes()
            .no_lpc_subframes(),
        NonZero::new(total as u64),
    )
    .unwrap();

    let flac = flac.into_inner();
    let mut frames = &flac[frame_data_offset(&flac)..];
    let mut r = BitReader::endian(&mut frames, BigEndian);

    let frame = parse_frame(&mut r, 44100);
    assert_eq!(frame.subframe, (0b000001, 0)); // verbatim
}

#[test]
fn test_wasted_bits_detected() {
    // every sample a multiple of 4 but not all multiples of 8
    let samples: Vec<i32> = (0..4096).map(|i| (i % 100) * 4).collect();

    let mut flac = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(samples, 44100, 1, 16),
        &mut flac,
        Options::default(),
        NonZero::new(4096),
    )
    .unwrap();

    let flac = flac.into_inner();
    let mut frames = &flac[frame_data_offset(&flac)..];
    let mut r = BitReader::endian(&mut frames, BigEndian);

    let frame = parse_frame(&mut r, 44100);
    assert_eq!(frame.subframe.1, 2);
}

#[test]
fn test_compression_beats_verbatim_on_smooth_signals() {
    let samples: Vec<i32> = (0..44100)
        .map(|i| (8000.0 * (f64::from(i) * 0.03).sin()) as i32)
        .collect();

    let mut compressed = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(samples.clone(), 44100, 1, 16),
        &mut compressed,
        Options::default(),
        NonZero::new(44100),
    )
    .unwrap();

    let mut verbatim = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(samples, 44100, 1, 16),
        &mut verbatim,
        Options::default()
            .no_constant_subframes()
            .no_fixed_subframes()
            .no_lpc_subframes(),
        NonZero::new(44100),
    )
    .unwrap();

    assert!(compressed.into_inner().len() < verbatim.into_inner().len());
}

#[test]
fn test_exhaustive_search_never_larger() {
    let samples = noise(44100, 3000, 11);

    let mut estimated = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(samples.clone(), 44100, 1, 16),
        &mut estimated,
        Options::default(),
        NonZero::new(44100),
    )
    .unwrap();

    let mut exhaustive = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(samples, 44100, 1, 16),
        &mut exhaustive,
        Options::default().exhaustive_model_search(),
        NonZero::new(44100),
    )
    .unwrap();

    assert!(exhaustive.into_inner().len() <= estimated.into_inner().len());
}

#[test]
fn test_streaminfo_consistency_between_modes() {
    let samples = noise(50000, 2000, 12);

    let mut flac = Cursor::new(Vec::new());
    encode(
        &mut SyntheticReader::new(samples, 44100, 1, 16),
        &mut flac,
        Options::default().no_padding(),
        None,
    )
    .unwrap();

    let flac = flac.into_inner();
    let streaminfo = streaminfo(&flac);

    assert_eq!(streaminfo.total_samples, NonZero::new(50000));
    assert!(streaminfo.md5.is_some());
    assert!(streaminfo.minimum_frame_size.unwrap() <= streaminfo.maximum_frame_size.unwrap());

    // no PADDING block was written
    assert!(
        !read_blocks(Cursor::new(&flac))
            .unwrap()
            .iter()
            .any(|block| matches!(block, Block::Padding(_)))
    );
}
