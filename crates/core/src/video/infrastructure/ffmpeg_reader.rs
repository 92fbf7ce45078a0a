use crate::shared::frame::Frame;
use crate::video::domain::video_reader::{SourceError, StreamInfo, VideoReader, VideoSource};

/// Socket timeout for network streams, in microseconds.
const NETWORK_TIMEOUT_US: &str = "5000000";

/// Decodes frames from webcams, network streams and files via ffmpeg-next.
///
/// Each decoded frame is converted to RGB24 and wrapped in a [`Frame`].
/// For live sources an end of stream is reported as a read error so the
/// capture loop reconnects; for files it ends the stream.
pub struct FfmpegReader {
    state: Option<DecodeState>,
}

struct DecodeState {
    ictx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::decoder::Video,
    scaler: ffmpeg_next::software::scaling::Context,
    width: u32,
    height: u32,
    video_stream_index: usize,
    frame_index: u64,
    live: bool,
    flushing: bool,
}

// Safety: FfmpegReader is only used from a single thread at a time.
// The raw pointers inside ffmpeg types are not shared across threads.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn new() -> Self {
        Self { state: None }
    }
}

impl Default for FfmpegReader {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoReader for FfmpegReader {
    fn open(&mut self, source: &VideoSource) -> Result<StreamInfo, SourceError> {
        self.close();
        let locator = source.locator();
        let (state, info) = open_stream(source, &locator).map_err(|e| SourceError::Open {
            locator: locator.clone(),
            reason: e.to_string(),
        })?;
        log::info!(
            "Opened {source}: {}x{} @ {:.1} fps ({})",
            info.width,
            info.height,
            info.fps,
            info.codec
        );
        self.state = Some(state);
        Ok(info)
    }

    fn read(&mut self) -> Result<Option<Frame>, SourceError> {
        let state = self.state.as_mut().ok_or(SourceError::NotOpened)?;
        loop {
            if let Some(frame) = state.try_receive()? {
                return Ok(Some(frame));
            }
            if state.flushing {
                return if state.live {
                    Err(SourceError::Read("stream ended".to_string()))
                } else {
                    Ok(None)
                };
            }

            let Some((stream, packet)) = state.ictx.packets().next() else {
                let _ = state.decoder.send_eof();
                state.flushing = true;
                continue;
            };
            if stream.index() != state.video_stream_index {
                continue;
            }
            if let Err(e) = state.decoder.send_packet(&packet) {
                log::debug!("Skipping undecodable packet: {e}");
            }
        }
    }

    fn close(&mut self) {
        self.state = None;
    }
}

fn open_stream(
    source: &VideoSource,
    locator: &str,
) -> Result<(DecodeState, StreamInfo), Box<dyn std::error::Error>> {
    ffmpeg_next::init()?;
    ffmpeg_next::device::register_all();

    let mut options = ffmpeg_next::Dictionary::new();
    if matches!(source, VideoSource::Url(_)) && source.is_live() {
        options.set("rtsp_transport", "tcp");
        options.set("timeout", NETWORK_TIMEOUT_US);
    }
    let ictx = ffmpeg_next::format::input_with_dictionary(locator, options)?;

    let stream = ictx
        .streams()
        .best(ffmpeg_next::media::Type::Video)
        .ok_or("No video stream found")?;
    let video_stream_index = stream.index();
    let rate = stream.rate();
    let fps = if rate.denominator() != 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        0.0
    };

    let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
    let decoder = codec_ctx.decoder().video()?;
    let width = decoder.width();
    let height = decoder.height();
    let codec = decoder
        .codec()
        .map(|c| c.name().to_string())
        .unwrap_or_default();

    let scaler = ffmpeg_next::software::scaling::Context::get(
        decoder.format(),
        width,
        height,
        ffmpeg_next::format::Pixel::RGB24,
        width,
        height,
        ffmpeg_next::software::scaling::Flags::BILINEAR,
    )?;

    let info = StreamInfo {
        width,
        height,
        fps,
        codec,
        locator: locator.to_string(),
    };
    let state = DecodeState {
        ictx,
        decoder,
        scaler,
        width,
        height,
        video_stream_index,
        frame_index: 0,
        live: source.is_live(),
        flushing: false,
    };
    Ok((state, info))
}

impl DecodeState {
    fn try_receive(&mut self) -> Result<Option<Frame>, SourceError> {
        let mut decoded = ffmpeg_next::util::frame::video::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }
        let mut rgb_frame = ffmpeg_next::util::frame::video::Video::empty();
        self.scaler
            .run(&decoded, &mut rgb_frame)
            .map_err(|e| SourceError::Read(e.to_string()))?;

        let pixels = extract_rgb_pixels(&rgb_frame, self.width, self.height);
        let frame = Frame::new(pixels, self.width, self.height, 3, self.frame_index);
        self.frame_index += 1;
        Ok(Some(frame))
    }
}

/// Copies pixel data from an ffmpeg frame into a contiguous RGB buffer.
///
/// ffmpeg frames may have padding bytes at the end of each row (stride > width*3).
fn extract_rgb_pixels(
    rgb_frame: &ffmpeg_next::util::frame::video::Video,
    width: u32,
    height: u32,
) -> Vec<u8> {
    strip_row_padding(rgb_frame.data(0), rgb_frame.stride(0), width, height)
}

fn strip_row_padding(data: &[u8], stride: usize, width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let mut pixels = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let row_start = row * stride;
        pixels.extend_from_slice(&data[row_start..row_start + w * 3]);
    }
    pixels
}
