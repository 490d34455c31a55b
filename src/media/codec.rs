//! Opus framing shared by the microphone track and remote playback.

use crate::error::CaptureError;

pub const SAMPLE_RATE: u32 = 48_000;
/// Samples per 20ms mono frame.
pub const FRAME_SAMPLES: usize = 960;
const MAX_PACKET: usize = 4_000;

fn codec_error(stage: &str, e: opus::Error) -> CaptureError {
    CaptureError::Device(format!("opus {stage}: {e}"))
}

pub struct OpusEncoder {
    inner: opus::Encoder,
    packet: Vec<u8>,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, CaptureError> {
        let inner = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
            .map_err(|e| codec_error("encoder init", e))?;
        Ok(Self {
            inner,
            packet: vec![0u8; MAX_PACKET],
        })
    }

    /// One `FRAME_SAMPLES` PCM frame in, one Opus packet out.
    pub fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, CaptureError> {
        let len = self
            .inner
            .encode_float(pcm, &mut self.packet)
            .map_err(|e| codec_error("encode", e))?;
        Ok(self.packet[..len].to_vec())
    }
}

pub struct OpusDecoder {
    inner: opus::Decoder,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, CaptureError> {
        let inner = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| codec_error("decoder init", e))?;
        Ok(Self { inner })
    }

    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>, CaptureError> {
        let mut pcm = vec![0.0f32; FRAME_SAMPLES];
        let len = self
            .inner
            .decode_float(packet, &mut pcm, false)
            .map_err(|e| codec_error("decode", e))?;
        pcm.truncate(len);
        Ok(pcm)
    }
}
