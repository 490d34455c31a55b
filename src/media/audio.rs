//! Local audio devices behind a narrow seam.
//!
//! The session only ever sees Opus payloads: capture yields encoded 20ms
//! frames, playback sinks accept encoded frames per remote peer.

use std::any::Any;

use tokio::sync::mpsc;

use crate::error::CaptureError;

/// A running microphone capture. Dropping it releases the device.
pub struct CaptureStream {
    pub packets: mpsc::Receiver<Vec<u8>>,
    _guard: Box<dyn Any + Send + Sync>,
}

impl CaptureStream {
    pub fn new(packets: mpsc::Receiver<Vec<u8>>, guard: impl Any + Send + Sync) -> Self {
        Self {
            packets,
            _guard: Box::new(guard),
        }
    }
}

/// Plays one remote peer's Opus stream.
pub trait AudioSink: Send {
    fn push(&mut self, opus: &[u8]);
}

pub trait AudioBackend: Send + Sync {
    fn open_capture(&self) -> Result<CaptureStream, CaptureError>;

    fn open_output(&self, peer_id: &str) -> Result<Box<dyn AudioSink>, CaptureError>;
}

/// No devices: capture is unavailable and remote audio is discarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudio;

struct DiscardSink;

impl AudioSink for DiscardSink {
    fn push(&mut self, _opus: &[u8]) {}
}

impl AudioBackend for NullAudio {
    fn open_capture(&self) -> Result<CaptureStream, CaptureError> {
        Err(CaptureError::Unavailable)
    }

    fn open_output(&self, _peer_id: &str) -> Result<Box<dyn AudioSink>, CaptureError> {
        Ok(Box::new(DiscardSink))
    }
}

#[cfg(feature = "audio-io")]
pub use device::CpalAudio;

#[cfg(feature = "audio-io")]
mod device {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tokio::sync::mpsc;
    use tracing::{debug, error, info};

    use super::{AudioBackend, AudioSink, CaptureStream};
    use crate::error::CaptureError;
    use crate::media::codec::{OpusDecoder, OpusEncoder, FRAME_SAMPLES as FRAME, SAMPLE_RATE};

    /// Stops its device thread when dropped.
    struct DeviceThread {
        running: Arc<AtomicBool>,
        _thread: std::thread::JoinHandle<()>,
    }

    impl Drop for DeviceThread {
        fn drop(&mut self) {
            self.running.store(false, Ordering::Relaxed);
        }
    }

    fn map_build_error(e: impl std::fmt::Display) -> CaptureError {
        let msg = e.to_string();
        if msg.to_lowercase().contains("permission") {
            CaptureError::PermissionDenied
        } else {
            CaptureError::Device(msg)
        }
    }

    fn config() -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        }
    }

    /// Start capturing 960-sample mono f32 frames from the default input.
    fn start_capture() -> Result<(DeviceThread, mpsc::Receiver<Vec<f32>>), CaptureError> {
        let (tx, rx) = mpsc::channel::<Vec<f32>>(64);
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = running.clone();
        let running_callback = running.clone();

        // The !Send cpal::Stream never leaves this thread.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), CaptureError>>();

        let thread = std::thread::spawn(move || {
            let host = cpal::default_host();
            let Some(device) = host.default_input_device() else {
                let _ = ready_tx.send(Err(CaptureError::NoDevice));
                return;
            };
            info!(
                "Using input device: {}",
                device.name().unwrap_or_else(|_| "unknown".into())
            );

            let mut buffer = Vec::with_capacity(FRAME);
            let stream = match device.build_input_stream(
                &config(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !running_callback.load(Ordering::Relaxed) {
                        return;
                    }
                    for &sample in data {
                        buffer.push(sample);
                        if buffer.len() == FRAME {
                            let _ = tx.try_send(std::mem::replace(
                                &mut buffer,
                                Vec::with_capacity(FRAME),
                            ));
                        }
                    }
                },
                move |err| error!("Audio capture error: {}", err),
                None,
            ) {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(map_build_error(e)));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(map_build_error(e)));
                return;
            }

            info!("Audio capture started (48kHz mono, 20ms frames)");
            let _ = ready_tx.send(Ok(()));

            while running_thread.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            drop(stream);
            info!("Audio capture thread exiting");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(CaptureError::Device("capture thread panicked".into())),
        }

        Ok((
            DeviceThread {
                running,
                _thread: thread,
            },
            rx,
        ))
    }

    /// Start the shared output stream; returns a sender of f32 PCM frames.
    fn start_playback() -> Result<(DeviceThread, std::sync::mpsc::SyncSender<Vec<f32>>), CaptureError>
    {
        let (tx, rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(64);
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = running.clone();
        let running_callback = running.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), CaptureError>>();

        let thread = std::thread::spawn(move || {
            let host = cpal::default_host();
            let Some(device) = host.default_output_device() else {
                let _ = ready_tx.send(Err(CaptureError::NoDevice));
                return;
            };
            info!(
                "Using output device: {}",
                device.name().unwrap_or_else(|_| "unknown".into())
            );

            let ring = Arc::new(Mutex::new(std::collections::VecDeque::<f32>::with_capacity(
                SAMPLE_RATE as usize,
            )));
            let ring_reader = ring.clone();

            let stream = match device.build_output_stream(
                &config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !running_callback.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }
                    let mut ring = ring_reader.lock().unwrap_or_else(|e| e.into_inner());
                    for sample in data.iter_mut() {
                        *sample = ring.pop_front().unwrap_or(0.0);
                    }
                },
                move |err| error!("Audio playback error: {}", err),
                None,
            ) {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(map_build_error(e)));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(map_build_error(e)));
                return;
            }
            info!("Audio playback started (48kHz mono)");
            let _ = ready_tx.send(Ok(()));

            while running_thread.load(Ordering::Relaxed) {
                match rx.recv_timeout(std::time::Duration::from_millis(50)) {
                    Ok(frame) => {
                        let mut ring = ring.lock().unwrap_or_else(|e| e.into_inner());
                        // ~100ms ceiling keeps latency from building up
                        while ring.len() > 4800 {
                            ring.pop_front();
                        }
                        ring.extend(frame);
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            drop(stream);
            info!("Audio playback thread exiting");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(CaptureError::Device("playback thread panicked".into())),
        }

        Ok((
            DeviceThread {
                running,
                _thread: thread,
            },
            tx,
        ))
    }

    struct DecodingSink {
        peer_id: String,
        decoder: OpusDecoder,
        output: std::sync::mpsc::SyncSender<Vec<f32>>,
    }

    impl AudioSink for DecodingSink {
        fn push(&mut self, opus: &[u8]) {
            match self.decoder.decode(opus) {
                Ok(pcm) => {
                    let _ = self.output.try_send(pcm);
                }
                Err(e) => debug!("Decode error for {}: {}", self.peer_id, e),
            }
        }
    }

    /// cpal devices with Opus encode/decode.
    #[derive(Default)]
    pub struct CpalAudio {
        playback: Mutex<Option<(DeviceThread, std::sync::mpsc::SyncSender<Vec<f32>>)>>,
    }

    impl CpalAudio {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl AudioBackend for CpalAudio {
        fn open_capture(&self) -> Result<CaptureStream, CaptureError> {
            let (device, mut pcm_rx) = start_capture()?;
            let mut encoder = OpusEncoder::new()?;
            let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
            tokio::spawn(async move {
                while let Some(frame) = pcm_rx.recv().await {
                    match encoder.encode(&frame) {
                        Ok(packet) => {
                            if tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("Opus encode failed: {}", e),
                    }
                }
            });
            Ok(CaptureStream::new(rx, device))
        }

        fn open_output(&self, peer_id: &str) -> Result<Box<dyn AudioSink>, CaptureError> {
            let mut playback = self.playback.lock().unwrap_or_else(|e| e.into_inner());
            if playback.is_none() {
                *playback = Some(start_playback()?);
            }
            let output = playback
                .as_ref()
                .map(|(_, tx)| tx.clone())
                .ok_or(CaptureError::NoDevice)?;
            let decoder = OpusDecoder::new()?;
            Ok(Box::new(DecodingSink {
                peer_id: peer_id.to_string(),
                decoder,
                output,
            }))
        }
    }
}
