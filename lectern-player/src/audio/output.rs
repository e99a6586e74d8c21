//! Audio output using cpal
//!
//! Decodes each loaded source to mono PCM and plays it on the output device.
//! The cpal stream is not `Send`, so it lives on a dedicated thread for the
//! lifetime of the sink; the audio callback shares state through a mutex and
//! steps through the source with linear interpolation, which also covers
//! sample-rate conversion and the playback rate.

use super::{decode, AudioSink, SinkError, SinkEvent, SourceId};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

struct LoadedPcm {
    id: SourceId,
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
}

struct DeviceState {
    last_source: SourceId,
    source: Option<LoadedPcm>,
    /// Read position in source frames
    cursor: f64,
    playing: bool,
    rate: f32,
}

pub struct DeviceSink {
    state: Arc<Mutex<DeviceState>>,
    events: broadcast::Sender<SinkEvent>,
    device_name: String,
    output_rate: u32,
    // Dropping the sender stops the output thread
    _stop: mpsc::Sender<()>,
}

impl DeviceSink {
    /// Open the named output device, or the default one
    pub fn open(device_name: Option<&str>) -> Result<Self, SinkError> {
        let state = Arc::new(Mutex::new(DeviceState {
            last_source: 0,
            source: None,
            cursor: 0.0,
            playing: false,
            rate: 1.0,
        }));
        let (events, _) = broadcast::channel(16);
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_state = Arc::clone(&state);
        let thread_events = events.clone();
        let wanted = device_name.map(str::to_string);
        std::thread::Builder::new()
            .name("lectern-audio-out".to_string())
            .spawn(move || match start_stream(wanted.as_deref(), thread_state, thread_events) {
                Ok((stream, name, rate)) => {
                    let _ = ready_tx.send(Ok((name, rate)));
                    // Park until the sink is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| SinkError::Device(format!("Failed to spawn output thread: {}", e)))?;

        let (device_name, output_rate) = ready_rx
            .recv()
            .map_err(|_| SinkError::Device("Output thread exited".to_string()))??;
        info!(device = %device_name, sample_rate = output_rate, "Audio output started");

        Ok(Self {
            state,
            events,
            device_name,
            output_rate,
            _stop: stop_tx,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Names of the available output devices
    pub fn list_devices() -> Result<Vec<String>, SinkError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| SinkError::Device(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn start_stream(
    wanted: Option<&str>,
    state: Arc<Mutex<DeviceState>>,
    events: broadcast::Sender<SinkEvent>,
) -> Result<(cpal::Stream, String, u32), SinkError> {
    let host = cpal::default_host();
    let device = match wanted {
        Some(name) => host
            .output_devices()
            .map_err(|e| SinkError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| SinkError::Device(format!("Output device not found: {}", name)))?,
        None => host
            .default_output_device()
            .ok_or_else(|| SinkError::Device("No default output device".to_string()))?,
    };
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = device
        .default_output_config()
        .map_err(|e| SinkError::Device(format!("No output config: {}", e)))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let rate = config.sample_rate.0;

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, state, events)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, state, events)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, state, events)?,
        other => {
            return Err(SinkError::Device(format!(
                "Unsupported sample format: {:?}",
                other
            )))
        }
    };
    stream
        .play()
        .map_err(|e| SinkError::Device(format!("Failed to start stream: {}", e)))?;
    Ok((stream, name, rate))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    state: Arc<Mutex<DeviceState>>,
    events: broadcast::Sender<SinkEvent>,
) -> Result<cpal::Stream, SinkError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let output_rate = config.sample_rate.0.max(1) as f64;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                // Never block the audio thread; output silence if contended
                let Ok(mut state) = state.try_lock() else {
                    data.fill(T::from_sample(0.0f32));
                    return;
                };
                let mut ended = None;
                for frame in data.chunks_mut(channels) {
                    let value = next_sample(&mut state, output_rate, &mut ended);
                    frame.fill(T::from_sample(value));
                }
                drop(state);
                if let Some(source) = ended {
                    let _ = events.send(SinkEvent::Ended { source });
                }
            },
            |e| error!("Audio output stream error: {}", e),
            None,
        )
        .map_err(|e| SinkError::Device(format!("Failed to build stream: {}", e)))
}

fn next_sample(state: &mut DeviceState, output_rate: f64, ended: &mut Option<SourceId>) -> f32 {
    if !state.playing {
        return 0.0;
    }
    let Some(source) = state.source.as_ref() else {
        return 0.0;
    };
    let len = source.samples.len();
    let index = state.cursor as usize;
    if index + 1 >= len {
        state.playing = false;
        state.cursor = len as f64;
        *ended = Some(source.id);
        return 0.0;
    }
    let frac = (state.cursor - index as f64) as f32;
    let value = source.samples[index] * (1.0 - frac) + source.samples[index + 1] * frac;
    state.cursor += state.rate as f64 * source.sample_rate as f64 / output_rate;
    value
}

#[async_trait]
impl AudioSink for DeviceSink {
    async fn load(&self, audio: Bytes) -> Result<SourceId, SinkError> {
        let decoded = tokio::task::spawn_blocking(move || decode::decode_mono(&audio))
            .await
            .map_err(|e| SinkError::Decode(format!("Decode task failed: {}", e)))??;

        let mut state = self.lock();
        state.last_source += 1;
        state.source = Some(LoadedPcm {
            id: state.last_source,
            samples: Arc::new(decoded.samples),
            sample_rate: decoded.sample_rate,
        });
        state.cursor = 0.0;
        state.playing = false;
        Ok(state.last_source)
    }

    async fn play(&self) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.source.is_none() {
            return Err(SinkError::Rejected("no source loaded".to_string()));
        }
        state.playing = true;
        Ok(())
    }

    async fn pause(&self) {
        self.lock().playing = false;
    }

    async fn seek(&self, position: Duration) {
        let mut state = self.lock();
        if let Some(source) = state.source.as_ref() {
            let frames = position.as_secs_f64() * source.sample_rate as f64;
            state.cursor = frames.min(source.samples.len() as f64);
        }
    }

    async fn set_rate(&self, rate: f32) {
        self.lock().rate = rate;
    }

    async fn position(&self) -> Duration {
        let state = self.lock();
        match state.source.as_ref() {
            Some(source) if source.sample_rate > 0 => {
                Duration::from_secs_f64(state.cursor / source.sample_rate as f64)
            }
            _ => Duration::ZERO,
        }
    }

    async fn duration(&self) -> Option<Duration> {
        self.lock().source.as_ref().map(|source| {
            Duration::from_secs_f64(source.samples.len() as f64 / source.sample_rate.max(1) as f64)
        })
    }

    async fn unload(&self) {
        let mut state = self.lock();
        state.source = None;
        state.cursor = 0.0;
        state.playing = false;
    }

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(samples: Vec<f32>, sample_rate: u32) -> DeviceState {
        DeviceState {
            last_source: 1,
            source: Some(LoadedPcm {
                id: 1,
                samples: Arc::new(samples),
                sample_rate,
            }),
            cursor: 0.0,
            playing: true,
            rate: 1.0,
        }
    }

    #[test]
    fn test_interpolates_when_upsampling() {
        let mut state = state_with(vec![0.0, 1.0, 0.0], 1);
        let mut ended = None;
        let out: Vec<f32> = (0..4).map(|_| next_sample(&mut state, 2.0, &mut ended)).collect();
        assert_eq!(out, vec![0.0, 0.5, 1.0, 0.5]);
        assert!(ended.is_none());
    }

    #[test]
    fn test_end_of_source_reported_once() {
        let mut state = state_with(vec![0.2, 0.4], 8000);
        let mut ended = None;
        next_sample(&mut state, 8000.0, &mut ended);
        assert_eq!(next_sample(&mut state, 8000.0, &mut ended), 0.0);
        assert_eq!(ended, Some(1));
        assert!(!state.playing);

        let mut again = None;
        next_sample(&mut state, 8000.0, &mut again);
        assert!(again.is_none());
    }
}
