//! Microphone capture via `getUserMedia` and a script processor that turns
//! each audio block into 16-bit little-endian PCM.

use js_sys::{Object, Reflect};
use voice_session::{AudioConstraints, MediaAccessError, MediaResource};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    AudioContext, AudioContextOptions, AudioProcessingEvent, DomException, MediaStream,
    MediaStreamAudioSourceNode, MediaStreamConstraints, MediaStreamTrack, ScriptProcessorNode,
};

const BUFFER_SIZE: u32 = 4096;

pub struct BrowserMicrophone {
    stream: MediaStream,
    context: AudioContext,
    source: MediaStreamAudioSourceNode,
    processor: ScriptProcessorNode,
    onaudioprocess: Option<Closure<dyn FnMut(AudioProcessingEvent)>>,
}

impl MediaResource for BrowserMicrophone {
    fn release(&mut self) {
        let Some(callback) = self.onaudioprocess.take() else { return };
        self.processor.set_onaudioprocess(None);
        drop(callback);
        let _ = self.source.disconnect();
        let _ = self.processor.disconnect();
        for track in self.stream.get_tracks().iter() {
            if let Ok(track) = track.dyn_into::<MediaStreamTrack>() {
                track.stop();
            }
        }
        let _ = self.context.close();
        log::info!("Microphone released");
    }
}

/// Prompts for the microphone and starts delivering PCM chunks to `on_chunk`.
pub async fn acquire(
    constraints: AudioConstraints,
    on_chunk: impl FnMut(Vec<u8>) + 'static,
) -> Result<BrowserMicrophone, MediaAccessError> {
    let stream = request_stream(&constraints).await?;
    match build_pipeline(stream.clone(), &constraints, on_chunk) {
        Ok(microphone) => Ok(microphone),
        Err(e) => {
            for track in stream.get_tracks().iter() {
                if let Ok(track) = track.dyn_into::<MediaStreamTrack>() {
                    track.stop();
                }
            }
            Err(MediaAccessError::DeviceUnavailable(format!("{e:?}")))
        }
    }
}

async fn request_stream(constraints: &AudioConstraints) -> Result<MediaStream, MediaAccessError> {
    let window = web_sys::window().ok_or(MediaAccessError::Unsupported)?;
    let devices = window
        .navigator()
        .media_devices()
        .map_err(|_| MediaAccessError::Unsupported)?;

    let audio = Object::new();
    let set = |key: &str, value: JsValue| {
        let _ = Reflect::set(&audio, &JsValue::from_str(key), &value);
    };
    set("sampleRate", JsValue::from(constraints.sample_rate));
    set("channelCount", JsValue::from(constraints.channel_count));
    set("echoCancellation", JsValue::from(constraints.echo_cancellation));
    set("noiseSuppression", JsValue::from(constraints.noise_suppression));
    set("autoGainControl", JsValue::from(constraints.auto_gain_control));

    let request = MediaStreamConstraints::new();
    request.set_audio(&audio);

    let promise = devices
        .get_user_media_with_constraints(&request)
        .map_err(map_media_error)?;
    let stream = JsFuture::from(promise).await.map_err(map_media_error)?;
    stream
        .dyn_into::<MediaStream>()
        .map_err(|_| MediaAccessError::DeviceUnavailable("unexpected getUserMedia result".into()))
}

fn build_pipeline(
    stream: MediaStream,
    constraints: &AudioConstraints,
    mut on_chunk: impl FnMut(Vec<u8>) + 'static,
) -> Result<BrowserMicrophone, JsValue> {
    let options = AudioContextOptions::new();
    options.set_sample_rate(constraints.sample_rate as f32);
    let context = AudioContext::new_with_context_options(&options)?;
    let source = context.create_media_stream_source(&stream)?;
    let processor = context
        .create_script_processor_with_buffer_size_and_number_of_input_channels_and_number_of_output_channels(
            BUFFER_SIZE,
            u32::from(constraints.channel_count),
            u32::from(constraints.channel_count),
        )?;

    let onaudioprocess = Closure::<dyn FnMut(AudioProcessingEvent)>::new(move |ev: AudioProcessingEvent| {
        let Ok(buffer) = ev.input_buffer() else { return };
        let Ok(samples) = buffer.get_channel_data(0) else { return };
        on_chunk(to_pcm16(&samples));
    });
    processor.set_onaudioprocess(Some(onaudioprocess.as_ref().unchecked_ref()));

    source.connect_with_audio_node(&processor)?;
    processor.connect_with_audio_node(&context.destination())?;

    Ok(BrowserMicrophone {
        stream,
        context,
        source,
        processor,
        onaudioprocess: Some(onaudioprocess),
    })
}

fn to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| ((s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16).to_le_bytes())
        .collect()
}

fn map_media_error(err: JsValue) -> MediaAccessError {
    match err.dyn_ref::<DomException>() {
        Some(e) if e.name() == "NotAllowedError" || e.name() == "SecurityError" => {
            MediaAccessError::PermissionDenied(e.message())
        }
        Some(e) => MediaAccessError::DeviceUnavailable(format!("{}: {}", e.name(), e.message())),
        None => MediaAccessError::DeviceUnavailable(format!("{err:?}")),
    }
}
