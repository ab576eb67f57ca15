use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{MediaStreamTrack, VoiceDecoder, VoiceEncoder, CHANNELS, SAMPLES_PER_FRAME, SAMPLE_RATE};

/// Opus payload type (dynamic, typically 111)
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Samples per RTP packet (20ms at 48kHz = 960 samples)
pub const SAMPLES_PER_RTP_PACKET: u32 = SAMPLES_PER_FRAME as u32;

/// How long the pump waits for a frame before checking whether its source ended
const IDLE_CHECK: Duration = Duration::from_millis(500);

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: SAMPLE_RATE,
        channels: CHANNELS,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

/// Configure MediaEngine with Opus codec for audio
pub fn register_audio_codec(m: &mut MediaEngine) -> Result<(), String> {
    m.register_codec(
        RTCRtpCodecParameters {
            capability: opus_capability(),
            payload_type: OPUS_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )
    .map_err(|e| format!("Failed to register Opus codec: {}", e))
}

/// RTP sender for one local track on one peer connection
pub struct OutboundAudioTrack {
    track: Arc<TrackLocalStaticRTP>,
    sequence_number: Mutex<u16>,
    timestamp: Mutex<u32>,
    ssrc: u32,
}

impl OutboundAudioTrack {
    pub fn new(track_id: &str, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticRTP::new(
            opus_capability(),
            track_id.to_string(),
            stream_id.to_string(),
        ));

        Self {
            track,
            sequence_number: Mutex::new(rand::random::<u16>()),
            timestamp: Mutex::new(rand::random::<u32>()),
            ssrc: rand::random::<u32>(),
        }
    }

    /// Get the underlying track for adding to peer connection
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.track.clone()
    }

    /// Send one encoded Opus frame
    pub async fn send_audio(&self, opus_data: &[u8]) -> Result<(), String> {
        // Build RTP packet without holding locks across await
        let packet = {
            let mut seq = self.sequence_number.lock();
            let mut ts = self.timestamp.lock();

            let packet = RtpPacket {
                header: webrtc::rtp::header::Header {
                    version: 2,
                    payload_type: OPUS_PAYLOAD_TYPE,
                    sequence_number: *seq,
                    timestamp: *ts,
                    ssrc: self.ssrc,
                    ..Default::default()
                },
                payload: bytes::Bytes::copy_from_slice(opus_data),
            };

            *seq = seq.wrapping_add(1);
            *ts = ts.wrapping_add(SAMPLES_PER_RTP_PACKET);

            packet
        };

        self.track
            .write_rtp(&packet)
            .await
            .map_err(|e| format!("Failed to write RTP packet: {}", e))?;

        Ok(())
    }

    /// Encode and send every frame published on `source` until it ends.
    ///
    /// A disabled source publishes silence, so muting never renegotiates.
    pub fn spawn_pump(self: Arc<Self>, source: &MediaStreamTrack) -> Result<JoinHandle<()>, String> {
        let mut encoder = VoiceEncoder::new().map_err(|e| e.to_string())?;
        let mut frames = source.subscribe();
        let source_id = source.id().to_string();
        let source = source.downgrade();

        Ok(tokio::spawn(async move {
            loop {
                let frame = match tokio::time::timeout(IDLE_CHECK, frames.recv()).await {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(RecvError::Lagged(skipped))) => {
                        tracing::debug!("Outbound pump for {} skipped {} frames", source_id, skipped);
                        continue;
                    }
                    Ok(Err(RecvError::Closed)) => break,
                    Err(_) => {
                        if source.upgrade().map_or(true, |t| t.is_ended()) {
                            break;
                        }
                        continue;
                    }
                };

                let encoded = match encoder.encode(&frame) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        tracing::warn!("Dropping frame from {}: {}", source_id, e);
                        continue;
                    }
                };
                if let Err(e) = self.send_audio(&encoded).await {
                    tracing::debug!("{}", e);
                }
            }
            tracing::debug!("Outbound pump for {} finished", source_id);
        }))
    }
}

/// Decode RTP from a remote track into a fresh [`MediaStreamTrack`].
///
/// Stopping the returned track ends the reader; the reader ends the track
/// when the remote side goes away.
pub fn spawn_inbound(remote: Arc<TrackRemote>) -> Result<MediaStreamTrack, String> {
    let mut decoder = VoiceDecoder::new().map_err(|e| e.to_string())?;
    let track = MediaStreamTrack::with_id(remote.id(), "Remote audio");
    let sink = track.clone();

    let reader = tokio::spawn(async move {
        loop {
            match remote.read_rtp().await {
                Ok((packet, _attributes)) => {
                    if packet.payload.is_empty() {
                        continue;
                    }
                    match decoder.decode_packet(packet.header.sequence_number, &packet.payload) {
                        Ok(frames) => {
                            for frame in &frames {
                                sink.publish(frame);
                            }
                        }
                        Err(e) => {
                            tracing::debug!("Opus decode failed: {}", e);
                            if let Ok(concealed) = decoder.conceal() {
                                sink.publish(&concealed);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::info!("Remote audio track {} ended: {}", sink.id(), e);
                    break;
                }
            }
        }
        sink.stop();
    });

    let abort = reader.abort_handle();
    track.set_stop_hook(move || abort.abort());
    Ok(track)
}
