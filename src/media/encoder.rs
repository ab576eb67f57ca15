//! Opus voice codec used on the RTP path.
//!
//! The encoder always emits in-band FEC so the receiving [`VoiceDecoder`] can
//! rebuild a single lost frame from the packet that follows it. Longer gaps
//! fall back to packet loss concealment.

use opus::{Application, Bitrate, Channels, Decoder, Encoder};
use thiserror::Error;

use super::{OPUS_BITRATE, SAMPLES_PER_FRAME, SAMPLE_RATE};

/// Upper bound for one 20 ms voice packet at our bitrate
const MAX_PACKET_SIZE: usize = 512;

/// Expected loss on a best-effort mesh; sizes the FEC Opus embeds
const EXPECTED_LOSS_PERCENT: i32 = 10;

/// Gaps wider than this are treated as a stream restart, not loss
const MAX_CONCEALED_FRAMES: u16 = 5;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Opus error: {0}")]
    Opus(#[from] opus::Error),
    #[error("Expected {expected} samples per frame, got {got}")]
    FrameSize { expected: usize, got: usize },
}

pub struct VoiceEncoder {
    encoder: Encoder,
    packet: Vec<u8>,
}

impl VoiceEncoder {
    pub fn new() -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)?;
        encoder.set_bitrate(Bitrate::Bits(OPUS_BITRATE))?;
        encoder.set_inband_fec(true)?;
        encoder.set_packet_loss_perc(EXPECTED_LOSS_PERCENT)?;
        Ok(Self {
            encoder,
            packet: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    /// Encode exactly one 20 ms frame
    pub fn encode(&mut self, frame: &[f32]) -> Result<Vec<u8>, CodecError> {
        if frame.len() != SAMPLES_PER_FRAME {
            return Err(CodecError::FrameSize {
                expected: SAMPLES_PER_FRAME,
                got: frame.len(),
            });
        }
        let len = self.encoder.encode_float(frame, &mut self.packet)?;
        Ok(self.packet[..len].to_vec())
    }
}

pub struct VoiceDecoder {
    decoder: Decoder,
    last_sequence: Option<u16>,
}

impl VoiceDecoder {
    pub fn new() -> Result<Self, CodecError> {
        Ok(Self {
            decoder: Decoder::new(SAMPLE_RATE, Channels::Mono)?,
            last_sequence: None,
        })
    }

    /// Decode the payload of the RTP packet numbered `sequence`.
    ///
    /// Returns the frames to play in order: any recovered or concealed
    /// frames for a preceding gap, then the packet's own frame. Late and
    /// duplicate packets yield nothing.
    pub fn decode_packet(&mut self, sequence: u16, payload: &[u8]) -> Result<Vec<Vec<f32>>, CodecError> {
        let missing = match self.last_sequence {
            Some(last) => {
                let step = sequence.wrapping_sub(last);
                if step == 0 || step > u16::MAX / 2 {
                    return Ok(Vec::new());
                }
                step - 1
            }
            None => 0,
        };
        self.last_sequence = Some(sequence);

        let mut frames = Vec::new();
        if missing > 0 && missing <= MAX_CONCEALED_FRAMES {
            for _ in 1..missing {
                frames.push(self.run(&[], false)?);
            }
            // The frame right before this packet rides along as FEC
            frames.push(self.run(payload, true)?);
        }
        frames.push(self.run(payload, false)?);
        Ok(frames)
    }

    /// Conceal a frame when the payload itself is unusable
    pub fn conceal(&mut self) -> Result<Vec<f32>, CodecError> {
        self.run(&[], false)
    }

    fn run(&mut self, payload: &[u8], fec: bool) -> Result<Vec<f32>, CodecError> {
        let mut output = vec![0.0f32; SAMPLES_PER_FRAME];
        let len = self.decoder.decode_float(payload, &mut output, fec)?;
        output.truncate(len);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(frame: usize) -> Vec<f32> {
        (0..SAMPLES_PER_FRAME)
            .map(|i| ((frame * SAMPLES_PER_FRAME + i) as f32 * 0.05).sin() * 0.4)
            .collect()
    }

    fn packets(count: usize) -> Vec<Vec<u8>> {
        let mut encoder = VoiceEncoder::new().unwrap();
        (0..count).map(|i| encoder.encode(&tone(i)).unwrap()).collect()
    }

    #[test]
    fn test_voice_frame_survives_codec() {
        let packet = &packets(1)[0];
        assert!(!packet.is_empty());
        assert!(packet.len() < SAMPLES_PER_FRAME);

        let mut decoder = VoiceDecoder::new().unwrap();
        let frames = decoder.decode_packet(100, packet).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), SAMPLES_PER_FRAME);
        assert!(frames[0].iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn test_wrong_frame_size_rejected() {
        let mut encoder = VoiceEncoder::new().unwrap();
        assert!(matches!(
            encoder.encode(&[0.0; 100]),
            Err(CodecError::FrameSize { got: 100, .. })
        ));
    }

    #[test]
    fn test_gap_is_filled_before_next_frame() {
        let packets = packets(4);
        let mut decoder = VoiceDecoder::new().unwrap();

        assert_eq!(decoder.decode_packet(10, &packets[0]).unwrap().len(), 1);
        // 11 lost: recovered from 12's FEC
        assert_eq!(decoder.decode_packet(12, &packets[2]).unwrap().len(), 2);
        // 13 arrives in order
        let frames = decoder.decode_packet(13, &packets[3]).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames.iter().all(|f| f.len() == SAMPLES_PER_FRAME));
    }

    #[test]
    fn test_late_and_duplicate_packets_are_dropped() {
        let packets = packets(3);
        let mut decoder = VoiceDecoder::new().unwrap();

        decoder.decode_packet(5, &packets[0]).unwrap();
        decoder.decode_packet(7, &packets[2]).unwrap();
        assert!(decoder.decode_packet(7, &packets[2]).unwrap().is_empty());
        assert!(decoder.decode_packet(6, &packets[1]).unwrap().is_empty());
    }

    #[test]
    fn test_sequence_wraps_and_long_gaps_restart() {
        let packets = packets(3);
        let mut decoder = VoiceDecoder::new().unwrap();

        decoder.decode_packet(u16::MAX, &packets[0]).unwrap();
        assert_eq!(decoder.decode_packet(0, &packets[1]).unwrap().len(), 1);
        assert_eq!(decoder.decode_packet(1000, &packets[2]).unwrap().len(), 1);
    }
}
