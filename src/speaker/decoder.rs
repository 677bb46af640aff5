use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Decoder initialisation failed")]
    InitFailed,
    #[error("Frame failed to decode")]
    BadFrame,
}

/// Seam to the audio codec. The engine hands the application compressed
/// frames exactly as the service sent them; an [`AudioOutput`]
/// implementation typically owns a decoder and feeds PCM to the
/// platform.
///
/// [`AudioOutput`]: super::AudioOutput
pub trait SpeakerDecoder: Send {
    /// Decodes one compressed frame into interleaved 16-bit PCM,
    /// returning the number of samples written.
    fn decode(&mut self, frame: &[u8], pcm: &mut [i16]) -> Result<usize, DecodeError>;
}

#[cfg(feature = "audio-codec")]
pub use opus_decoder::OpusSpeakerDecoder;

#[cfg(feature = "audio-codec")]
mod opus_decoder {
    use super::{DecodeError, SpeakerDecoder};
    use opus::{Channels, Decoder};

    /// Opus-backed decoder at the service's 48kHz output rate.
    pub struct OpusSpeakerDecoder {
        decoder: Decoder,
    }

    impl OpusSpeakerDecoder {
        pub fn new(channels: Channels) -> Result<Self, DecodeError> {
            let decoder = Decoder::new(48000, channels).map_err(|e| {
                log::error!("Failed to create Opus decoder: {e:?}");
                DecodeError::InitFailed
            })?;
            Ok(OpusSpeakerDecoder { decoder })
        }
    }

    impl SpeakerDecoder for OpusSpeakerDecoder {
        fn decode(&mut self, frame: &[u8], pcm: &mut [i16]) -> Result<usize, DecodeError> {
            self.decoder.decode(frame, pcm, false).map_err(|e| {
                log::error!("Opus decode failed: {e:?}");
                DecodeError::BadFrame
            })
        }
    }
}
