//! The audio device ioctl surface. The DMA engines behind it (HDA et
//! al.) are separate drivers; this layer owns the parameter contract
//! and the queued-buffer bookkeeping they share.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::errno::{Errno, KResult};

pub const AUDIO_SETINFO: u32 = 0xA001;
pub const AUDIO_GETINFO: u32 = 0xA002;
pub const AUDIO_SETPAR: u32 = 0xA003;
pub const AUDIO_GETPAR: u32 = 0xA004;
pub const AUDIO_GETPOS: u32 = 0xA005;
pub const AUDIO_START: u32 = 0xA006;
pub const AUDIO_STOP: u32 = 0xA007;
pub const AUDIO_FLUSH: u32 = 0xA008;
pub const AUDIO_DRAIN: u32 = 0xA009;
pub const AUDIO_GETDEV: u32 = 0xA00A;

/// Playback parameters userland negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u8,
    /// Bits per sample.
    pub precision: u8,
}

impl AudioParams {
    pub const fn default_params() -> Self {
        AudioParams {
            sample_rate: 44100,
            channels: 2,
            precision: 16,
        }
    }

    /// The encodings the mixer path can feed the DMA ring.
    pub fn validate(&self) -> KResult<()> {
        match self.sample_rate {
            8000 | 11025 | 16000 | 22050 | 44100 | 48000 => {}
            _ => return Err(Errno::EINVAL),
        }
        if self.channels != 1 && self.channels != 2 {
            return Err(Errno::EINVAL);
        }
        if self.precision != 8 && self.precision != 16 {
            return Err(Errno::EINVAL);
        }
        Ok(())
    }
}

struct SoundState {
    params: AudioParams,
    playing: bool,
    /// Buffers queued for the DMA engine, with the running byte
    /// position consumed so far.
    queued: VecDeque<Vec<u8>>,
    position: u64,
}

pub struct SoundDev {
    state: Mutex<SoundState>,
}

lazy_static! {
    pub static ref SOUND: Arc<SoundDev> = Arc::new(SoundDev {
        state: Mutex::new(SoundState {
            params: AudioParams::default_params(),
            playing: false,
            queued: VecDeque::new(),
            position: 0,
        }),
    });
}

impl SoundDev {
    pub fn set_params(&self, params: AudioParams) -> KResult<()> {
        params.validate()?;
        self.state.lock().params = params;
        Ok(())
    }

    pub fn params(&self) -> AudioParams {
        self.state.lock().params
    }

    pub fn queue(&self, data: &[u8]) -> usize {
        let mut st = self.state.lock();
        st.queued.push_back(data.to_vec());
        data.len()
    }

    pub fn position(&self) -> u64 {
        self.state.lock().position
    }

    pub fn start(&self) {
        self.state.lock().playing = true;
    }

    pub fn stop(&self) {
        self.state.lock().playing = false;
    }

    /// Drop everything still queued, including buffers already handed
    /// to the DMA ring (same behavior as the drain path's completion).
    pub fn flush(&self) {
        let mut st = self.state.lock();
        st.queued.clear();
        st.playing = false;
    }

    pub fn queued_buffers(&self) -> usize {
        self.state.lock().queued.len()
    }
}

impl crate::fs::devfs::CharDev for SoundDev {
    fn read(&self, _minor: u32, _buf: &mut [u8], _nonblock: bool) -> KResult<usize> {
        // Capture is not wired up.
        Err(Errno::ENXIO)
    }

    fn write(&self, _minor: u32, buf: &[u8]) -> KResult<usize> {
        Ok(self.queue(buf))
    }

    fn ioctl(&self, _minor: u32, cmd: u32, arg: usize) -> KResult<usize> {
        match cmd {
            AUDIO_SETINFO | AUDIO_SETPAR => {
                // arg packs rate | channels << 32 | precision << 40.
                let params = AudioParams {
                    sample_rate: arg as u32,
                    channels: (arg >> 32) as u8,
                    precision: (arg >> 40) as u8,
                };
                self.set_params(params)?;
                Ok(0)
            }
            AUDIO_GETINFO | AUDIO_GETPAR => {
                let p = self.params();
                Ok(p.sample_rate as usize
                    | (p.channels as usize) << 32
                    | (p.precision as usize) << 40)
            }
            AUDIO_GETPOS => Ok(self.position() as usize),
            AUDIO_START => {
                self.start();
                Ok(0)
            }
            AUDIO_STOP => {
                self.stop();
                Ok(0)
            }
            AUDIO_FLUSH => {
                self.flush();
                Ok(0)
            }
            AUDIO_DRAIN => {
                // Nothing plays the ring here; drain degenerates to
                // flush of the queued side.
                self.flush();
                Ok(0)
            }
            AUDIO_GETDEV => Ok(0),
            _ => Err(Errno::ENOTTY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_validation() {
        assert!(AudioParams::default_params().validate().is_ok());
        assert!(AudioParams {
            sample_rate: 48000,
            channels: 1,
            precision: 8
        }
        .validate()
        .is_ok());
        assert_eq!(
            AudioParams {
                sample_rate: 44100,
                channels: 3,
                precision: 16
            }
            .validate()
            .unwrap_err(),
            Errno::EINVAL
        );
        assert_eq!(
            AudioParams {
                sample_rate: 12345,
                channels: 2,
                precision: 16
            }
            .validate()
            .unwrap_err(),
            Errno::EINVAL
        );
        assert_eq!(
            AudioParams {
                sample_rate: 44100,
                channels: 2,
                precision: 24
            }
            .validate()
            .unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn flush_frees_queued_buffers() {
        let dev = SoundDev {
            state: Mutex::new(SoundState {
                params: AudioParams::default_params(),
                playing: false,
                queued: VecDeque::new(),
                position: 0,
            }),
        };
        dev.queue(&[0u8; 128]);
        dev.queue(&[0u8; 128]);
        dev.start();
        assert_eq!(dev.queued_buffers(), 2);
        dev.flush();
        assert_eq!(dev.queued_buffers(), 0);
    }
}
