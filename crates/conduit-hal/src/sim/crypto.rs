//! Toy keyed cipher standing in for the engine crypto.
//!
//! XOR keystream plus a keyed checksum. Only the bookkeeping matters
//! here: IV streams per direction, replay rejection on the device, tags
//! that catch tampering and key generations that invalidate old traffic.

use alloc::sync::Arc;

use conduit_core::{Error, Result};

use crate::crypto::{AuthTag, CryptoTrailer, CslContext, CslIv};

const DIR_TO_DEVICE: u32 = 1;
const DIR_TO_HOST: u32 = 2;

fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[derive(Debug)]
struct KeyState {
    generation: u64,
    // CPU -> device
    to_device_next: u64,
    to_device_seen: Option<u64>,
    // device -> CPU
    to_host_next: u64,
    to_host_logged: u64,
}

/// Key material shared by a queue and the CPU session opened on it
#[derive(Debug)]
pub(crate) struct KeyCtx {
    seed: u64,
    state: spin::Mutex<KeyState>,
}

impl KeyCtx {
    pub(crate) fn new(seed: u64) -> Arc<Self> {
        Arc::new(Self {
            seed: mix(seed),
            state: spin::Mutex::new(KeyState {
                generation: 0,
                to_device_next: 0,
                to_device_seen: None,
                to_host_next: 0,
                to_host_logged: 0,
            }),
        })
    }

    fn key(&self, generation: u64, iv: &CslIv) -> u64 {
        mix(self.seed ^ generation.rotate_left(17) ^ mix(iv.counter()) ^ ((iv.0[2] as u64) << 56))
    }

    fn apply(&self, key: u64, data: &mut [u32]) {
        for (i, word) in data.iter_mut().enumerate() {
            *word ^= mix(key ^ i as u64) as u32;
        }
    }

    fn tag(&self, key: u64, ciphertext: &[u32]) -> AuthTag {
        let mut h = mix(key ^ 0x7461_6721);
        for word in ciphertext {
            h = mix(h ^ *word as u64);
        }
        let h2 = mix(h);
        AuthTag([h as u32, (h >> 32) as u32, h2 as u32, (h2 >> 32) as u32])
    }

    fn seal(&self, generation: u64, iv: CslIv, data: &mut [u32]) -> CryptoTrailer {
        let key = self.key(generation, &iv);
        self.apply(key, data);
        CryptoTrailer {
            iv,
            tag: self.tag(key, data),
        }
    }

    fn open(&self, generation: u64, iv: &CslIv, tag: &AuthTag, data: &mut [u32]) -> Result<()> {
        let key = self.key(generation, iv);
        if self.tag(key, data) != *tag {
            return Err(Error::IntegrityFailure);
        }
        self.apply(key, data);
        Ok(())
    }

    /// Device-side encryption of data headed for the CPU
    pub(crate) fn device_encrypt(&self, data: &mut [u32]) -> CryptoTrailer {
        let mut state = self.state.lock();
        let iv = CslIv([
            state.to_host_next as u32,
            (state.to_host_next >> 32) as u32,
            DIR_TO_HOST,
        ]);
        state.to_host_next += 1;
        self.seal(state.generation, iv, data)
    }

    /// Device-side decryption of data the CPU encrypted
    pub(crate) fn device_decrypt(&self, data: &mut [u32], trailer: &CryptoTrailer) -> Result<()> {
        let mut state = self.state.lock();
        if trailer.iv.0[2] != DIR_TO_DEVICE {
            return Err(Error::IntegrityFailure);
        }
        let counter = trailer.iv.counter();
        if state.to_device_seen.is_some_and(|seen| counter <= seen) {
            return Err(Error::IntegrityFailure);
        }
        self.open(state.generation, &trailer.iv, &trailer.tag, data)?;
        state.to_device_seen = Some(counter);
        Ok(())
    }
}

/// CPU side of a simulated encryption session
#[derive(Debug, Clone)]
pub struct SimCsl {
    keys: Arc<KeyCtx>,
}

impl SimCsl {
    pub(crate) fn new(keys: Arc<KeyCtx>) -> Self {
        Self { keys }
    }
}

impl CslContext for SimCsl {
    fn encrypt(&self, data: &mut [u32]) -> Result<CryptoTrailer> {
        let mut state = self.keys.state.lock();
        let iv = CslIv([
            state.to_device_next as u32,
            (state.to_device_next >> 32) as u32,
            DIR_TO_DEVICE,
        ]);
        state.to_device_next += 1;
        Ok(self.keys.seal(state.generation, iv, data))
    }

    fn decrypt(&self, data: &mut [u32], iv: &CslIv, tag: &AuthTag) -> Result<()> {
        let state = self.keys.state.lock();
        if iv.0[2] != DIR_TO_HOST {
            return Err(Error::IntegrityFailure);
        }
        self.keys.open(state.generation, iv, tag, data)
    }

    fn log_device_encryption(&self) -> CslIv {
        let mut state = self.keys.state.lock();
        let iv = CslIv([
            state.to_host_logged as u32,
            (state.to_host_logged >> 32) as u32,
            DIR_TO_HOST,
        ]);
        state.to_host_logged += 1;
        iv
    }

    fn rotate_key(&self) -> Result<()> {
        let mut state = self.keys.state.lock();
        if state.to_host_logged != state.to_host_next {
            // Device encryptions still outstanding would be unreadable
            return Err(Error::KeyRotationFailed);
        }
        state.generation += 1;
        state.to_device_next = 0;
        state.to_device_seen = None;
        state.to_host_next = 0;
        state.to_host_logged = 0;
        Ok(())
    }

    fn key_generation(&self) -> u64 {
        self.keys.state.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_to_device() {
        let keys = KeyCtx::new(7);
        let csl = SimCsl::new(keys.clone());
        let mut data = [1, 2, 3, 4];
        let trailer = csl.encrypt(&mut data).unwrap();
        assert_ne!(data, [1, 2, 3, 4]);
        keys.device_decrypt(&mut data, &trailer).unwrap();
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    fn test_replay_rejected() {
        let keys = KeyCtx::new(7);
        let csl = SimCsl::new(keys.clone());
        let mut first = [5u32; 3];
        let t1 = csl.encrypt(&mut first).unwrap();
        let mut second = [6u32; 3];
        let t2 = csl.encrypt(&mut second).unwrap();

        let replay = second;
        keys.device_decrypt(&mut second, &t2).unwrap();
        assert_eq!(keys.device_decrypt(&mut first, &t1), Err(Error::IntegrityFailure));
        let mut replay = replay;
        assert_eq!(keys.device_decrypt(&mut replay, &t2), Err(Error::IntegrityFailure));
    }

    #[test]
    fn test_device_to_host_uses_logged_iv() {
        let keys = KeyCtx::new(11);
        let csl = SimCsl::new(keys.clone());
        let iv = csl.log_device_encryption();
        let mut data = [0xdead_beef];
        let trailer = keys.device_encrypt(&mut data);
        assert_eq!(trailer.iv, iv);
        csl.decrypt(&mut data, &iv, &trailer.tag).unwrap();
        assert_eq!(data, [0xdead_beef]);
    }

    #[test]
    fn test_tamper_detected() {
        let keys = KeyCtx::new(3);
        let csl = SimCsl::new(keys.clone());
        let iv = csl.log_device_encryption();
        let mut data = [10, 20];
        let trailer = keys.device_encrypt(&mut data);
        data[1] ^= 1;
        assert_eq!(csl.decrypt(&mut data, &iv, &trailer.tag), Err(Error::IntegrityFailure));
    }

    #[test]
    fn test_rotation_resets_streams() {
        let keys = KeyCtx::new(5);
        let csl = SimCsl::new(keys.clone());
        let mut data = [9u32];
        let stale = csl.encrypt(&mut data).unwrap();
        csl.rotate_key().unwrap();
        assert_eq!(csl.key_generation(), 1);
        assert_eq!(keys.device_decrypt(&mut data, &stale), Err(Error::IntegrityFailure));

        let mut fresh = [9u32];
        let trailer = csl.encrypt(&mut fresh).unwrap();
        assert_eq!(trailer.iv.counter(), 0);
        keys.device_decrypt(&mut fresh, &trailer).unwrap();
        assert_eq!(fresh, [9]);
    }

    #[test]
    fn test_rotation_refused_with_unlogged_encryption() {
        let keys = KeyCtx::new(5);
        let csl = SimCsl::new(keys.clone());
        let mut data = [1u32];
        keys.device_encrypt(&mut data);
        assert_eq!(csl.rotate_key(), Err(Error::KeyRotationFailed));
    }
}
