//! # Encryption Sessions
//!
//! CPU side of a per-channel encryption context. The primitives are opaque:
//! the core only needs to encrypt pushes for the device, decrypt what the
//! device encrypted, keep the IV streams of both directions in step, and
//! rotate the key.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use conduit_core::Result;

/// Initialization vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct CslIv(pub [u32; 3]);

impl CslIv {
    /// IV with the given message counter
    pub const fn from_counter(counter: u64) -> Self {
        Self([counter as u32, (counter >> 32) as u32, 0])
    }

    /// Message counter carried by the IV
    pub const fn counter(&self) -> u64 {
        ((self.0[1] as u64) << 32) | self.0[0] as u64
    }
}

/// Authentication tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct AuthTag(pub [u32; 4]);

/// IV and tag stored next to every ciphertext
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct CryptoTrailer {
    /// IV used for the ciphertext
    pub iv: CslIv,
    /// Tag over the ciphertext
    pub tag: AuthTag,
}

/// Size of a [`CryptoTrailer`] in 32-bit words
pub const TRAILER_WORDS: usize = core::mem::size_of::<CryptoTrailer>() / 4;

const_assert_eq!(TRAILER_WORDS, 7);

impl CryptoTrailer {
    /// View as words, for copying into device memory
    pub fn as_words(&self) -> &[u32] {
        bytemuck::cast_slice(core::slice::from_ref(self))
    }

    /// Rebuild from words read back from device memory
    pub fn from_words(words: &[u32; TRAILER_WORDS]) -> Self {
        bytemuck::cast(*words)
    }
}

/// CPU half of a channel's encryption session
pub trait CslContext: Send + Sync {
    /// Encrypt `data` in place for the device; the returned trailer must
    /// travel with the ciphertext
    fn encrypt(&self, data: &mut [u32]) -> Result<CryptoTrailer>;

    /// Decrypt data the device encrypted with `iv`
    fn decrypt(&self, data: &mut [u32], iv: &CslIv, tag: &AuthTag) -> Result<()>;

    /// Reserve the IV the device will use for its next encryption
    fn log_device_encryption(&self) -> CslIv;

    /// Replace the key material on both sides
    fn rotate_key(&self) -> Result<()>;

    /// Number of completed rotations
    fn key_generation(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailer_words() {
        let trailer = CryptoTrailer {
            iv: CslIv::from_counter(0x1_0000_0002),
            tag: AuthTag([7, 8, 9, 10]),
        };
        let words = trailer.as_words();
        assert_eq!(words.len(), TRAILER_WORDS);
        assert_eq!(&words[..2], &[2, 1]);

        let mut raw = [0u32; TRAILER_WORDS];
        raw.copy_from_slice(words);
        let back = CryptoTrailer::from_words(&raw);
        assert_eq!(back.iv.counter(), 0x1_0000_0002);
        assert_eq!(back.tag, trailer.tag);
    }
}
