//! # Method Emitters
//!
//! Engine opcode encoders. They write into any [`MethodSink`] so the same
//! encoder serves live pushes, offline schedules and launch records.

use alloc::vec::Vec;

use conduit_core::{Error, GpuAddr, Result};

/// Destination for encoded methods
pub trait MethodSink {
    /// Append words
    fn emit(&mut self, words: &[u32]) -> Result<()>;
}

/// Comparison used by a semaphore acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AcquireMode {
    /// Wait until the payload equals the value
    Eq = 0,
    /// Wait until the payload reaches the value, modulo 2^32
    Geq = 1,
}

/// Host (channel front-end) methods
pub trait HostHal: Send + Sync {
    /// Channel initialization methods
    fn init(&self, sink: &mut dyn MethodSink) -> Result<()>;

    /// Padding of `words` words in total
    fn noop(&self, sink: &mut dyn MethodSink, words: u32) -> Result<()>;

    /// Stall the channel until the semaphore satisfies `mode`
    fn semaphore_acquire(
        &self,
        sink: &mut dyn MethodSink,
        va: GpuAddr,
        payload: u32,
        mode: AcquireMode,
    ) -> Result<()>;

    /// Write a semaphore payload
    fn semaphore_release(&self, sink: &mut dyn MethodSink, va: GpuAddr, payload: u32)
    -> Result<()>;

    /// Ring another channel's doorbell from the GPU
    fn doorbell(&self, sink: &mut dyn MethodSink, token: u32) -> Result<()>;

    /// Execute a method stream stored elsewhere, then return
    fn call(&self, sink: &mut dyn MethodSink, va: GpuAddr, bytes: u32) -> Result<()>;

    /// Words preceding inline data
    fn inline_header_words(&self) -> u32;

    /// Embed data in the stream; the engine skips it
    fn inline_data(&self, sink: &mut dyn MethodSink, data: &[u32]) -> Result<()>;

    /// Encode a GPFIFO entry pointing at a method stream
    fn gpfifo_entry(&self, va: GpuAddr, bytes: u32) -> u64;

    /// Encode a GPFIFO entry the engine skips
    fn gpfifo_noop_entry(&self) -> u64;
}

/// Copy engine methods
pub trait CeHal: Send + Sync {
    /// Engine initialization methods
    fn init(&self, sink: &mut dyn MethodSink) -> Result<()>;

    /// Write a 32-bit semaphore payload
    fn semaphore_release(&self, sink: &mut dyn MethodSink, va: GpuAddr, payload: u32)
    -> Result<()>;

    /// Atomically increment a semaphore; values at `wrap` reset to zero
    fn semaphore_reduction_inc(&self, sink: &mut dyn MethodSink, va: GpuAddr, wrap: u32)
    -> Result<()>;

    /// Fill `bytes` with a 32-bit pattern
    fn memset_4(&self, sink: &mut dyn MethodSink, va: GpuAddr, value: u32, bytes: u32)
    -> Result<()>;

    /// Copy `bytes`
    fn memcopy(&self, sink: &mut dyn MethodSink, dst: GpuAddr, src: GpuAddr, bytes: u32)
    -> Result<()>;

    /// Encrypt `bytes` from protected `src` into unprotected `dst`; the
    /// trailer lands at `trailer`
    fn encrypt(
        &self,
        sink: &mut dyn MethodSink,
        dst: GpuAddr,
        src: GpuAddr,
        bytes: u32,
        trailer: GpuAddr,
    ) -> Result<()>;

    /// Decrypt `bytes` from unprotected `src` into protected `dst`
    fn decrypt(
        &self,
        sink: &mut dyn MethodSink,
        dst: GpuAddr,
        src: GpuAddr,
        bytes: u32,
        trailer: GpuAddr,
    ) -> Result<()>;
}

/// Security co-processor methods
pub trait Sec2Hal: Send + Sync {
    /// Engine initialization methods
    fn init(&self, sink: &mut dyn MethodSink) -> Result<()>;

    /// Write a 32-bit semaphore payload
    fn semaphore_release(&self, sink: &mut dyn MethodSink, va: GpuAddr, payload: u32)
    -> Result<()>;

    /// Decrypt `bytes` from unprotected `src` into protected `dst`
    fn decrypt(
        &self,
        sink: &mut dyn MethodSink,
        dst: GpuAddr,
        src: GpuAddr,
        bytes: u32,
        trailer: GpuAddr,
    ) -> Result<()>;
}

// =============================================================================
// WORD BUFFER
// =============================================================================

/// Growable sink with a hard word limit
#[derive(Debug, Clone)]
pub struct WordBuffer {
    words: Vec<u32>,
    limit: usize,
}

impl WordBuffer {
    /// Empty buffer holding at most `limit` words
    pub fn with_limit(limit: usize) -> Self {
        Self {
            words: Vec::new(),
            limit,
        }
    }

    /// Encoded words
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Number of encoded words
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether nothing was encoded
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Take the encoded words
    pub fn into_words(self) -> Vec<u32> {
        self.words
    }
}

impl MethodSink for WordBuffer {
    fn emit(&mut self, words: &[u32]) -> Result<()> {
        if self.words.len() + words.len() > self.limit {
            return Err(Error::PushBufferOverflow);
        }
        self.words.extend_from_slice(words);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_buffer_limit() {
        let mut buf = WordBuffer::with_limit(4);
        assert!(buf.emit(&[1, 2, 3]).is_ok());
        assert_eq!(buf.emit(&[4, 5]), Err(Error::PushBufferOverflow));
        assert!(buf.emit(&[4]).is_ok());
        assert_eq!(buf.into_words(), [1, 2, 3, 4]);
    }
}
