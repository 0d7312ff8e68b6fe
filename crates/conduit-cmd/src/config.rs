//! # Channel Manager Configuration
//!
//! Tunables and the limits they are clamped to.

use static_assertions::const_assert;

use conduit_core::{BufferLocation, ByteSize, SpinConfig};

// =============================================================================
// LIMITS
// =============================================================================

/// Largest push a caller may request
pub const MAX_PUSH_SIZE: ByteSize = ByteSize::from_kib(128);

/// Space kept behind every push for the closing semaphore release and,
/// in secure mode, the crypto trailer
pub const PUSH_END_RESERVED: ByteSize = ByteSize::from_bytes(256);

/// Pushbuffer bytes one push may occupy
pub const PUSH_SLOT_SIZE: ByteSize =
    ByteSize::from_bytes(MAX_PUSH_SIZE.as_bytes() + PUSH_END_RESERVED.as_bytes());

/// Fewest GPFIFO entries per channel
pub const GPFIFO_ENTRIES_MIN: u32 = 32;
/// Default GPFIFO entries per channel
pub const GPFIFO_ENTRIES_DEFAULT: u32 = 1024;
/// Most GPFIFO entries per channel
pub const GPFIFO_ENTRIES_MAX: u32 = 1024 * 1024;

/// Channels a pool can hold (width of the lock bitmap)
pub const MAX_POOL_CHANNELS: u32 = 64;

/// Chunks the pushbuffer can be split into (width of the chunk bitmaps)
pub const MAX_PUSHBUFFER_CHUNKS: u32 = 64;

/// Entries retired per progress call unless forced
pub const DEFAULT_PROGRESS_BATCH: u32 = 8;

const_assert!(GPFIFO_ENTRIES_MIN.is_power_of_two());
const_assert!(GPFIFO_ENTRIES_DEFAULT.is_power_of_two());
const_assert!(GPFIFO_ENTRIES_MAX.is_power_of_two());
const_assert!(PUSH_END_RESERVED.as_bytes() % 4 == 0);

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Channel manager configuration
#[derive(Debug, Clone)]
pub struct ChannelManagerConfig {
    /// GPFIFO entries per channel
    pub num_gpfifo_entries: u32,
    /// Where GPFIFO rings live
    pub gpfifo_location: BufferLocation,
    /// Where GPPUT words live
    pub gpput_location: BufferLocation,
    /// Where the pushbuffer lives
    pub pushbuffer_location: BufferLocation,
    /// Channels in each engine pool
    pub channels_per_pool: u32,
    /// Channels in each of the secure launch pools
    pub launch_pair_channels: u32,
    /// Pushbuffer chunks
    pub pushbuffer_chunks: u32,
    /// Bytes per pushbuffer chunk
    pub chunk_size: ByteSize,
    /// Entries retired per progress call
    pub progress_batch: u32,
    /// Bytes encrypted or decrypted under one key before it is rotated
    pub key_rotation_threshold: ByteSize,
    /// Busy-wait tunables
    pub spin: SpinConfig,
}

impl Default for ChannelManagerConfig {
    fn default() -> Self {
        Self {
            num_gpfifo_entries: GPFIFO_ENTRIES_DEFAULT,
            gpfifo_location: BufferLocation::Auto,
            gpput_location: BufferLocation::Auto,
            pushbuffer_location: BufferLocation::Auto,
            channels_per_pool: 2,
            launch_pair_channels: 2,
            pushbuffer_chunks: 16,
            chunk_size: ByteSize::from_kib(512),
            progress_batch: DEFAULT_PROGRESS_BATCH,
            key_rotation_threshold: ByteSize::from_gib(1),
            spin: SpinConfig::default(),
        }
    }
}

impl ChannelManagerConfig {
    /// Set the GPFIFO depth
    pub fn with_gpfifo_entries(mut self, entries: u32) -> Self {
        self.num_gpfifo_entries = entries;
        self
    }

    /// Set the pushbuffer geometry
    pub fn with_pushbuffer(mut self, chunks: u32, chunk_size: ByteSize) -> Self {
        self.pushbuffer_chunks = chunks;
        self.chunk_size = chunk_size;
        self
    }

    /// Set the number of channels per engine pool
    pub fn with_channels_per_pool(mut self, channels: u32) -> Self {
        self.channels_per_pool = channels;
        self
    }

    /// Set the key rotation threshold
    pub fn with_key_rotation_threshold(mut self, threshold: ByteSize) -> Self {
        self.key_rotation_threshold = threshold;
        self
    }

    /// Set the busy-wait tunables
    pub fn with_spin(mut self, spin: SpinConfig) -> Self {
        self.spin = spin;
        self
    }

    /// Parse the GPFIFO, GPPUT and pushbuffer locations from their
    /// textual form; unknown strings leave the value unchanged
    pub fn with_locations(mut self, gpfifo: &str, gpput: &str, pushbuffer: &str) -> Self {
        for (text, slot) in [
            (gpfifo, &mut self.gpfifo_location),
            (gpput, &mut self.gpput_location),
            (pushbuffer, &mut self.pushbuffer_location),
        ] {
            match BufferLocation::parse(text) {
                Ok(location) => *slot = location,
                Err(_) => log::warn!("ignoring invalid buffer location '{}'", text),
            }
        }
        self
    }

    /// Clamp every tunable into range for a device
    pub fn normalize(&mut self, has_vidmem: bool, secure: bool) {
        let requested = self.num_gpfifo_entries;
        let mut entries = requested.clamp(GPFIFO_ENTRIES_MIN, GPFIFO_ENTRIES_MAX);
        if !entries.is_power_of_two() {
            entries = entries.next_power_of_two();
        }
        if entries != requested {
            log::warn!(
                "num_gpfifo_entries {} is invalid, using {} instead",
                requested,
                entries
            );
        }
        self.num_gpfifo_entries = entries;

        for location in [
            &mut self.gpfifo_location,
            &mut self.gpput_location,
            &mut self.pushbuffer_location,
        ] {
            if *location == BufferLocation::Vid && !has_vidmem {
                log::warn!("no video memory, falling back to sysmem");
                *location = BufferLocation::Sys;
            }
            if *location == BufferLocation::Auto {
                *location = BufferLocation::Sys;
            }
        }
        if secure {
            // Work launch state is only reachable inside the trusted boundary
            self.gpfifo_location = BufferLocation::Vid;
            self.gpput_location = BufferLocation::Vid;
            self.pushbuffer_location = BufferLocation::Vid;
        }

        self.channels_per_pool = self.channels_per_pool.clamp(1, MAX_POOL_CHANNELS);
        self.launch_pair_channels = self.launch_pair_channels.clamp(1, MAX_POOL_CHANNELS);
        self.pushbuffer_chunks = self.pushbuffer_chunks.clamp(1, MAX_PUSHBUFFER_CHUNKS);
        if secure {
            // A bring-up launch holds a chunk while its payload claims another
            self.pushbuffer_chunks = self.pushbuffer_chunks.max(2);
        }
        if self.chunk_size < PUSH_SLOT_SIZE {
            log::warn!(
                "pushbuffer chunk of {} cannot hold a push, using {}",
                self.chunk_size,
                PUSH_SLOT_SIZE
            );
            self.chunk_size = PUSH_SLOT_SIZE;
        }
        self.chunk_size = self.chunk_size.align_up(4);
        self.progress_batch = self.progress_batch.max(1);
    }
}
