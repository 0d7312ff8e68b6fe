//! Per-pool key rotation.
//!
//! A pool is rotated once the bytes it pushed through the CPU side of its
//! sessions cross the configured threshold. Rotation takes every admission
//! unit of the pool, waits for its channels to drain, then replaces the key
//! material of each session.

use conduit_core::{Error, Result};
use conduit_hal::{CslContext, Device};

use crate::manager::ChannelManager;
use crate::pool::{ChannelPool, PoolType};

impl<D: Device> ChannelManager<D> {
    /// Rotate the keys of every pool of a type, whether due or not
    pub fn rotate_keys(&self, pool_type: PoolType) -> Result<()> {
        let mut rotated = false;
        for (index, pool) in self.pools.iter().enumerate() {
            if pool.pool_type == pool_type && pool.is_secure() {
                self.rotate_pool(index, true)?;
                rotated = true;
            }
        }
        if !rotated {
            return Err(Error::NotSupported);
        }
        Ok(())
    }

    /// Rotate a pool if its threshold was crossed, or unconditionally with
    /// `force`; returns whether a rotation happened
    pub(crate) fn rotate_pool(&self, index: usize, force: bool) -> Result<bool> {
        let pool = &self.pools[index];
        let Some(secure) = &pool.secure else {
            return Ok(false);
        };
        let threshold = self.shared.config.key_rotation_threshold;

        let _rotation = secure.rotation.lock();
        if !force && !pool.stats.rotation_due(threshold) {
            return Ok(false);
        }

        // LCIC channels are only ever driven through their WLC partner
        let admission = match pool.pool_type {
            PoolType::Lcic => self.wlc_pool().ok_or(Error::InvalidState)?,
            _ => pool,
        };
        let Some(gate) = admission.secure.as_ref().map(|s| &s.gate) else {
            return Ok(false);
        };
        let units = gate.capacity();
        let mut spin = self.shared.ctx.spin_loop("key rotation admission");
        gate.bulk_acquire(units, &mut spin)?;

        let result = self.drain_for_rotation(admission).and_then(|_| {
            for (channel_index, channel) in pool.channels.iter().enumerate() {
                let Some(csl) = channel.csl.as_deref() else {
                    continue;
                };
                if let Err(err) = csl.rotate_key() {
                    log::error!("{}: key rotation failed: {}", channel.name, err);
                    return Err(pool.escalate(&self.shared, channel_index, Error::KeyRotationFailed));
                }
            }
            Ok(())
        });
        gate.bulk_release(units);
        result?;

        pool.stats.note_rotation();
        let stats = pool.stats.snapshot();
        log::info!(
            "rotated keys of {} pool on engine {} (generation {}, {} bytes encrypted, {} decrypted)",
            pool.pool_type.name(),
            pool.engine_index,
            stats.rotations,
            stats.encrypted_bytes,
            stats.decrypted_bytes
        );
        Ok(true)
    }

    /// Wait until nothing is in flight on the channels admitted by `pool`
    ///
    /// Tracking values are cached on the way, so nothing encrypted under
    /// the old key is left unread.
    fn drain_for_rotation(&self, pool: &ChannelPool<D>) -> Result<()> {
        for index in 0..pool.channels.len() {
            pool.wait(&self.shared, index)?;
        }
        Ok(())
    }
}
