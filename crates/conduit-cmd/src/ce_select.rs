//! # Copy Engine Selection
//!
//! Picks one logical copy engine per channel type from the device's
//! capability table. Types are assigned in a fixed order and every pick
//! makes the chosen engine less attractive to the types that follow.

use core::cmp::Ordering;

use conduit_core::{Error, Result};
use conduit_hal::{CeCapsFlags, CopyEngineCaps, CopyEngineTable};

use crate::channel::ChannelType;

/// Copy engine chosen for each channel type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CeSelection {
    /// Logical CE per entry of [`ChannelType::CE_TYPES`]
    pub preferred: [u32; ChannelType::CE_TYPES.len()],
    /// Every CE that gets a pool
    pub usable_mask: u32,
}

impl CeSelection {
    /// Logical CE serving `ty`
    pub fn ce_for(&self, ty: ChannelType) -> Option<u32> {
        ty.ce_slot().map(|slot| self.preferred[slot])
    }
}

fn is_usable(caps: &CopyEngineCaps, secure: bool) -> bool {
    caps.has(CeCapsFlags::SUPPORTED)
        && !caps.has(CeCapsFlags::GRCE)
        && (!secure || caps.has(CeCapsFlags::SECURE))
}

fn is_usable_for(caps: &CopyEngineCaps, ty: ChannelType) -> bool {
    match ty {
        ChannelType::CpuToGpu | ChannelType::GpuToCpu => caps.has(CeCapsFlags::SYSMEM),
        ChannelType::GpuToGpu => caps.has(CeCapsFlags::P2P),
        _ => true,
    }
}

/// `Less` when `a` is the better engine, true before false
fn prefer(a: bool, b: bool) -> Ordering {
    b.cmp(&a)
}

/// Order two candidate engines for `ty`; `Less` means `a` wins
fn compare(
    ty: ChannelType,
    (a, a_caps): (u32, &CopyEngineCaps),
    (b, b_caps): (u32, &CopyEngineCaps),
    usage: &[u32],
) -> Ordering {
    let nvlink = |caps: &CopyEngineCaps| caps.has(CeCapsFlags::NVLINK_P2P);

    let specific = match ty {
        ChannelType::CpuToGpu => prefer(
            a_caps.has(CeCapsFlags::SYSMEM_READ),
            b_caps.has(CeCapsFlags::SYSMEM_READ),
        )
        .then(prefer(!nvlink(a_caps), !nvlink(b_caps))),
        ChannelType::GpuToCpu => prefer(
            a_caps.has(CeCapsFlags::SYSMEM_WRITE),
            b_caps.has(CeCapsFlags::SYSMEM_WRITE),
        )
        .then(prefer(!nvlink(a_caps), !nvlink(b_caps))),
        ChannelType::GpuToGpu => b_caps.pce_count().cmp(&a_caps.pce_count()),
        ChannelType::GpuInternal => b_caps
            .pce_count()
            .cmp(&a_caps.pce_count())
            .then(prefer(!nvlink(a_caps), !nvlink(b_caps))),
        _ => Ordering::Equal,
    };

    specific
        .then(usage[a as usize].cmp(&usage[b as usize]))
        .then(prefer(
            !a_caps.has(CeCapsFlags::SHARED),
            !b_caps.has(CeCapsFlags::SHARED),
        ))
        .then(a.cmp(&b))
}

/// Pick engines for every CE channel type
pub fn select_copy_engines(table: &CopyEngineTable, secure: bool) -> Result<CeSelection> {
    let mut usable_mask = 0u32;
    for (index, caps) in table.iter().enumerate() {
        if is_usable(caps, secure) {
            usable_mask |= 1 << index;
        }
    }
    if usable_mask == 0 {
        return Err(Error::NotSupported);
    }

    let mut usage = [0u32; conduit_hal::MAX_COPY_ENGINES];
    let mut preferred = [0u32; ChannelType::CE_TYPES.len()];

    for (slot, ty) in ChannelType::CE_TYPES.iter().copied().enumerate() {
        let best = table
            .iter()
            .enumerate()
            .map(|(index, caps)| (index as u32, caps))
            .filter(|(index, caps)| usable_mask & (1 << index) != 0 && is_usable_for(caps, ty))
            .min_by(|a, b| compare(ty, *a, *b, &usage))
            .map(|(index, _)| index)
            .ok_or(Error::NotSupported)?;

        usage[best as usize] += 1;
        preferred[slot] = best;
        log::debug!("copy engine {} selected for {}", best, ty);
    }

    Ok(CeSelection {
        preferred,
        usable_mask,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_hal::sim::SimConfig;

    #[test]
    fn test_default_table() {
        let table = SimConfig::default_copy_engines();
        let selection = select_copy_engines(&table, false).unwrap();
        assert_eq!(selection.usable_mask, 0b1110);
        assert_eq!(selection.ce_for(ChannelType::CpuToGpu), Some(1));
        assert_eq!(selection.ce_for(ChannelType::GpuToCpu), Some(1));
        assert_eq!(selection.ce_for(ChannelType::GpuInternal), Some(1));
        assert_eq!(selection.ce_for(ChannelType::GpuToGpu), Some(3));
        assert_eq!(selection.ce_for(ChannelType::Memops), Some(2));
        assert_eq!(selection.ce_for(ChannelType::Sec2), None);
    }

    #[test]
    fn test_grce_and_unsupported_skipped() {
        let mut table = CopyEngineTable::new();
        table.push(CopyEngineCaps::new(
            CeCapsFlags::SUPPORTED | CeCapsFlags::GRCE | CeCapsFlags::SYSMEM,
            0b1,
        ));
        table.push(CopyEngineCaps::new(CeCapsFlags::SYSMEM | CeCapsFlags::P2P, 0b10));
        assert_eq!(select_copy_engines(&table, false), Err(Error::NotSupported));

        table.push(CopyEngineCaps::new(CeCapsFlags::SUPPORTED, 0b100));
        // Usable, but nothing can reach sysmem
        assert_eq!(select_copy_engines(&table, false), Err(Error::NotSupported));
    }

    #[test]
    fn test_secure_needs_secure_engines() {
        let mut table = CopyEngineTable::new();
        let all = CeCapsFlags::SUPPORTED
            | CeCapsFlags::SYSMEM
            | CeCapsFlags::SYSMEM_READ
            | CeCapsFlags::SYSMEM_WRITE
            | CeCapsFlags::P2P;
        table.push(CopyEngineCaps::new(all, 0b1));
        table.push(CopyEngineCaps::new(all | CeCapsFlags::SECURE, 0b10));
        let selection = select_copy_engines(&table, true).unwrap();
        assert_eq!(selection.usable_mask, 0b10);
        assert!(selection.preferred.iter().all(|&ce| ce == 1));
    }

    #[test]
    fn test_usage_spreads_ties() {
        let mut table = CopyEngineTable::new();
        let flags = CeCapsFlags::SUPPORTED | CeCapsFlags::SYSMEM | CeCapsFlags::P2P;
        table.push(CopyEngineCaps::new(flags, 0b1));
        table.push(CopyEngineCaps::new(flags, 0b10));
        let selection = select_copy_engines(&table, false).unwrap();
        // CPU_TO_GPU, GPU_TO_CPU, GPU_INTERNAL, GPU_TO_GPU, MEMOPS
        assert_eq!(selection.preferred, [0, 1, 0, 1, 0]);
    }
}
