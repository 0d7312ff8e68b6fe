use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use std::vec::Vec;

use conduit_core::{ByteSize, Error, GpuAddr, GpuId, SpinConfig};
use conduit_hal::sim::{NOTIFIER_METHOD_FAULT, SimConfig, SimDevice, SimMemory};
use conduit_hal::{AcquireMode, AllocDesc, DeviceMemory, MethodSink};

use super::*;
use crate::config::MAX_PUSH_SIZE;

fn test_config() -> ChannelManagerConfig {
    ChannelManagerConfig::default()
        .with_gpfifo_entries(32)
        .with_pushbuffer(4, ByteSize::from_kib(256))
        .with_spin(SpinConfig {
            max_spins: Some(50_000_000),
            ..SpinConfig::default()
        })
}

fn manager_with(sim: SimConfig, config: ChannelManagerConfig) -> (SimDevice, ChannelManager<SimDevice>) {
    let device = SimDevice::new(sim);
    let manager = ChannelManager::new(device.clone(), config).unwrap();
    (device, manager)
}

fn manager(sim: SimConfig) -> (SimDevice, ChannelManager<SimDevice>) {
    manager_with(sim, test_config())
}

fn sysmem(device: &SimDevice, words: u64) -> SimMemory {
    device
        .alloc_memory(&AllocDesc::new(
            "test",
            ByteSize::from_bytes(words * 4),
            BufferLocation::Sys,
        ))
        .unwrap()
}

/// Push that waits for `value - 1` at `va` and then writes `value`
fn chained_push(manager: &ChannelManager<SimDevice>, ty: ChannelType, va: GpuAddr, value: u32) -> u64 {
    let mut push = manager.push_begin(ty, "chained release").unwrap();
    push.host()
        .semaphore_acquire(&mut push, va, value - 1, AcquireMode::Eq)
        .unwrap();
    push.ce().semaphore_release(&mut push, va, value).unwrap();
    push.end().unwrap()
}

/// Push that increments the word at `va`
fn increment_push(manager: &ChannelManager<SimDevice>, ty: ChannelType, va: GpuAddr) {
    let mut push = manager.push_begin(ty, "increment").unwrap();
    push.ce()
        .semaphore_reduction_inc(&mut push, va, u32::MAX)
        .unwrap();
    push.end().unwrap();
}

fn drain(manager: &ChannelManager<SimDevice>) {
    manager.wait().unwrap();
    while manager.update_progress().unwrap() > 0 {}
}

// =============================================================================
// Plain device
// =============================================================================

#[test]
fn test_copy_engine_assignment() {
    let (_device, manager) = manager(SimConfig::new(0));
    assert_eq!(manager.ce_mask(), 0b1110);
    assert_eq!(manager.ce_for(ChannelType::CpuToGpu), Some(1));
    assert_eq!(manager.ce_for(ChannelType::GpuToCpu), Some(1));
    assert_eq!(manager.ce_for(ChannelType::GpuInternal), Some(1));
    assert_eq!(manager.ce_for(ChannelType::GpuToGpu), Some(3));
    assert_eq!(manager.ce_for(ChannelType::Memops), Some(2));

    assert_eq!(manager.pools().len(), 3);
    assert!(manager.pools().iter().all(|p| p.pool_type() == PoolType::Ce && !p.is_secure()));
    assert!(!manager.is_secure());
    assert!(matches!(manager.reserve(ChannelType::Sec2), Err(Error::NotSupported)));
    assert!(matches!(manager.reserve(ChannelType::Wlc), Err(Error::InvalidParameter)));

    let peers = manager.channels_of(ChannelType::GpuToGpu).unwrap();
    assert_eq!(peers.len(), 2);
    assert!(peers[0].name().starts_with("CE3"));
}

#[test]
fn test_channels_start_idle() {
    let (_device, manager) = manager(SimConfig::new(0));
    drain(&manager);
    for channel in manager.channels() {
        assert_eq!(channel.queued(), 1, "{}", channel.name());
        assert_eq!(channel.completed(), 1);
        // One slot always stays empty
        assert_eq!(channel.available_slots(), 31);
        assert!(channel.get_status().is_ok());
    }
}

#[test]
fn test_pushes_complete_in_order() {
    let (device, manager) = manager(SimConfig::new(0));
    for ty in ChannelType::CE_TYPES {
        let sem = sysmem(&device, 1);
        let mut last = 0;
        for value in 1..=1024 {
            let tracking = chained_push(&manager, ty, sem.gpu_va(), value);
            assert!(tracking > 0);
            last = value;
        }
        manager.wait().unwrap();
        assert_eq!(sem.read_u32(0).unwrap(), last, "{}", ty);
    }
    assert!(manager.status().is_ok());

    drain(&manager);
    let stats = manager.pushbuffer_stats();
    assert_eq!(stats.pushes_started, stats.pushes_completed);
}

#[test]
fn test_tracking_values_increase() {
    let (device, manager) = manager(SimConfig::new(0));
    let sem = sysmem(&device, 1);

    let mut reservation = manager.reserve_count(ChannelType::GpuInternal, 3).unwrap();
    let channel = reservation.channel();
    let first = channel.queued();
    let mut values = Vec::new();
    for _ in 0..3 {
        let mut push = reservation.begin_push("tracked").unwrap();
        push.ce().semaphore_reduction_inc(&mut push, sem.gpu_va(), u32::MAX).unwrap();
        values.push(push.end().unwrap());
    }
    assert_eq!(values, [first + 1, first + 2, first + 3]);
    assert_eq!(reservation.remaining(), 0);
    assert!(matches!(reservation.begin_push("extra"), Err(Error::InvalidState)));

    channel.wait_for(first + 3).unwrap();
    assert!(channel.is_value_completed(first + 3));
    assert_eq!(sem.read_u32(0).unwrap(), 3);
}

#[test]
fn test_unused_reservation_returns_slots() {
    let (_device, manager) = manager(SimConfig::new(0));
    drain(&manager);
    let channel = {
        let reservation = manager.reserve_count(ChannelType::Memops, 5).unwrap();
        let channel = reservation.channel();
        assert_eq!(channel.available_slots(), 26);
        channel
    };
    assert_eq!(channel.available_slots(), 31);
}

#[test]
fn test_reserve_blocks_while_channels_are_full() {
    let config = test_config().with_channels_per_pool(1);
    let (device, manager) = manager_with(SimConfig::new(0), config);
    let sem = sysmem(&device, 1);
    drain(&manager);

    device.pause();
    for _ in 0..31 {
        increment_push(&manager, ChannelType::Memops, sem.gpu_va());
    }
    assert_eq!(sem.read_u32(0).unwrap(), 0);

    let done = AtomicBool::new(false);
    thread::scope(|s| {
        let waiter = s.spawn(|| {
            increment_push(&manager, ChannelType::Memops, sem.gpu_va());
            done.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        device.resume();
        waiter.join().unwrap();
    });

    manager.wait().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(sem.read_u32(0).unwrap(), 32);
}

#[test]
fn test_concurrent_pushes() {
    let (device, manager) = manager(SimConfig::new(0));
    let sems: Vec<SimMemory> = (0..4).map(|_| sysmem(&device, 1)).collect();

    thread::scope(|s| {
        for sem in &sems {
            let manager = &manager;
            s.spawn(move || {
                for _ in 0..256 {
                    increment_push(manager, ChannelType::GpuInternal, sem.gpu_va());
                }
            });
        }
    });

    manager.wait().unwrap();
    for sem in &sems {
        assert_eq!(sem.read_u32(0).unwrap(), 256);
    }
}

#[test]
fn test_completion_callbacks_run_in_order() {
    let (device, manager) = manager(SimConfig::new(0));
    let sem = sysmem(&device, 1);
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..20 {
        let mut push = manager.push_begin(ChannelType::CpuToGpu, "callback").unwrap();
        push.ce().semaphore_reduction_inc(&mut push, sem.gpu_va(), u32::MAX).unwrap();
        let order = order.clone();
        push.on_complete(move || order.lock().unwrap().push(i));
        push.end().unwrap();
    }

    drain(&manager);
    let order = order.lock().unwrap();
    assert_eq!(order.len(), 20);
    assert!(order.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_push_size_limits() {
    let (_device, manager) = manager(SimConfig::new(0));
    drain(&manager);
    let max = MAX_PUSH_SIZE.as_bytes() as u32;

    let mut reservation = manager.reserve(ChannelType::GpuInternal).unwrap();
    let channel = reservation.channel();
    assert!(matches!(
        reservation.begin_push_sized(max + 4, "too large"),
        Err(Error::PushTooLarge)
    ));
    drop(reservation);
    assert_eq!(channel.available_slots(), 31);

    let mut push = manager.push_begin(ChannelType::GpuInternal, "full").unwrap();
    push.host().noop(&mut push, max / 4).unwrap();
    assert_eq!(push.remaining_bytes(), 0);
    assert_eq!(push.emit(&[0]), Err(Error::PushBufferOverflow));
    push.end_and_wait().unwrap();
    assert!(manager.status().is_ok());
}

#[test]
fn test_sized_push_limit() {
    let (_device, manager) = manager(SimConfig::new(0));
    let mut reservation = manager.reserve(ChannelType::Memops).unwrap();
    let mut push = reservation.begin_push_sized(16, "small").unwrap();
    assert_eq!(push.remaining_bytes(), 16);
    push.host().noop(&mut push, 4).unwrap();
    assert_eq!(push.host().noop(&mut push, 1), Err(Error::PushBufferOverflow));
    push.end_and_wait().unwrap();
}

#[test]
fn test_inline_data() {
    let (device, manager) = manager(SimConfig::new(0));
    let mut push = manager.push_begin(ChannelType::GpuToCpu, "inline").unwrap();
    let va = push.inline_data(&[11, 22, 33]).unwrap();
    assert_eq!(device.read_word(va).unwrap(), 11);
    assert_eq!(device.read_word(va.offset(8)).unwrap(), 33);
    push.end_and_wait().unwrap();
}

#[test]
fn test_dropped_push_is_submitted() {
    let (device, manager) = manager(SimConfig::new(0));
    let sem = sysmem(&device, 1);
    let channel = {
        let mut push = manager.push_begin(ChannelType::Memops, "forgotten").unwrap();
        push.ce().semaphore_release(&mut push, sem.gpu_va(), 7).unwrap();
        push.channel()
    };
    channel.wait().unwrap();
    assert_eq!(sem.read_u32(0).unwrap(), 7);
}

#[test]
fn test_control_entry() {
    let (device, manager) = manager(SimConfig::new(0));
    let channel = manager.channels_of(ChannelType::GpuInternal).unwrap()[0];
    let before = channel.queued();

    channel.write_control_entry(device.host_hal().gpfifo_noop_entry()).unwrap();
    assert_eq!(channel.queued(), before + 1);
    channel.wait().unwrap();
    assert_eq!(channel.ring_stats().control, 1);

    drain(&manager);
    assert_eq!(channel.available_slots(), 31);
}

#[test]
fn test_peer_copy_engine_override() {
    let (_device, manager) = manager(SimConfig::new(0));
    let peer = GpuId(7);

    let default = manager.reserve_peer(peer).unwrap();
    assert!(default.channel().name().starts_with("CE3"));
    drop(default);

    manager.set_p2p_ce(peer, 2).unwrap();
    let routed = manager.reserve_peer(peer).unwrap();
    assert!(routed.channel().name().starts_with("CE2"));
    drop(routed);

    // GRCE is never usable
    assert_eq!(manager.set_p2p_ce(peer, 0), Err(Error::InvalidParameter));

    manager.clear_p2p_ce(peer);
    assert!(manager.reserve_peer(peer).unwrap().channel().name().starts_with("CE3"));
}

// =============================================================================
// Faults
// =============================================================================

#[test]
fn test_channel_error_is_fatal() {
    let (device, manager) = manager(SimConfig::new(0));
    let channel = manager.channels_of(ChannelType::Memops).unwrap()[0];

    device
        .inject_channel_error(channel.queue_info().hw_channel_id, NOTIFIER_METHOD_FAULT)
        .unwrap();
    assert_eq!(channel.get_status(), Err(Error::ChannelError));
    assert_eq!(manager.check_errors(), Err(Error::ChannelError));
    assert_eq!(manager.fatal_error(), Some(Error::ChannelError));
    assert!(matches!(manager.reserve(ChannelType::CpuToGpu), Err(Error::ChannelError)));
    assert!(matches!(
        manager.push_begin(ChannelType::GpuToCpu, "after fault"),
        Err(Error::ChannelError)
    ));
}

#[test]
fn test_ecc_error_is_fatal() {
    let (device, manager) = manager(SimConfig::new(0));
    device.set_ecc_error(true);
    assert_eq!(manager.check_errors(), Err(Error::EccError));
    assert_eq!(manager.fatal_error(), Some(Error::EccError));

    assert_eq!(manager.clear_fatal_error(), Some(Error::EccError));
    device.set_ecc_error(false);
    assert!(manager.check_errors().is_ok());
}

#[test]
fn test_completion_beyond_queued_is_fatal() {
    let (device, manager) = manager(SimConfig::new(0));
    drain(&manager);
    let channel = manager.channels_of(ChannelType::Memops).unwrap()[0];

    let bogus = channel.queued() as u32 + 5;
    device.write_word(channel.tracking_gpu_va(), bogus).unwrap();
    assert_eq!(channel.update_progress(), Err(Error::CompletionOverrun));
    assert_eq!(manager.fatal_error(), Some(Error::CompletionOverrun));
    assert_eq!(manager.wait(), Err(Error::CompletionOverrun));
    assert!(matches!(manager.reserve(ChannelType::Memops), Err(Error::CompletionOverrun)));
}

#[test]
fn test_semaphore_jump_is_fatal() {
    let (device, manager) = manager(SimConfig::new(0));
    drain(&manager);
    let channel = manager.channels_of(ChannelType::CpuToGpu).unwrap()[0];

    device.write_word(channel.tracking_gpu_va(), 1 << 20).unwrap();
    assert_eq!(manager.update_progress(), Err(Error::SemaphoreJump));
    assert_eq!(manager.status(), Err(Error::SemaphoreJump));
}

#[test]
fn test_blocked_reserve_detects_channel_error() {
    let config = test_config().with_channels_per_pool(1);
    let (device, manager) = manager_with(SimConfig::new(0), config);
    let sem = sysmem(&device, 1);
    drain(&manager);

    device.pause();
    for _ in 0..31 {
        increment_push(&manager, ChannelType::Memops, sem.gpu_va());
    }
    let channel = manager.channels_of(ChannelType::Memops).unwrap()[0];
    assert_eq!(channel.available_slots(), 0);
    device
        .inject_channel_error(channel.queue_info().hw_channel_id, NOTIFIER_METHOD_FAULT)
        .unwrap();

    assert!(matches!(manager.reserve(ChannelType::Memops), Err(Error::ChannelError)));
    assert_eq!(manager.fatal_error(), Some(Error::ChannelError));
}

#[test]
fn test_waits_fail_after_fatal_error() {
    let (device, manager) = manager(SimConfig::new(0));
    drain(&manager);
    let channel = manager.channels_of(ChannelType::GpuInternal).unwrap()[0];

    device.set_ecc_error(true);
    assert_eq!(manager.check_errors(), Err(Error::EccError));
    device.set_ecc_error(false);

    // Everything queued is complete, the stored error still wins
    assert!(channel.is_value_completed(channel.queued()));
    assert_eq!(manager.wait(), Err(Error::EccError));
    assert_eq!(channel.wait(), Err(Error::EccError));
    assert_eq!(channel.wait_for(0), Err(Error::EccError));
}

#[test]
fn test_is_value_completed_reads_semaphore() {
    let (device, manager) = manager(SimConfig::new(0));
    let sem = sysmem(&device, 1);
    drain(&manager);

    device.pause();
    let mut push = manager.push_begin(ChannelType::Memops, "late").unwrap();
    push.ce().semaphore_release(&mut push, sem.gpu_va(), 5).unwrap();
    let channel = push.channel();
    let value = push.end().unwrap();
    assert!(!channel.is_value_completed(value));

    device.resume();
    assert_eq!(sem.read_u32(0).unwrap(), 5);
    assert!(channel.completed() < value);
    assert!(channel.is_value_completed(value));
    assert_eq!(channel.completed(), value);
    assert!(manager.status().is_ok());
}

#[test]
fn test_failed_control_entry_returns_slots() {
    let (device, manager) = manager(SimConfig::new(0));
    drain(&manager);
    let channel = manager.channels_of(ChannelType::GpuInternal).unwrap()[0];
    assert_eq!(channel.available_slots(), 31);

    device
        .set_queue_write_fault(channel.queue_info().hw_channel_id, true)
        .unwrap();
    assert_eq!(
        channel.write_control_entry(device.host_hal().gpfifo_noop_entry()),
        Err(Error::ChannelError)
    );
    assert_eq!(manager.fatal_error(), Some(Error::ChannelError));

    // Only the committed control entry still holds a slot
    assert_eq!(channel.ring_stats().control, 1);
    assert_eq!(channel.available_slots(), 30);
}

#[test]
fn test_teardown_returns_tracking_slots() {
    let (_device, mut manager) = manager(SimConfig::new(0));
    let channels = manager.channels().count() as u64;
    drain(&manager);

    manager.teardown();
    assert!(manager.pools().is_empty());
    let stats = manager.shared.plain_sems.stats();
    assert_eq!(stats.allocs, channels);
    assert_eq!(stats.frees, channels);

    // Dropping after an explicit teardown is a no-op
    drop(manager);
}

// =============================================================================
// Proxy channels
// =============================================================================

#[test]
fn test_memops_through_proxy() {
    let (device, manager) = manager(SimConfig::virtualized(0));
    let sem = sysmem(&device, 1);

    let memops = manager.channels_of(ChannelType::Memops).unwrap();
    assert_eq!(memops.len(), 1);
    assert_eq!(memops[0].pool_type(), PoolType::CeProxy);

    let mut push = manager.push_begin(ChannelType::Memops, "proxied").unwrap();
    push.ce().semaphore_release(&mut push, sem.gpu_va(), 9).unwrap();
    push.end_and_wait().unwrap();
    assert_eq!(sem.read_u32(0).unwrap(), 9);

    assert_eq!(
        memops[0].write_control_entry(device.host_hal().gpfifo_noop_entry()),
        Err(Error::NotSupported)
    );

    // Other types still use regular channels
    let copies = manager.channels_of(ChannelType::CpuToGpu).unwrap();
    assert_eq!(copies[0].pool_type(), PoolType::Ce);
}

// =============================================================================
// Confidential computing
// =============================================================================

#[test]
fn test_secure_bring_up() {
    let (_device, manager) = manager(SimConfig::confidential(0));
    assert!(manager.is_secure());
    assert!(manager.is_secure_launch_ready());

    let types: Vec<PoolType> = manager.pools().iter().map(|p| p.pool_type()).collect();
    assert_eq!(
        types,
        [PoolType::Ce, PoolType::Ce, PoolType::Ce, PoolType::Sec2, PoolType::Wlc, PoolType::Lcic]
    );
    assert!(manager.pools().iter().all(|p| p.is_secure()));

    // Schedules and CE init pushes went through SEC2
    assert!(manager.crypto_stats(PoolType::Sec2).encrypted_bytes > 0);
    assert!(manager.crypto_stats(PoolType::Ce).encrypted_bytes > 0);
    assert_eq!(manager.crypto_stats(PoolType::Lcic), CryptoStatsSnapshot::default());

    for channel in manager.channels_of(ChannelType::GpuInternal).unwrap() {
        assert_eq!(channel.completed(), channel.queued());
        assert!(channel.channel().tracking().is_secure());
    }
    for channel in manager.channels_of(ChannelType::Lcic).unwrap() {
        assert_eq!(channel.queued(), 0);
    }
}

#[test]
fn test_secure_pushes_launch_through_wlc() {
    let (device, manager) = manager(SimConfig::confidential(0));
    let sem = sysmem(&device, 1);
    let wlc_before = manager.crypto_stats(PoolType::Wlc);
    let ce_before = manager.crypto_stats(PoolType::Ce);

    for value in 1..=64 {
        chained_push(&manager, ChannelType::CpuToGpu, sem.gpu_va(), value);
    }
    manager.wait().unwrap();
    assert_eq!(sem.read_u32(0).unwrap(), 64);
    assert!(manager.status().is_ok());

    let wlc = manager.crypto_stats(PoolType::Wlc);
    let ce = manager.crypto_stats(PoolType::Ce);
    assert_eq!(
        wlc.encrypted_bytes - wlc_before.encrypted_bytes,
        64 * (crate::secure::RECORD_WORDS as u64 * 4)
    );
    assert!(wlc.decrypted_bytes > wlc_before.decrypted_bytes);
    assert!(ce.encrypted_bytes > ce_before.encrypted_bytes);
    assert!(ce.decrypted_bytes > ce_before.decrypted_bytes);

    let launchers = manager.channels_of(ChannelType::Wlc).unwrap();
    let launched: u64 = launchers.iter().map(|c| c.queued()).sum();
    assert_eq!(launched, 64);
    for launcher in launchers {
        assert_eq!(launcher.completed(), launcher.queued());
    }
}

#[test]
fn test_secure_pushes_from_many_threads() {
    let (device, manager) = manager(SimConfig::confidential(0));
    let channels = manager.config().channels_per_pool as usize;
    let sems: Vec<SimMemory> = (0..channels + 1).map(|_| sysmem(&device, 1)).collect();

    thread::scope(|s| {
        for sem in &sems {
            let manager = &manager;
            s.spawn(move || {
                for _ in 0..32 {
                    increment_push(manager, ChannelType::GpuInternal, sem.gpu_va());
                }
            });
        }
    });

    manager.wait().unwrap();
    for sem in &sems {
        assert_eq!(sem.read_u32(0).unwrap(), 32);
    }
    assert!(manager.status().is_ok());
}

#[test]
fn test_secure_pushes_lock_their_channel() {
    let (device, manager) = manager(SimConfig::confidential(0));
    let sem = sysmem(&device, 1);
    assert_eq!(manager.config().channels_per_pool, 2);

    let mut first = manager.push_begin(ChannelType::GpuInternal, "first").unwrap();
    let second = manager.push_begin(ChannelType::GpuInternal, "second").unwrap();
    assert_ne!(first.channel().id(), second.channel().id());

    let done = AtomicBool::new(false);
    thread::scope(|s| {
        let third = s.spawn(|| {
            increment_push(&manager, ChannelType::GpuInternal, sem.gpu_va());
            done.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        first.ce().semaphore_reduction_inc(&mut first, sem.gpu_va(), u32::MAX).unwrap();
        first.end().unwrap();
        third.join().unwrap();
    });
    second.end().unwrap();

    manager.wait().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(sem.read_u32(0).unwrap(), 2);
}

#[test]
fn test_secure_sec2_push() {
    let (device, manager) = manager(SimConfig::confidential(0));
    let sem = sysmem(&device, 1);

    let mut push = manager.push_begin(ChannelType::Sec2, "sec2 release").unwrap();
    push.sec2().semaphore_release(&mut push, sem.gpu_va(), 42).unwrap();
    push.end_and_wait().unwrap();
    assert_eq!(sem.read_u32(0).unwrap(), 42);
}

#[test]
fn test_secure_rejects_control_entries() {
    let (device, manager) = manager(SimConfig::confidential(0));
    let channel = manager.channels_of(ChannelType::Memops).unwrap()[0];
    assert_eq!(
        channel.write_control_entry(device.host_hal().gpfifo_noop_entry()),
        Err(Error::NotSupported)
    );
    assert!(matches!(
        manager.reserve_count(ChannelType::Memops, 2),
        Err(Error::InvalidParameter)
    ));
}

#[test]
fn test_forced_key_rotation() {
    let (device, manager) = manager(SimConfig::confidential(0));
    let sem = sysmem(&device, 1);
    for value in 1..=8 {
        chained_push(&manager, ChannelType::Memops, sem.gpu_va(), value);
    }

    let ce_pools = manager.pools().iter().filter(|p| p.pool_type() == PoolType::Ce).count() as u64;
    manager.rotate_keys(PoolType::Ce).unwrap();
    manager.rotate_keys(PoolType::Wlc).unwrap();
    manager.rotate_keys(PoolType::Lcic).unwrap();
    manager.rotate_keys(PoolType::Sec2).unwrap();
    assert_eq!(manager.crypto_stats(PoolType::Ce).rotations, ce_pools);
    assert_eq!(manager.crypto_stats(PoolType::Wlc).rotations, 1);
    assert_eq!(manager.crypto_stats(PoolType::Lcic).rotations, 1);
    assert_eq!(manager.rotate_keys(PoolType::CeProxy), Err(Error::NotSupported));

    // Traffic keeps flowing under the new keys
    for value in 9..=16 {
        chained_push(&manager, ChannelType::Memops, sem.gpu_va(), value);
    }
    manager.wait().unwrap();
    assert_eq!(sem.read_u32(0).unwrap(), 16);
    assert!(manager.status().is_ok());

    let lcic = manager.crypto_stats(PoolType::Lcic);
    assert_eq!(lcic.encrypted_bytes + lcic.decrypted_bytes, 0);
}

#[test]
fn test_automatic_key_rotation() {
    let config = test_config().with_key_rotation_threshold(ByteSize::from_kib(4));
    let (device, manager) = manager_with(SimConfig::confidential(0), config);
    let sem = sysmem(&device, 1);

    let mut last = CryptoStatsSnapshot::default();
    for value in 1..=64 {
        chained_push(&manager, ChannelType::GpuToCpu, sem.gpu_va(), value);
        let wlc = manager.crypto_stats(PoolType::Wlc);
        assert!(wlc.total_bytes() > last.total_bytes());
        last = wlc;
    }
    manager.wait().unwrap();
    assert_eq!(sem.read_u32(0).unwrap(), 64);

    assert!(manager.crypto_stats(PoolType::Wlc).rotations >= 1);
    assert!(manager.crypto_stats(PoolType::Ce).rotations >= 1);
    assert_eq!(manager.crypto_stats(PoolType::Lcic).rotations, 0);
    assert!(manager.status().is_ok());
}

#[test]
fn test_tampered_tracking_is_fatal() {
    let (device, manager) = manager(SimConfig::confidential(0));
    let sem = sysmem(&device, 1);

    let mut push = manager.push_begin(ChannelType::GpuInternal, "tampered").unwrap();
    push.ce().semaphore_release(&mut push, sem.gpu_va(), 1).unwrap();
    let channel = push.channel();
    let tracking = channel.channel().tracking();
    let notifier = tracking.notifier_va().unwrap();
    let before = device.read_word(notifier).unwrap();
    push.end().unwrap();

    // Published but not yet read back
    while device.read_word(notifier).unwrap() != before.wrapping_add(2) {
        thread::yield_now();
    }
    let trailer = tracking.trailer_va().unwrap();
    let tag = trailer.offset(4 * 3);
    let word = device.read_word(tag).unwrap();
    device.write_word(tag, word ^ 1).unwrap();

    assert_eq!(channel.update_progress(), Err(Error::IntegrityFailure));
    assert_eq!(manager.fatal_error(), Some(Error::IntegrityFailure));
}

#[test]
fn test_secure_payload_is_protected() {
    let (device, manager) = manager(SimConfig::confidential(0));
    let channel = manager.channels_of(ChannelType::CpuToGpu).unwrap()[0];
    assert!(device.is_protected(channel.tracking_gpu_va()).unwrap());
    let mirror = channel.channel().tracking().mirror_va().unwrap();
    assert!(!device.is_protected(mirror).unwrap());

    let sec2 = manager.channels_of(ChannelType::Sec2).unwrap()[0];
    assert!(!device.is_protected(sec2.tracking_gpu_va()).unwrap());
}

#[test]
fn test_teardown_after_fault() {
    let (device, manager) = manager(SimConfig::confidential(0));
    let sem = sysmem(&device, 1);
    device.pause();
    let mut push = manager.push_begin(ChannelType::CpuToGpu, "stuck").unwrap();
    push.ce().semaphore_release(&mut push, sem.gpu_va(), 1).unwrap();
    let channel = push.channel();
    push.end().unwrap();

    device
        .inject_channel_error(channel.queue_info().hw_channel_id, NOTIFIER_METHOD_FAULT)
        .unwrap();
    assert_eq!(channel.check_errors(), Err(Error::ChannelError));
    drop(manager);
    assert_eq!(sem.read_u32(0).unwrap(), 0);
}
