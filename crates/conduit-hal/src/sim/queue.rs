//! Simulated hardware queues and the method executor.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use conduit_core::{ByteSize, Error, GpuAddr, Result};

use super::crypto::KeyCtx;
use super::memory::SimMemory;
use super::methods::*;
use super::SimGpu;
use crate::crypto::{CryptoTrailer, TRAILER_WORDS};
use crate::device::{DeviceMemory, EngineType, HwQueue, QueueGroup, QueueInfo};
use crate::methods::AcquireMode;

/// Error notifier value for a faulting method
pub const NOTIFIER_METHOD_FAULT: u32 = 0x1f;
/// Error notifier value for a failed decrypt
pub const NOTIFIER_INTEGRITY_FAULT: u32 = 0x2e;

const MAX_CALL_DEPTH: usize = 4;

/// Simulated queue group
#[derive(Debug)]
pub struct SimQueueGroup {
    pub(crate) engine: EngineType,
    pub(crate) index: u32,
}

impl QueueGroup for SimQueueGroup {
    fn engine(&self) -> EngineType {
        self.engine
    }

    fn engine_index(&self) -> u32 {
        self.index
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    va: GpuAddr,
    len: u32,
    pc: u32,
}

#[derive(Debug, Default)]
struct ExecState {
    get: u32,
    frames: Vec<Frame>,
}

enum Step {
    Done,
    Stalled,
}

struct ProxyState {
    put: u32,
    streams: Vec<Option<SimMemory>>,
}

pub(crate) struct QueueState {
    pub(crate) info: QueueInfo,
    secure: bool,
    proxy: bool,
    gpfifo: SimMemory,
    gpput: SimMemory,
    pub(crate) keys: Option<Arc<KeyCtx>>,
    gpu: Arc<SimGpu>,
    exec: spin::Mutex<ExecState>,
    proxy_state: spin::Mutex<ProxyState>,
    pending: AtomicBool,
    pub(crate) stalled: AtomicBool,
    /// CPU writes of GPFIFO and GPPUT fail while set
    pub(crate) write_fault: AtomicBool,
    error: AtomicU32,
}

impl QueueState {
    pub(crate) fn new(
        info: QueueInfo,
        secure: bool,
        proxy: bool,
        gpfifo: SimMemory,
        gpput: SimMemory,
        keys: Option<Arc<KeyCtx>>,
        gpu: Arc<SimGpu>,
    ) -> Self {
        let streams = (0..info.num_gpfifo_entries).map(|_| None).collect();
        Self {
            info,
            secure,
            proxy,
            gpfifo,
            gpput,
            keys,
            gpu,
            exec: spin::Mutex::new(ExecState::default()),
            proxy_state: spin::Mutex::new(ProxyState { put: 0, streams }),
            pending: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            write_fault: AtomicBool::new(false),
            error: AtomicU32::new(0),
        }
    }

    pub(crate) fn set_error(&self, code: u32) {
        // First error sticks
        let _ = self
            .error
            .compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn has_pending_kick(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Ask the host to process the queue
    ///
    /// Only one thread executes a queue at a time; a kick that finds the
    /// queue busy leaves a note the executing thread picks up.
    pub(crate) fn kick(&self) {
        loop {
            self.pending.store(true, Ordering::SeqCst);
            if self.gpu.is_paused() {
                return;
            }
            let Some(mut exec) = self.exec.try_lock() else {
                return;
            };
            let mut progressed = false;
            while self.pending.swap(false, Ordering::SeqCst) {
                if self.gpu.is_paused() {
                    self.pending.store(true, Ordering::SeqCst);
                    break;
                }
                progressed |= self.run(&mut exec);
            }
            drop(exec);

            if progressed {
                self.gpu.kick_stalled(self.info.hw_channel_id);
            }
            if !self.pending.load(Ordering::SeqCst) || self.gpu.is_paused() {
                return;
            }
        }
    }

    fn entries(&self) -> u32 {
        self.info.num_gpfifo_entries
    }

    fn read_gp_entry(&self, index: u32) -> u64 {
        let words = self.gpfifo.raw_words();
        let lo = words[index as usize * 2].load(Ordering::Acquire) as u64;
        let hi = words[index as usize * 2 + 1].load(Ordering::Acquire) as u64;
        (hi << 32) | lo
    }

    fn run(&self, exec: &mut ExecState) -> bool {
        if self.error.load(Ordering::Acquire) != 0 {
            return false;
        }

        // GPPUT is latched once per kick
        let put = self.gpput.raw_words()[0].load(Ordering::Acquire) % self.entries();
        let mut progressed = false;

        while exec.get != put || !exec.frames.is_empty() {
            if exec.frames.is_empty() {
                let (va, len) = decode_gp_entry(self.read_gp_entry(exec.get));
                if len == 0 {
                    exec.get = (exec.get + 1) % self.entries();
                    progressed = true;
                    continue;
                }
                exec.frames.push(Frame { va, len, pc: 0 });
            }

            match self.execute(exec, &mut progressed) {
                Ok(Step::Done) => {
                    if self.proxy {
                        self.proxy_state.lock().streams[exec.get as usize] = None;
                    }
                    exec.get = (exec.get + 1) % self.entries();
                }
                Ok(Step::Stalled) => {
                    self.stalled.store(true, Ordering::Release);
                    return progressed;
                }
                Err(e) => {
                    log::warn!(
                        "sim: channel {} faulted: {}",
                        self.info.hw_channel_id,
                        e
                    );
                    exec.frames.clear();
                    let code = match e {
                        Error::IntegrityFailure => NOTIFIER_INTEGRITY_FAULT,
                        _ => NOTIFIER_METHOD_FAULT,
                    };
                    self.set_error(code);
                    return progressed;
                }
            }
        }

        self.stalled.store(false, Ordering::Release);
        progressed
    }

    fn execute(&self, exec: &mut ExecState, progressed: &mut bool) -> Result<Step> {
        let space = &self.gpu.space;
        loop {
            let Some(frame) = exec.frames.last().copied() else {
                return Ok(Step::Done);
            };
            if frame.pc >= frame.len {
                exec.frames.pop();
                continue;
            }

            let (op, nargs) = decode_header(space.read(frame.va + frame.pc as u64 * 4)?);
            if frame.pc + 1 + nargs > frame.len {
                return Err(Error::InvalidParameter);
            }
            let next_pc = frame.pc + 1 + nargs;
            let args = if op == OP_NOP || nargs == 0 {
                Vec::new()
            } else {
                space.read_block(frame.va + (frame.pc as u64 + 1) * 4, nargs as usize)?
            };
            let arg = |i: usize| args.get(i).copied().ok_or(Error::InvalidParameter);
            let addr = |i: usize| -> Result<GpuAddr> { Ok(GpuAddr::from_parts(arg(i)?, arg(i + 1)?)) };

            match op {
                OP_NOP | OP_INIT => {}
                OP_SEM_RELEASE => space.write(addr(0)?, arg(2)?)?,
                OP_SEM_ACQUIRE => {
                    let value = space.read(addr(0)?)?;
                    let payload = arg(2)?;
                    let satisfied = if arg(3)? == AcquireMode::Eq as u32 {
                        value == payload
                    } else {
                        value.wrapping_sub(payload) as i32 >= 0
                    };
                    if !satisfied {
                        return Ok(Step::Stalled);
                    }
                }
                OP_SEM_INC => {
                    let (words, offset) = space.resolve(addr(0)?, 1)?;
                    let wrap = arg(2)?;
                    let _ = words[offset].fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                        Some(if v >= wrap { 0 } else { v + 1 })
                    });
                }
                OP_MEMSET => {
                    let count = (arg(3)? / 4) as usize;
                    let (words, offset) = space.resolve(addr(0)?, count)?;
                    for word in &words[offset..offset + count] {
                        word.store(arg(2)?, Ordering::Release);
                    }
                }
                OP_MEMCOPY => {
                    let count = (arg(4)? / 4) as usize;
                    let data = space.read_block(addr(2)?, count)?;
                    space.write_block(addr(0)?, &data)?;
                }
                OP_ENCRYPT => {
                    let keys = self.keys.as_ref().ok_or(Error::NotSupported)?;
                    let count = (arg(4)? / 4) as usize;
                    let mut data = space.read_block(addr(2)?, count)?;
                    let trailer = keys.device_encrypt(&mut data);
                    space.write_block(addr(0)?, &data)?;
                    space.write_block(addr(5)?, trailer.as_words())?;
                }
                OP_DECRYPT => {
                    let keys = self.keys.as_ref().ok_or(Error::NotSupported)?;
                    let count = (arg(4)? / 4) as usize;
                    let mut data = space.read_block(addr(2)?, count)?;
                    let raw = space.read_block(addr(5)?, TRAILER_WORDS)?;
                    let mut trailer_words = [0u32; TRAILER_WORDS];
                    trailer_words.copy_from_slice(&raw);
                    keys.device_decrypt(&mut data, &CryptoTrailer::from_words(&trailer_words))?;
                    space.write_block(addr(0)?, &data)?;
                }
                OP_DOORBELL => self.gpu.ring_doorbell(arg(0)?),
                OP_CALL => {
                    if exec.frames.len() >= MAX_CALL_DEPTH {
                        return Err(Error::InvalidParameter);
                    }
                    if let Some(top) = exec.frames.last_mut() {
                        top.pc = next_pc;
                    }
                    exec.frames.push(Frame {
                        va: addr(0)?,
                        len: arg(2)? / 4,
                        pc: 0,
                    });
                    *progressed = true;
                    continue;
                }
                _ => return Err(Error::InvalidParameter),
            }

            *progressed = true;
            if let Some(top) = exec.frames.last_mut() {
                top.pc = next_pc;
            }
        }
    }
}

/// Simulated hardware queue
#[derive(Clone)]
pub struct SimQueue {
    pub(crate) state: Arc<QueueState>,
}

impl core::fmt::Debug for SimQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimQueue")
            .field("info", &self.state.info)
            .field("secure", &self.state.secure)
            .finish()
    }
}

impl HwQueue for SimQueue {
    fn info(&self) -> &QueueInfo {
        &self.state.info
    }

    fn write_gpfifo_entry(&self, index: u32, entry: u64) -> Result<()> {
        if self.state.secure || self.state.write_fault.load(Ordering::Acquire) {
            return Err(Error::AccessDenied);
        }
        if index >= self.state.info.num_gpfifo_entries {
            return Err(Error::InvalidParameter);
        }
        let words = self.state.gpfifo.raw_words();
        words[index as usize * 2].store(entry as u32, Ordering::Release);
        words[index as usize * 2 + 1].store((entry >> 32) as u32, Ordering::Release);
        Ok(())
    }

    fn write_gpu_put(&self, put: u32) -> Result<()> {
        if self.state.secure || self.state.write_fault.load(Ordering::Acquire) {
            return Err(Error::AccessDenied);
        }
        self.state.gpput.raw_words()[0].store(put, Ordering::Release);
        Ok(())
    }

    fn ring_doorbell(&self) {
        self.state.kick();
    }

    fn error_notifier(&self) -> u32 {
        self.state.error.load(Ordering::Acquire)
    }

    fn push_stream(&self, words: &[u32]) -> Result<()> {
        if !self.state.proxy {
            return Err(Error::NotSupported);
        }
        let mem = self
            .state
            .gpu
            .space
            .alloc(ByteSize::from_bytes(words.len() as u64 * 4), false)?;
        let cpu = mem.cpu_words().ok_or(Error::AccessDenied)?;
        for (slot, word) in cpu.iter().zip(words) {
            slot.store(*word, Ordering::Relaxed);
        }
        let entry = encode_gp_entry(mem.gpu_va(), words.len() as u32);

        {
            let mut proxy = self.state.proxy_state.lock();
            let put = proxy.put;
            let gp = self.state.gpfifo.raw_words();
            gp[put as usize * 2].store(entry as u32, Ordering::Release);
            gp[put as usize * 2 + 1].store((entry >> 32) as u32, Ordering::Release);
            proxy.streams[put as usize] = Some(mem);
            proxy.put = (put + 1) % self.state.info.num_gpfifo_entries;
            self.state.gpput.raw_words()[0].store(proxy.put, Ordering::Release);
        }
        self.state.kick();
        Ok(())
    }
}
