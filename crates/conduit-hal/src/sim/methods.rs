//! Simulated engine opcodes.
//!
//! Every method is a header word `(opcode << 24) | arg_count` followed by
//! its arguments. Addresses take two arguments, low word first. All three
//! engines share one encoding.

use conduit_core::{Error, GpuAddr, Result};

use crate::methods::{AcquireMode, CeHal, HostHal, MethodSink, Sec2Hal};

pub(crate) const OP_NOP: u32 = 0;
pub(crate) const OP_SEM_RELEASE: u32 = 1;
pub(crate) const OP_SEM_ACQUIRE: u32 = 2;
pub(crate) const OP_SEM_INC: u32 = 3;
pub(crate) const OP_MEMSET: u32 = 4;
pub(crate) const OP_MEMCOPY: u32 = 5;
pub(crate) const OP_ENCRYPT: u32 = 6;
pub(crate) const OP_DECRYPT: u32 = 7;
pub(crate) const OP_DOORBELL: u32 = 8;
pub(crate) const OP_CALL: u32 = 9;
pub(crate) const OP_INIT: u32 = 10;

const ARG_MASK: u32 = 0x00ff_ffff;
const GP_VA_MASK: u64 = (1 << 38) - 1;
const GP_LEN_SHIFT: u32 = 40;

pub(crate) const fn header(op: u32, args: u32) -> u32 {
    (op << 24) | (args & ARG_MASK)
}

pub(crate) const fn decode_header(word: u32) -> (u32, u32) {
    (word >> 24, word & ARG_MASK)
}

pub(crate) const fn encode_gp_entry(va: GpuAddr, words: u32) -> u64 {
    ((va.raw() >> 2) & GP_VA_MASK) | ((words as u64) << GP_LEN_SHIFT)
}

/// `(stream address, stream length in words)`; zero length means no-op
pub(crate) const fn decode_gp_entry(entry: u64) -> (GpuAddr, u32) {
    (
        GpuAddr::new((entry & GP_VA_MASK) << 2),
        (entry >> GP_LEN_SHIFT) as u32,
    )
}

fn emit_op(sink: &mut dyn MethodSink, op: u32, args: &[u32]) -> Result<()> {
    sink.emit(&[header(op, args.len() as u32)])?;
    sink.emit(args)
}

fn check_bytes(bytes: u32) -> Result<()> {
    if bytes == 0 || bytes % 4 != 0 {
        return Err(Error::InvalidParameter);
    }
    Ok(())
}

fn crypt(
    sink: &mut dyn MethodSink,
    op: u32,
    dst: GpuAddr,
    src: GpuAddr,
    bytes: u32,
    trailer: GpuAddr,
) -> Result<()> {
    check_bytes(bytes)?;
    emit_op(
        sink,
        op,
        &[dst.lo(), dst.hi(), src.lo(), src.hi(), bytes, trailer.lo(), trailer.hi()],
    )
}

/// Host method encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct SimHost;

impl HostHal for SimHost {
    fn init(&self, sink: &mut dyn MethodSink) -> Result<()> {
        emit_op(sink, OP_INIT, &[0])
    }

    fn noop(&self, sink: &mut dyn MethodSink, words: u32) -> Result<()> {
        if words == 0 {
            return Ok(());
        }
        sink.emit(&[header(OP_NOP, words - 1)])?;
        for _ in 1..words {
            sink.emit(&[0])?;
        }
        Ok(())
    }

    fn semaphore_acquire(
        &self,
        sink: &mut dyn MethodSink,
        va: GpuAddr,
        payload: u32,
        mode: AcquireMode,
    ) -> Result<()> {
        emit_op(sink, OP_SEM_ACQUIRE, &[va.lo(), va.hi(), payload, mode as u32])
    }

    fn semaphore_release(&self, sink: &mut dyn MethodSink, va: GpuAddr, payload: u32) -> Result<()> {
        emit_op(sink, OP_SEM_RELEASE, &[va.lo(), va.hi(), payload])
    }

    fn doorbell(&self, sink: &mut dyn MethodSink, token: u32) -> Result<()> {
        emit_op(sink, OP_DOORBELL, &[token])
    }

    fn call(&self, sink: &mut dyn MethodSink, va: GpuAddr, bytes: u32) -> Result<()> {
        check_bytes(bytes)?;
        emit_op(sink, OP_CALL, &[va.lo(), va.hi(), bytes])
    }

    fn inline_header_words(&self) -> u32 {
        1
    }

    fn inline_data(&self, sink: &mut dyn MethodSink, data: &[u32]) -> Result<()> {
        emit_op(sink, OP_NOP, data)
    }

    fn gpfifo_entry(&self, va: GpuAddr, bytes: u32) -> u64 {
        encode_gp_entry(va, bytes / 4)
    }

    fn gpfifo_noop_entry(&self) -> u64 {
        0
    }
}

/// Copy engine method encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct SimCe;

impl CeHal for SimCe {
    fn init(&self, sink: &mut dyn MethodSink) -> Result<()> {
        emit_op(sink, OP_INIT, &[1])
    }

    fn semaphore_release(&self, sink: &mut dyn MethodSink, va: GpuAddr, payload: u32) -> Result<()> {
        emit_op(sink, OP_SEM_RELEASE, &[va.lo(), va.hi(), payload])
    }

    fn semaphore_reduction_inc(
        &self,
        sink: &mut dyn MethodSink,
        va: GpuAddr,
        wrap: u32,
    ) -> Result<()> {
        emit_op(sink, OP_SEM_INC, &[va.lo(), va.hi(), wrap])
    }

    fn memset_4(
        &self,
        sink: &mut dyn MethodSink,
        va: GpuAddr,
        value: u32,
        bytes: u32,
    ) -> Result<()> {
        check_bytes(bytes)?;
        emit_op(sink, OP_MEMSET, &[va.lo(), va.hi(), value, bytes])
    }

    fn memcopy(&self, sink: &mut dyn MethodSink, dst: GpuAddr, src: GpuAddr, bytes: u32) -> Result<()> {
        check_bytes(bytes)?;
        emit_op(sink, OP_MEMCOPY, &[dst.lo(), dst.hi(), src.lo(), src.hi(), bytes])
    }

    fn encrypt(
        &self,
        sink: &mut dyn MethodSink,
        dst: GpuAddr,
        src: GpuAddr,
        bytes: u32,
        trailer: GpuAddr,
    ) -> Result<()> {
        crypt(sink, OP_ENCRYPT, dst, src, bytes, trailer)
    }

    fn decrypt(
        &self,
        sink: &mut dyn MethodSink,
        dst: GpuAddr,
        src: GpuAddr,
        bytes: u32,
        trailer: GpuAddr,
    ) -> Result<()> {
        crypt(sink, OP_DECRYPT, dst, src, bytes, trailer)
    }
}

/// Security co-processor method encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct SimSec2;

impl Sec2Hal for SimSec2 {
    fn init(&self, sink: &mut dyn MethodSink) -> Result<()> {
        emit_op(sink, OP_INIT, &[2])
    }

    fn semaphore_release(&self, sink: &mut dyn MethodSink, va: GpuAddr, payload: u32) -> Result<()> {
        emit_op(sink, OP_SEM_RELEASE, &[va.lo(), va.hi(), payload])
    }

    fn decrypt(
        &self,
        sink: &mut dyn MethodSink,
        dst: GpuAddr,
        src: GpuAddr,
        bytes: u32,
        trailer: GpuAddr,
    ) -> Result<()> {
        crypt(sink, OP_DECRYPT, dst, src, bytes, trailer)
    }
}
