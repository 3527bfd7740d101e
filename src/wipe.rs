//! Multi-pass destruction of secret bytes held in memory.
//!
//! Every secret buffer is destroyed with the same five passes, in this
//! order:
//!
//! 1. all zeros
//! 2. all one bits (0xFF)
//! 3. fresh output of a secure random source
//! 4. all zeros again
//! 5. a byte-at-a-time volatile zero write
//!
//! Passes 1, 2 and 4 go through `ptr::write_volatile` followed by a compiler
//! fence, so none of them can be removed as dead stores even though a later
//! pass overwrites the same bytes. Pass 5 is done by `zeroize`, which writes
//! each byte volatilely and fences afterwards.

#![allow(unsafe_code)]

use core::ptr;
use core::sync::atomic::{Ordering, compiler_fence};

use rand::RngCore;
use tracing::warn;
use zeroize::Zeroize;

/// One pass of the wipe sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipePass {
    Zero,
    Ones,
    Random,
    ZeroAgain,
    VolatileZero,
}

/// The passes in the order `burn` applies them.
pub const PASSES: [WipePass; 5] = [
    WipePass::Zero,
    WipePass::Ones,
    WipePass::Random,
    WipePass::ZeroAgain,
    WipePass::VolatileZero,
];

/// Irreversibly destroys `buf`, drawing the random pass from `rng`.
///
/// Calling this again on an already burned buffer is harmless and leaves it
/// zeroed. If the random source fails, the random pass is skipped with a
/// warning; the remaining passes still run.
#[inline(never)]
pub fn burn(buf: &mut [u8], rng: &mut dyn RngCore) {
    burn_observed(buf, rng, |_, _| {});
}

/// Same as [`burn`], but hands the buffer to `observe` after every pass.
#[inline(never)]
pub(crate) fn burn_observed(
    buf: &mut [u8],
    rng: &mut dyn RngCore,
    mut observe: impl FnMut(WipePass, &[u8]),
) {
    for pass in PASSES {
        match pass {
            WipePass::Zero | WipePass::ZeroAgain => volatile_fill(buf, 0x00),
            WipePass::Ones => volatile_fill(buf, 0xFF),
            WipePass::Random => {
                if let Err(e) = rng.try_fill_bytes(buf) {
                    warn!(error = %e, "random source failed during wipe; skipping random pass");
                }
                compiler_fence(Ordering::SeqCst);
            }
            WipePass::VolatileZero => buf.zeroize(),
        }
        observe(pass, &*buf);
    }
}

#[inline(never)]
fn volatile_fill(buf: &mut [u8], value: u8) {
    for byte in buf.iter_mut() {
        // SAFETY: `byte` is a valid, aligned, exclusive reference into `buf`.
        unsafe { ptr::write_volatile(byte, value) };
    }
    compiler_fence(Ordering::SeqCst);
}
