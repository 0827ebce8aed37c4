//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements context switching via PendSV and the SysTick clock and tick.
//! Critical sections are PRIMASK-based and come from `cortex-m`'s
//! `critical-section-single-core` backend; this module only uses them.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): Used by the kernel at boot and by interrupt handlers
//! - **PSP** (Process Stack Pointer): Used by tasks in Thread mode
//!
//! On exception entry, the hardware automatically stacks R0–R3, R12, LR, PC,
//! and xPSR onto the process stack. The PendSV handler manually saves and
//! restores R4–R11, which completes the full context save/restore. A task's
//! continuation is therefore just its saved PSP.
//!
//! [`Port::switch`] only records the request and pends PendSV; the swap
//! happens as soon as interrupts are unmasked again.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: Priority 0xFF (lowest)
//! - PendSV: Priority 0xFF (lowest), runs only when no other ISR is active
//!
//! Both are set to the lowest priority so that PendSV never preempts other
//! interrupt handlers.
//!
//! The FPU context is not saved; tasks must not use floating point.

use core::arch::{asm, naked_asm};
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use cortex_m::interrupt;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};
use critical_section::Mutex;

use super::{Continuation, Fault, Port, TickHandler, Trampoline};
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};

const MS_PER_TICK: u32 = 1_000 / TICK_HZ;
const CYCLES_PER_US: u32 = SYSTEM_CLOCK_HZ / 1_000_000;

/// Milliseconds since SysTick was configured.
static MILLIS: AtomicU32 = AtomicU32::new(0);

/// Set once the first task is running on PSP. Ticks before that are only
/// counted, never handed to the kernel.
static LAUNCHED: AtomicBool = AtomicBool::new(false);

static TICK: Mutex<Cell<Option<Ticker>>> = Mutex::new(Cell::new(None));

/// Switch requested by the kernel, consumed by PendSV.
static PENDING: Mutex<Cell<Option<SwitchRequest>>> = Mutex::new(Cell::new(None));

#[derive(Clone, Copy)]
struct Ticker {
    handler: &'static dyn TickHandler,
    interval_ms: u32,
}

#[derive(Clone, Copy)]
struct SwitchRequest {
    from: *mut CortexContext,
    to: *const CortexContext,
}

// SAFETY: both pointers name continuations inside a 'static kernel, and
// the request is only touched inside critical sections.
unsafe impl Send for SwitchRequest {}

// ---------------------------------------------------------------------------
// Continuation
// ---------------------------------------------------------------------------

/// Saved PSP of a suspended task, pointing at its software-saved R4–R11.
#[derive(Debug, Clone, Copy)]
pub struct CortexContext {
    sp: *mut u32,
}

// SAFETY: `sp` points into the task's own stack slice and is only
// dereferenced by PendSV and `launch`.
unsafe impl Send for CortexContext {}

impl Continuation for CortexContext {
    const EMPTY: Self = CortexContext {
        sp: core::ptr::null_mut(),
    };
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// The Cortex-M4 port. Call [`configure`](Self::configure) once before
/// starting the kernel.
pub struct CortexM4 {
    _private: (),
}

impl CortexM4 {
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Configure the SysTick timer for the millisecond clock and set PendSV
    /// and SysTick to the lowest interrupt priority.
    ///
    /// # Parameters
    /// - `syst`: Mutable reference to the SysTick peripheral
    pub fn configure(&self, syst: &mut SYST) {
        let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
        syst.set_reload(reload);
        syst.clear_current();
        syst.set_clock_source(SystClkSource::Core);
        syst.enable_counter();
        syst.enable_interrupt();

        set_interrupt_priorities();
        tracing::debug!(reload, tick_hz = TICK_HZ, "systick configured");
    }
}

impl Default for CortexM4 {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for CortexM4 {
    type Context = CortexContext;

    /// Sixteen words: the hardware-stacked frame plus R4–R11.
    const CONTEXT_OVERHEAD: usize = 16 * 4;

    fn now_ms(&self) -> u32 {
        MILLIS.load(Ordering::Relaxed)
    }

    fn now_us(&self) -> u32 {
        let reload = SYST::get_reload();
        loop {
            let millis = MILLIS.load(Ordering::Relaxed);
            let current = SYST::get_current();
            if MILLIS.load(Ordering::Relaxed) == millis {
                let elapsed = (reload - current.min(reload)) / CYCLES_PER_US;
                return millis.wrapping_mul(1_000).wrapping_add(elapsed);
            }
        }
    }

    fn timer_arm(&'static self, interval_ms: u32, handler: &'static dyn TickHandler) {
        let ticker = Ticker {
            handler,
            interval_ms: interval_ms.max(MS_PER_TICK),
        };
        critical_section::with(|cs| TICK.borrow(cs).set(Some(ticker)));
    }

    fn timer_disarm(&self) {
        critical_section::with(|cs| TICK.borrow(cs).set(None));
    }

    /// Initialize a task's stack frame for its first resume.
    ///
    /// The hardware pops an exception frame on exception return, so we
    /// pre-populate one on the task's stack: the first PendSV "return"
    /// then starts executing `entry(a0, a1)`.
    ///
    /// ## Stack Layout (top = high address, growing down)
    ///
    /// ```text
    /// [Hardware stacked frame]
    ///   xPSR  (Thumb bit set)
    ///   PC    (entry)
    ///   LR    (task_exit)
    ///   R12   (0)
    ///   R3    (0)
    ///   R2    (0)
    ///   R1    (a1)
    ///   R0    (a0)
    /// [Software saved context]
    ///   R11   (0)
    ///   ...
    ///   R4    (0)              <- saved PSP after init
    /// ```
    unsafe fn init_context(
        &'static self,
        ctx: &mut CortexContext,
        stack: &'static mut [u8],
        entry: Trampoline,
        a0: usize,
        a1: usize,
    ) {
        let stack_top = stack.as_mut_ptr() as usize + stack.len();
        // Align to 8 bytes (AAPCS requirement)
        let aligned_top = stack_top & !0x07;
        let frame = (aligned_top - Self::CONTEXT_OVERHEAD) as *mut u32;

        let words: [u32; 16] = [
            0, 0, 0, 0, 0, 0, 0, 0, // R4–R11
            a0 as u32,               // R0
            a1 as u32,               // R1
            0,                       // R2
            0,                       // R3
            0,                       // R12
            task_exit as usize as u32,
            (entry as usize as u32) & !1,
            0x0100_0000,
        ];
        for (offset, word) in words.into_iter().enumerate() {
            // SAFETY: the frame lies inside `stack`, which the caller hands
            // over for good; `CONTEXT_OVERHEAD` reserved room for it.
            unsafe { frame.add(offset).write_volatile(word) };
        }

        ctx.sp = frame;
    }

    unsafe fn switch(&self, from: *mut CortexContext, to: *const CortexContext) {
        critical_section::with(|cs| {
            let pending = PENDING.borrow(cs);
            // A switch that has not happened yet still saves into the task
            // that is physically running.
            let from = pending.get().map_or(from, |request| request.from);
            pending.set(Some(SwitchRequest { from, to }));
        });
        SCB::set_pendsv();
    }

    unsafe fn launch(&'static self, first: *const CortexContext) -> ! {
        interrupt::disable();
        LAUNCHED.store(true, Ordering::Release);
        // SAFETY: `first` was initialized by `init_context`.
        let psp = unsafe { (*first).sp };
        // SAFETY: runs once, in Thread mode on MSP, with a frame built by
        // `init_context`.
        unsafe { start_first_task(psp) }
    }

    fn wait_for_interrupt(&self) {
        cortex_m::asm::wfi();
    }

    fn halt(&self, fault: Fault) -> ! {
        tracing::error!(%fault, "halting");
        interrupt::disable();
        loop {
            cortex_m::asm::wfi();
        }
    }
}

// ---------------------------------------------------------------------------
// Interrupt priority configuration
// ---------------------------------------------------------------------------

/// Set PendSV and SysTick to the lowest interrupt priority.
fn set_interrupt_priorities() {
    // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
    // Bits [23:16] = PendSV priority
    // Bits [31:24] = SysTick priority
    const SHPR3: *mut u32 = 0xE000_ED20 as *mut u32;
    // SAFETY: SHPR3 is an always-present System Control Block register.
    unsafe {
        let val = core::ptr::read_volatile(SHPR3);
        core::ptr::write_volatile(SHPR3, val | (0xFF << 16) | (0xFF << 24));
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to PSP and branch into the first task.
///
/// # Safety
/// Must only be called once, with interrupts disabled and `psp` pointing at
/// a frame built by `init_context`.
unsafe fn start_first_task(psp: *const u32) -> ! {
    unsafe {
        asm!(
            // Set PSP to the task's stack pointer (skip SW-saved R4-R11)
            "adds r0, #32",
            "msr psp, r0",

            // Switch to PSP for Thread mode (set CONTROL.SPSEL = 1)
            "movs r0, #2",
            "msr control, r0",
            "isb",

            // Pop the hardware frame manually since we're not really returning from an exception
            "pop {{r0-r3, r12}}",  // R0-R3, R12 (R0/R1 carry the task arguments)
            "pop {{r4}}",          // LR (discarded, the trampoline never returns)
            "pop {{r5}}",          // PC (task entry point)
            "pop {{r6}}",          // xPSR (discarded)
            "orr r5, r5, #1",      // Thumb bit for bx

            "cpsie i",
            "bx r5",

            in("r0") psp,
            options(noreturn)
        );
    }
}

/// Return target for a task frame. Tasks enter through the trampoline,
/// which never returns.
extern "C" fn task_exit() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler: performs the actual context switch.
///
/// ## Sequence
/// 1. Save R4–R11 onto the current task's stack (PSP)
/// 2. Swap the saved PSP for the next task's (`swap_contexts`)
/// 3. Restore R4–R11 from the new task's stack
/// 4. Return from exception (hardware restores R0–R3, R12, LR, PC, xPSR)
///
/// # Safety
/// Called directly by the NVIC. It must follow the exact Cortex-M4
/// exception entry/exit convention.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",

        // r0 in: saved PSP of the outgoing task; r0 out: PSP to resume
        "bl {swap}",

        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",

        // Return to Thread mode on PSP (EXC_RETURN = 0xFFFFFFFD)
        "ldr r0, =0xFFFFFFFD",
        "bx r0",

        swap = sym swap_contexts,
    );
}

/// Store the outgoing PSP and return the incoming one. Called from PendSV.
///
/// # Safety
/// Called from assembly context, with a pending request built by `switch`.
unsafe extern "C" fn swap_contexts(psp: *mut u32) -> *mut u32 {
    critical_section::with(|cs| match PENDING.borrow(cs).take() {
        // SAFETY: the request points at continuations in the kernel's
        // task table, which is 'static.
        Some(request) => unsafe {
            (*request.from).sp = psp;
            (*request.to).sp
        },
        None => psp,
    })
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// SysTick exception handler: advances the clock and, once the kernel is
/// running, delivers the preemption tick.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    let now = MILLIS
        .fetch_add(MS_PER_TICK, Ordering::Relaxed)
        .wrapping_add(MS_PER_TICK);
    if !LAUNCHED.load(Ordering::Acquire) {
        return;
    }

    let ticker = critical_section::with(|cs| TICK.borrow(cs).get());
    if let Some(ticker) = ticker {
        if now % ticker.interval_ms == 0 {
            ticker.handler.on_tick();
        }
    }
}
