//! Armv7-M EABIHF code

use crate::pcb::Pcb;
use crate::scheduler::{self, Scheduler};

/// PendSV Handler for Armv7-M or Armv8-M Mainline EABIHF
///
/// This is the task switch code. It is called by hardware when the PendSV
/// bit is set and all other interrupts have finished.
///
/// On entry, we will find that xPSR, PC, LR, R12, R3, R2, R1 and R0 will
/// have been pushed onto the PSP, along with either the low FPU registers
/// or space for them. We push the remaining registers (which are as the
/// running task left them) and inspect the LR we pop back out to see if we
/// also need to (un)stack the high FPU registers, since LR encodes the FPU
/// state of the task whose context this is. Exiting from this function
/// causes the hardware to restore xPSR, PC, LR, R12, R3, R2, R1, and R0
/// from the new task's PSP (along with the low FPU state, if required),
/// and so the new task resumes.
///
/// It is a naked function because we do not want the compiler pushing
/// anything else to the stack and re-using registers containing precious
/// task state.
#[unsafe(no_mangle)]
#[unsafe(naked)]
unsafe extern "C" fn PendSV() {
    // NOTE: This code must NOT touch r4-r11. It can ONLY touch r0-r3 and
    // r12, because those registers were stacked by the hardware on
    // exception entry.

    core::arch::naked_asm!(r#"
    // Workaround https://github.com/rust-lang/rust/issues/127269
    .fpu vfpv3

    // r1 = the address of the Scheduler object
    ldr      r1, ={scheduler_ptr}
    ldr      r1, [r1]

    // r2 = the current task's PCB pointer
    ldr      r2, [r1, {current_offset}]

    // if there is no current task (first switch ever), skip stacking
    cmp      r2, #0
    beq      1f

    //
    // Stack the current task
    //

    // r0 = the current task stack pointer
    mrs      r0, psp

    // Did the task we just interrupted use the FPU? (bit 4 of LR)
    tst      lr, #0x10

    // If the FPU was used, stack the high FPU registers. Armv7-M exception
    // entry already handled the low ones.
    it       eq
    vstmdbeq r0!, {{ s16 - s31 }}

    // Push the additional state into the stack at r0
    stmdb    r0!, {{ r4 - r11, lr }}

    // save the stack pointer (in r0) into the current PCB
    str      r0, [r2, {stack_top_offset}]

    //
    // Pop the next task
    //

    1:

    // r2 = the next task's PCB pointer
    ldr      r2, [r1, {next_offset}]

    // r0 = the stack pointer saved in that PCB
    ldr      r0, [r2, {stack_top_offset}]

    // Pop the additional state from it, including that task's own LR
    ldmia    r0!, {{ r4 - r11, lr }}

    // Did the task we are resuming use the FPU when it was last stacked?
    tst      lr, #0x10

    // If so, unstack the high FPU registers
    it       eq
    vldmiaeq r0!, {{ s16 - s31 }}

    // Set the current task stack pointer
    msr      psp, r0

    // r2 (the next task's PCB) is now the current task
    str      r2, [r1, {current_offset}]

    //
    // return to the task
    //

    bx       lr
    "#,
    scheduler_ptr = sym scheduler::SCHEDULER_PTR,
    current_offset = const Scheduler::CURRENT_OFFSET,
    next_offset = const Scheduler::NEXT_OFFSET,
    stack_top_offset = const Pcb::STACK_TOP_OFFSET,
    );
}

// End of File
