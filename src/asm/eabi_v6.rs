//! Armv6-M EABI code

use crate::pcb::Pcb;
use crate::scheduler::{self, Scheduler};

/// PendSV Handler for Armv6-M or Armv8-M Baseline EABI
///
/// This is the task switch code. It is called by hardware when the PendSV
/// bit is set and all other interrupts have finished. It uses only the
/// Armv6-M subset of instructions, which cannot address r8-r11 directly in
/// `push`/`pop`, so those registers are shuffled through r4-r7 first.
///
/// On entry, we will find that xPSR, PC, LR, R12, R3, R2, R1 and R0 will
/// have been pushed onto the PSP. We thus push the remaining registers
/// (which are as the running task left them) and then restore the
/// registers from another task's saved context. Exiting from this function
/// causes the hardware to restore xPSR, PC, LR, R12, R3, R2, R1, and R0
/// from the new task's PSP, and so the new task resumes.
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
    // r1 = the address of the Scheduler object
    ldr     r1, ={scheduler_ptr}
    ldr     r1, [r1]

    // r2 = the current task's PCB pointer
    ldr     r2, [r1, {current_offset}]

    // r12 = the handler stack pointer
    mov     r12, sp

    // if there is no current task (first switch ever), skip stacking
    cmp     r2, #0
    beq     1f

    //
    // Stack the current task
    //

    // sp = the current task stack pointer
    mrs     r0, psp
    mov     sp, r0

    // Push the additional state into the stack at sp
    push    {{ lr }}
    push    {{ r4 - r7 }}
    mov     r4, r8
    mov     r5, r9
    mov     r6, r10
    mov     r7, r11
    push    {{ r4 - r7 }}

    // save the adjusted stack pointer into the current PCB
    mov     r0, sp
    str     r0, [r2, {stack_top_offset}]

    //
    // Pop the next task
    //

    1:

    // r2 = the next task's PCB pointer
    ldr     r2, [r1, {next_offset}]

    // sp = the stack pointer saved in that PCB
    ldr     r0, [r2, {stack_top_offset}]
    mov     sp, r0

    // Pop the additional state from it
    pop     {{ r4 - r7 }}
    mov     r8, r4
    mov     r9, r5
    mov     r10, r6
    mov     r11, r7
    pop     {{ r4 - r7 }}
    pop     {{ r0 }}
    mov     lr, r0

    // psp = the adjusted task stack pointer
    mov     r0, sp
    msr     psp, r0

    // restore the handler stack pointer from r12
    mov     sp, r12

    // r2 (the next task's PCB) is now the current task
    str     r2, [r1, {current_offset}]

    //
    // return to the task
    //

    bx      lr
    "#,
    scheduler_ptr = sym scheduler::SCHEDULER_PTR,
    current_offset = const Scheduler::CURRENT_OFFSET,
    next_offset = const Scheduler::NEXT_OFFSET,
    stack_top_offset = const Pcb::STACK_TOP_OFFSET,
    );
}

// End of File
