//! Assembly entry stubs.
//!
//! The timer and exit stubs build a `kcore::RegisterSet` on the trap stack:
//! the CPU has pushed `ss, rsp, rflags, cs, rip`, the stub pushes the
//! general-purpose registers from `rax` down to `r15`, so `rsp` then points
//! at a complete set with `r15` first. The Rust handler receives that
//! pointer, may overwrite the whole set with another process's registers,
//! and the stub restores whatever is there before `iretq`.
//!
//! Fault stubs do not return; they only hand the vector, the error code and
//! the faulting `rip` to the fatal handler.

use core::arch::global_asm;

use kcore::RegisterSet;

use super::handlers;

unsafe extern "C" {
    pub fn timer_entry();
    pub fn exit_entry();
    pub fn spurious_entry();
    pub fn divide_error_entry();
    pub fn invalid_opcode_entry();
    pub fn double_fault_entry();
    pub fn general_protection_entry();
    pub fn page_fault_entry();
}

const _: () = assert!(RegisterSet::SIZE == 15 * 8 + 5 * 8);

global_asm!(
    r#"
.macro SAVE_GPRS
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
.endm

.macro RESTORE_GPRS
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
.endm

// vector, error code (0 if the CPU pushes none), rip.
.macro FAULT_ENTRY name, vector, has_error
.global \name
\name:
.if \has_error
    mov rsi, [rsp]
    mov rdx, [rsp + 8]
.else
    xor esi, esi
    mov rdx, [rsp]
.endif
    mov edi, \vector
    jmp fault_common
.endm

// Frame + 15 registers leave rsp 16-byte aligned for the call.
.global timer_entry
timer_entry:
    SAVE_GPRS
    cld
    mov rdi, rsp
    call {timer}
    RESTORE_GPRS
    iretq

.global exit_entry
exit_entry:
    SAVE_GPRS
    cld
    mov rdi, rsp
    call {exit}
    RESTORE_GPRS
    iretq

.global spurious_entry
spurious_entry:
    iretq

    FAULT_ENTRY divide_error_entry, 0, 0
    FAULT_ENTRY invalid_opcode_entry, 6, 0
    FAULT_ENTRY double_fault_entry, 8, 1
    FAULT_ENTRY general_protection_entry, 13, 1
    FAULT_ENTRY page_fault_entry, 14, 1

fault_common:
    and rsp, -16
    cld
    call {fault}
    ud2
"#,
    timer = sym handlers::timer_trap,
    exit = sym handlers::exit_trap,
    fault = sym handlers::fault_trap,
);
