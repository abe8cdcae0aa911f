//! 架构相关的上下文切换
//!
//! 保存/恢复被调用者保存寄存器并交换栈指针。
//! 初次恢复通过 `prepare_stack` 构造的初始帧 `ret` 进协程入口。

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("coro only supports x86_64 / aarch64 on unix");

use core::arch::naked_asm;

/// 协程入口函数类型
///
/// 入口不接收参数（通过线程本地变量交接当前协程），且永不返回。
pub type EntryFn = extern "C" fn() -> !;

/// 切换上下文
///
/// 把被调用者保存寄存器压入当前栈，将栈指针写入 `save`，
/// 再从 `restore` 读出目标栈指针，弹出目标寄存器并 `ret`。
/// 从调用方视角，本函数在目标上下文切回来时才"返回"。
///
/// # Safety
///
/// - `save` 必须指向有效的栈指针槽
/// - `*restore` 必须由 [`prepare_stack`] 或上一次切换写入
/// - 同一个保存位置不允许被并发恢复
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(save: *mut usize, restore: *const usize) {
    // System V AMD64: rdi = save, rsi = restore
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(save: *mut usize, restore: *const usize) {
    // AAPCS64: x0 = save, x1 = restore
    // 被调用者保存：x19-x28、fp(x29)、lr(x30)、d8-d15，共 20 个 8 字节槽
    naked_asm!(
        "sub sp, sp, #160",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        "mov x2, sp",
        "str x2, [x0]",
        "ldr x2, [x1]",
        "mov sp, x2",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "add sp, sp, #160",
        "ret",
    )
}

/// 在新栈上构造初始帧，返回首次恢复用的栈指针
///
/// 帧布局与 `switch_context` 的保存顺序一致：寄存器槽全部置零，
/// 返回地址槽写入 `entry`。首次切换弹出寄存器后直接进入协程入口。
#[cfg(target_arch = "x86_64")]
pub fn prepare_stack(stack_top: *mut u8, entry: EntryFn) -> usize {
    // 栈顶对齐到 16 字节；入口通过 ret 进入后 rsp % 16 == 8，
    // 与普通 call 进入函数时的约定一致
    let top = (stack_top as usize) & !15;
    let sp = top - 64;
    unsafe {
        let slots = sp as *mut usize;
        for i in 0..6 {
            slots.add(i).write(0); // r15, r14, r13, r12, rbx, rbp
        }
        slots.add(6).write(entry as usize); // 返回地址
    }
    sp
}

#[cfg(target_arch = "aarch64")]
pub fn prepare_stack(stack_top: *mut u8, entry: EntryFn) -> usize {
    let top = (stack_top as usize) & !15;
    let sp = top - 160;
    unsafe {
        let slots = sp as *mut usize;
        for i in 0..20 {
            slots.add(i).write(0);
        }
        slots.add(11).write(entry as usize); // x30 (lr) 槽，偏移 88
    }
    sp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_stack_alignment() {
        let mut buf = vec![0u8; 4096];
        let top = unsafe { buf.as_mut_ptr().add(4096) };

        extern "C" fn dummy_entry() -> ! {
            unreachable!()
        }

        let sp = prepare_stack(top, dummy_entry);
        // 保存的栈指针必须 16 字节对齐且落在栈内
        assert_eq!(sp % 16, 0);
        assert!(sp >= buf.as_ptr() as usize);
        assert!(sp < top as usize);
    }
}
