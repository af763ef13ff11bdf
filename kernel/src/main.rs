//! Kernel binary entry for riscv64 (SBI environment).
//!
//! Boot is deliberately thin: the trap layer, device tree parsing, and
//! virtual memory belong to external collaborators. Hart 0 initializes the
//! core, becomes its own idle thread, publishes init (tid 1), and spawns
//! the per-CPU reclaim workers; secondary harts wait for that, bootstrap
//! themselves, and idle.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use core::sync::atomic::{AtomicBool, Ordering};

    use hartos_kernel::{
        mm, print, process, sched,
        sched::entity::Priority,
        sync::rcu,
    };

    const BOOT_STACK_BYTES: usize = 16 * 4096;
    const MAX_BOOT_HARTS: usize = hartos_kernel::config::MAX_CPUS;

    #[repr(C, align(16))]
    struct BootStacks([u8; BOOT_STACK_BYTES * MAX_BOOT_HARTS]);

    #[no_mangle]
    static mut __BOOT_STACKS: BootStacks = BootStacks([0; BOOT_STACK_BYTES * MAX_BOOT_HARTS]);

    // SBI hands control here with a0 = hartid, a1 = device tree. Pick a
    // per-hart boot stack, stash the hart id in tp, and enter Rust.
    core::arch::global_asm!(
        r#"
    .section .text.entry
    .globl _start
    _start:
        mv   tp, a0
        la   sp, __BOOT_STACKS
        li   t0, {stack_bytes}
        addi t1, a0, 1
        mul  t0, t0, t1
        add  sp, sp, t0
        call kmain
    1:  wfi
        j 1b
    "#,
        stack_bytes = const BOOT_STACK_BYTES,
    );

    /// Byte heap handed to the allocator at boot; a real port would donate
    /// RAM discovered from the device tree instead.
    #[repr(C, align(4096))]
    struct HeapArena([u8; 2 * 1024 * 1024]);

    static mut HEAP_ARENA: HeapArena = HeapArena([0; 2 * 1024 * 1024]);

    static BOOT_DONE: AtomicBool = AtomicBool::new(false);

    #[no_mangle]
    extern "C" fn kmain(hartid: usize, _dtb: usize) -> ! {
        if hartid == 0 {
            // SAFETY: the arena is donated exactly once, before any
            // allocation.
            unsafe {
                let arena = core::ptr::addr_of_mut!(HEAP_ARENA);
                mm::heap_init(arena as *mut u8, core::mem::size_of::<HeapArena>());
            }
            hartos_kernel::init_core();
            sched::bootstrap_this_cpu();

            // Publish init (tid 1) and start it, then the reclaim workers.
            let init = hartos_kernel::sched::Thread::new_kthread(
                "init",
                Priority::DEFAULT,
                init_main,
                0,
            )
            .expect("cannot allocate init thread");
            let init = process::table::publish_init(init);
            sched::wake_up(init);

            BOOT_DONE.store(true, Ordering::Release);
        } else {
            while !BOOT_DONE.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
            sched::bootstrap_this_cpu();
        }

        sched::timer::arm_tick();
        sched::idle_loop();
    }

    /// First scheduled thread: bring up the reclaim workers, then reap
    /// orphans forever.
    fn init_main(_arg: usize) -> i32 {
        rcu::spawn_workers().expect("cannot spawn reclaim workers");
        log::info!(target: "init", "lifecycle core up");
        loop {
            match process::wait_for_child() {
                Ok((tid, status)) => {
                    log::debug!(target: "init", "reaped tid {} (status {})", tid.0, status);
                }
                Err(_) => sched::yield_now(),
            }
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        print::_print(format_args!("\n[KERNEL PANIC] {}\n", info));
        loop {
            hartos_kernel::arch::wait_for_interrupt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    println!("hartos-kernel: host build; the kernel only boots on riscv64 bare metal.");
    println!("Run `cargo test` to exercise the lifecycle core under the host simulator.");
}
