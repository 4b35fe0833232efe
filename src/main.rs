//! Kernel entry point
//!
//! `kmain` is called by the platform start code once the boot hart runs in
//! supervisor mode with a valid stack. Bring-up order: memory (paging +
//! heap + page pool) → threads → processes → timer → devices → root
//! filesystem → `init` process.

#![cfg_attr(all(target_arch = "riscv64", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "riscv64", target_os = "none"), no_main)]

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod panic;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod kernel_main {
    use kestrel::arch::riscv64::sync;
    use kestrel::kernel::{addrspace, device, ktfs, process, task, timer};
    use kestrel::{kinfo, println};
    use linked_list_allocator::LockedHeap;

    #[global_allocator]
    static HEAP: LockedHeap = LockedHeap::empty();

    #[no_mangle]
    pub extern "C" fn kmain() -> ! {
        println!();
        kinfo!("boot", "kestrel_up");

        unsafe {
            let (heap_start, heap_size) = addrspace::boot::memory_init();
            HEAP.lock().init(heap_start, heap_size);
            kinfo!("boot", "heap_ok"; base = heap_start as usize, size = heap_size);
        }

        task::init();
        process::init();
        timer::init();

        sync::enable_interrupts();

        // The block transport driver attaches "vioblk" before we get here;
        // without it there is nothing to boot from.
        let blkio = match device::open_device("vioblk", 0) {
            Ok(io) => io,
            Err(e) => panic!("no boot block device: {:?}", e),
        };

        if let Err(e) = ktfs::mount(blkio) {
            panic!("failed to mount root filesystem: {:?}", e);
        }

        let initio = match ktfs::fs_open("init") {
            Ok(io) => io,
            Err(e) => panic!("failed to open init: {:?}", e),
        };

        match process::process_exec(initio, &["init"]) {
            Ok(()) => unreachable!(),
            Err(e) => panic!("failed to exec init: {:?}", e),
        }
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn main() {
    println!("kestrel is a riscv64 kernel; build it for riscv64gc-unknown-none-elf");
    println!("host builds exist to run `cargo test` against the kernel core");
}
