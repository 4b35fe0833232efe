//! Panic handler for the bare-metal kernel

use core::panic::PanicInfo;
use kestrel::println;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!();
    println!("=== KERNEL PANIC ===");

    if let Some(location) = info.location() {
        println!(
            "  at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }
    println!("  {}", info.message());

    println!("====================");
    println!("System halted.");

    kestrel::arch::riscv64::halt_failure()
}
