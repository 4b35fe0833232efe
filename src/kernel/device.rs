//! Named Device Registry
//!
//! Drivers attach their I/O objects here under a name and instance number;
//! `devopen` resolves them for user processes. A device attached as
//! exclusive admits one open handle at a time; a second open fails with
//! `Busy` until the first handle is dropped.

use crate::kernel::error::{KResult, KernelError};
use crate::kernel::io::Io;
use crate::kernel::lock::SpinLock;
use alloc::vec::Vec;

struct DeviceEntry {
    name: &'static str,
    instno: u32,
    io: Io,
    exclusive: bool,
}

static DEVICES: SpinLock<Vec<DeviceEntry>> = SpinLock::new(Vec::new());

/// Register a device instance.
pub fn attach_device(name: &'static str, instno: u32, io: Io, exclusive: bool) -> KResult<()> {
    let mut devices = DEVICES.lock();
    if devices
        .iter()
        .any(|d| d.name == name && d.instno == instno)
    {
        return Err(KernelError::Busy);
    }
    devices.push(DeviceEntry {
        name,
        instno,
        io,
        exclusive,
    });
    crate::kinfo!("dev", "attached"; name = name, instno = instno);
    Ok(())
}

/// Open a handle to a named device instance.
pub fn open_device(name: &str, instno: u32) -> KResult<Io> {
    let devices = DEVICES.lock();
    let entry = devices
        .iter()
        .find(|d| d.name == name && d.instno == instno)
        .ok_or(KernelError::NotFound)?;

    // The registry itself holds one reference; anything above that is an
    // outstanding open handle.
    if entry.exclusive && entry.io.refcnt() > 1 {
        return Err(KernelError::Busy);
    }

    Ok(entry.io.addref())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::io::create_null_io;

    #[test]
    fn test_attach_open_and_exclusivity() {
        attach_device("testdev", 0, create_null_io(), true).unwrap();
        attach_device("testdev", 1, create_null_io(), false).unwrap();
        assert_eq!(
            attach_device("testdev", 0, create_null_io(), true),
            Err(KernelError::Busy)
        );

        assert_eq!(
            open_device("missing", 0).unwrap_err(),
            KernelError::NotFound
        );

        let h = open_device("testdev", 0).unwrap();
        assert_eq!(open_device("testdev", 0).unwrap_err(), KernelError::Busy);
        h.close();
        assert!(open_device("testdev", 0).is_ok());

        // Non-exclusive instances allow concurrent opens.
        let a = open_device("testdev", 1).unwrap();
        let b = open_device("testdev", 1).unwrap();
        a.close();
        b.close();
    }
}
