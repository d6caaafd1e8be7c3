//! Fixed pool of numbered loop block devices
//!
//! Each build borrows one `/dev/loopN` slot for the lifetime of its container
//! so the builder can mount the image file it is producing.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use parking_lot::Mutex;
use tracing::{debug, error};

const LOOP_DEV_PREFIX: &str = "/dev/loop";

/// Loop device major number
const LOOP_MAJOR: u32 = 7;

/// Loop device pool errors
#[derive(Debug, thiserror::Error)]
pub enum LoopDevError {
    #[error("no free loop device")]
    Exhausted,

    #[error("unknown loop device: {0}")]
    Unknown(String),

    #[error("attempt to release free loop device: {0}")]
    NotBusy(String),
}

/// Allocator over a contiguous, inclusive range of loop device numbers.
pub struct LoopDeviceAllocator {
    slots: Mutex<BTreeMap<u32, bool>>,
}

impl LoopDeviceAllocator {
    /// Initialize the pool and create any missing device nodes.
    ///
    /// Node creation failures are logged but do not fail initialization; a
    /// build handed such a slot will fail inside the container instead.
    pub fn new(lower: u32, upper: u32) -> Self {
        debug!(
            "initializing loop devices ({}{} - {}{})",
            LOOP_DEV_PREFIX, lower, LOOP_DEV_PREFIX, upper
        );

        let slots: BTreeMap<u32, bool> = (lower..=upper).map(|n| (n, false)).collect();

        for n in lower..=upper {
            ensure_device_node(n);
        }

        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Acquire the first free slot, marking it busy.
    pub fn acquire(&self) -> Result<String, LoopDevError> {
        let mut slots = self.slots.lock();

        for (n, busy) in slots.iter_mut() {
            if !*busy {
                let path = format!("{}{}", LOOP_DEV_PREFIX, n);
                debug!("acquiring {}", path);
                *busy = true;
                return Ok(path);
            }
        }

        Err(LoopDevError::Exhausted)
    }

    /// Release a previously acquired device path.
    ///
    /// Unknown devices and double releases are errors, never silently ignored.
    pub fn release(&self, path: &str) -> Result<(), LoopDevError> {
        let n: u32 = path
            .strip_prefix(LOOP_DEV_PREFIX)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| LoopDevError::Unknown(path.to_string()))?;

        let mut slots = self.slots.lock();
        let busy = slots
            .get_mut(&n)
            .ok_or_else(|| LoopDevError::Unknown(path.to_string()))?;

        if !*busy {
            return Err(LoopDevError::NotBusy(path.to_string()));
        }

        debug!("releasing {}", path);
        *busy = false;
        Ok(())
    }

    /// Number of currently busy slots.
    pub fn busy_count(&self) -> usize {
        self.slots.lock().values().filter(|busy| **busy).count()
    }
}

fn ensure_device_node(n: u32) {
    let path = format!("{}{}", LOOP_DEV_PREFIX, n);
    if Path::new(&path).exists() {
        return;
    }

    let result = Command::new("mknod")
        .args([&path, "b", &LOOP_MAJOR.to_string(), &n.to_string()])
        .output();

    match result {
        Ok(output) if output.status.success() => debug!("created {}", path),
        Ok(output) => error!(
            "failed to create loop device {}: {}",
            path,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => error!("failed to create loop device {}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let pool = LoopDeviceAllocator::new(8, 9);

        let first = pool.acquire().unwrap();
        assert_eq!(first, "/dev/loop8");
        assert_eq!(pool.busy_count(), 1);

        pool.release(&first).unwrap();
        assert_eq!(pool.busy_count(), 0);

        // the freed slot is handed out again
        assert_eq!(pool.acquire().unwrap(), "/dev/loop8");
    }

    #[test]
    fn test_exhaustion() {
        let pool = LoopDeviceAllocator::new(8, 9);

        pool.acquire().unwrap();
        pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(LoopDevError::Exhausted)));
        assert_eq!(pool.busy_count(), 2);
    }

    #[test]
    fn test_double_release_fails() {
        let pool = LoopDeviceAllocator::new(8, 8);

        let dev = pool.acquire().unwrap();
        pool.release(&dev).unwrap();
        assert!(matches!(pool.release(&dev), Err(LoopDevError::NotBusy(_))));
    }

    #[test]
    fn test_unknown_device_rejected() {
        let pool = LoopDeviceAllocator::new(8, 9);

        assert!(matches!(
            pool.release("/dev/loop99"),
            Err(LoopDevError::Unknown(_))
        ));
        assert!(matches!(
            pool.release("/dev/sda1"),
            Err(LoopDevError::Unknown(_))
        ));
    }
}
