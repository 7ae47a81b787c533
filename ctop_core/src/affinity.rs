use std::io;

use crate::numa::Bitmask;

/// Control over the calling thread's CPU affinity
pub trait ThreadAffinity {
    fn current(&self) -> io::Result<Bitmask>;

    fn set(&self, mask: &Bitmask) -> io::Result<()>;

    /// Restrict the calling thread to exactly `cpu`; blocks until the kernel accepts
    fn pin_to(&self, cpu: u32) -> io::Result<()> {
        let mut mask = Bitmask::new(cpu as usize + 1);
        mask.set(cpu)?;
        self.set(&mask)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::mem;

    use libc::{cpu_set_t, sched_getaffinity, sched_setaffinity, CPU_ISSET, CPU_SET, CPU_SETSIZE, CPU_ZERO};

    use crate::numa::{range_error, Bitmask};

    const SET_BITS: usize = CPU_SETSIZE as usize;

    pub fn current() -> io::Result<Bitmask> {
        let mut set: cpu_set_t = unsafe { mem::zeroed() };
        if unsafe { sched_getaffinity(0, mem::size_of::<cpu_set_t>(), &mut set) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut mask = Bitmask::new(SET_BITS);
        for cpu in 0..SET_BITS {
            if unsafe { CPU_ISSET(cpu, &set) } {
                mask.set(cpu as u32)?;
            }
        }
        Ok(mask)
    }

    pub fn set(mask: &Bitmask) -> io::Result<()> {
        let mut set: cpu_set_t = unsafe { mem::zeroed() };
        unsafe { CPU_ZERO(&mut set) };
        for cpu in mask.iter() {
            if cpu as usize >= SET_BITS {
                return Err(range_error());
            }
            unsafe { CPU_SET(cpu as usize, &mut set) };
        }

        if unsafe { sched_setaffinity(0, mem::size_of::<cpu_set_t>(), &set) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// `sched_{get,set}affinity` on the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeAffinity;

impl ThreadAffinity for NativeAffinity {
    #[cfg(target_os = "linux")]
    fn current(&self) -> io::Result<Bitmask> {
        linux::current()
    }

    #[cfg(target_os = "linux")]
    fn set(&self, mask: &Bitmask) -> io::Result<()> {
        linux::set(mask)
    }

    #[cfg(not(target_os = "linux"))]
    fn current(&self) -> io::Result<Bitmask> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "thread affinity is not supported on this platform",
        ))
    }

    #[cfg(not(target_os = "linux"))]
    fn set(&self, _mask: &Bitmask) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "thread affinity is not supported on this platform",
        ))
    }
}

/// Holds the thread's affinity mask for the duration of a probe.
///
/// The mask seen on creation is restored on drop when `restore` is set,
/// whether the probe finished or bailed out with an error.
pub struct AffinityGuard<'a, A: ThreadAffinity + ?Sized> {
    affinity: &'a A,
    original: Bitmask,
    restore: bool,
}

impl<'a, A: ThreadAffinity + ?Sized> AffinityGuard<'a, A> {
    pub fn new(affinity: &'a A, restore: bool) -> io::Result<Self> {
        let original = affinity.current()?;
        log::trace!("saved thread affinity {}", original);
        Ok(Self {
            affinity,
            original,
            restore,
        })
    }

    /// CPUs the thread was allowed on before probing started
    pub fn original(&self) -> &Bitmask {
        &self.original
    }

    pub fn pin_to(&self, cpu: u32) -> io::Result<()> {
        self.affinity.pin_to(cpu)
    }
}

impl<A: ThreadAffinity + ?Sized> Drop for AffinityGuard<'_, A> {
    fn drop(&mut self) {
        if !self.restore {
            return;
        }
        match self.affinity.set(&self.original) {
            Ok(()) => log::trace!("restored thread affinity {}", self.original),
            Err(e) => log::warn!("failed to restore thread affinity {}: {}", self.original, e),
        }
    }
}
