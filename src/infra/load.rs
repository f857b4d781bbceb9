//! Host load sampling used to throttle admission.

/// Something that can report the 1-minute load average.
pub trait LoadSource: Send + Sync {
    fn load_average(&self) -> Option<f64>;
}

/// Reads the host load average through `getloadavg(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoad;

impl LoadSource for SystemLoad {
    #[cfg(unix)]
    fn load_average(&self) -> Option<f64> {
        let mut samples = [0f64; 3];
        // SAFETY: `samples` has room for the single value requested.
        let read = unsafe { libc::getloadavg(samples.as_mut_ptr(), 1) };
        (read >= 1).then_some(samples[0])
    }

    #[cfg(not(unix))]
    fn load_average(&self) -> Option<f64> {
        None
    }
}

/// A load source that always reports the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoad(pub f64);

impl LoadSource for FixedLoad {
    fn load_average(&self) -> Option<f64> {
        Some(self.0)
    }
}
