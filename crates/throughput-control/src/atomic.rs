use core::sync::atomic::{AtomicU64, Ordering};

/// `f64` stored as raw bits so it can be updated with a CAS loop.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    pub fn swap(&self, value: f64) -> f64 {
        f64::from_bits(self.0.swap(value.to_bits(), Ordering::AcqRel))
    }

    /// Applies `f` until the compare-exchange succeeds or `f` returns `None`.
    ///
    /// Returns `Ok(previous)` when updated, `Err(current)` when `f` declined.
    pub fn fetch_update<F>(&self, mut f: F) -> Result<f64, f64>
    where
        F: FnMut(f64) -> Option<f64>,
    {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                f(f64::from_bits(bits)).map(f64::to_bits)
            })
            .map(f64::from_bits)
            .map_err(f64::from_bits)
    }

    pub fn fetch_add(&self, delta: f64) -> f64 {
        match self.fetch_update(|current| Some(current + delta)) {
            Ok(previous) | Err(previous) => previous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_update_declines_without_writing() {
        let value = AtomicF64::new(0.0);
        let result = value.fetch_update(|current| (current > 0.0).then_some(current - 1.0));
        assert_eq!(result, Err(0.0));
        assert_eq!(value.load(), 0.0);
    }

    #[test]
    fn fetch_add_handles_negative_values() {
        let value = AtomicF64::new(1.0);
        assert_eq!(value.fetch_add(-2.5), 1.0);
        assert_eq!(value.load(), -1.5);
    }
}
