//! Approximate per-thread memory accounting
//!
//! Heap objects hold a [`Charge`] sized to their payload; dropping the
//! object releases it. The meter lives in a thread local because every
//! evaluation owns its interpreter thread.

use super::value::{Eval, Exception};
use super::InterpreterControl;
use std::cell::{Cell, RefCell};
use std::sync::atomic::Ordering;
use std::sync::Arc;

struct Meter {
    limit: u64,
    current: u64,
    peak: u64,
    control: Arc<InterpreterControl>,
}

thread_local! {
    static METER: RefCell<Option<Meter>> = const { RefCell::new(None) };
}

/// Start metering the current thread against `limit` bytes
pub(crate) fn install(limit: u64, control: Arc<InterpreterControl>) {
    METER.with(|meter| {
        *meter.borrow_mut() = Some(Meter {
            limit,
            current: 0,
            peak: 0,
            control,
        });
    });
}

pub(crate) fn uninstall() {
    let _ = METER.try_with(|meter| meter.borrow_mut().take());
}

fn charge(bytes: usize) -> Eval<()> {
    let over = METER
        .try_with(|meter| {
            let mut meter = meter.borrow_mut();
            let Some(meter) = meter.as_mut() else {
                return false;
            };
            let next = meter.current.saturating_add(bytes as u64);
            if next > meter.limit {
                return true;
            }
            meter.current = next;
            meter.peak = meter.peak.max(next);
            meter.control.memory.store(next, Ordering::Relaxed);
            meter.control.peak_memory.store(meter.peak, Ordering::Relaxed);
            false
        })
        .unwrap_or(false);
    if over {
        Err(Exception::memory())
    } else {
        Ok(())
    }
}

fn release(bytes: usize) {
    let _ = METER.try_with(|meter| {
        if let Some(meter) = meter.borrow_mut().as_mut() {
            meter.current = meter.current.saturating_sub(bytes as u64);
            meter.control.memory.store(meter.current, Ordering::Relaxed);
        }
    });
}

/// Fail early when an allocation of `bytes` would exceed the ceiling
pub(crate) fn check_available(bytes: usize) -> Eval<()> {
    let over = METER
        .try_with(|meter| {
            meter.borrow().as_ref().is_some_and(|meter| {
                meter.current.saturating_add(bytes as u64) > meter.limit
            })
        })
        .unwrap_or(false);
    if over {
        Err(Exception::memory())
    } else {
        Ok(())
    }
}

/// Charge output or other data that is never released
pub(crate) fn consume(bytes: usize) -> Eval<()> {
    charge(bytes)
}

/// Bytes held by one heap object
#[derive(Debug, Default)]
pub(crate) struct Charge(Cell<usize>);

impl Charge {
    pub(crate) fn new(bytes: usize) -> Eval<Self> {
        charge(bytes)?;
        Ok(Self(Cell::new(bytes)))
    }

    /// Re-size the charge after the object grew or shrank
    pub(crate) fn resize(&self, bytes: usize) -> Eval<()> {
        let held = self.0.get();
        if bytes > held {
            charge(bytes - held)?;
        } else {
            release(held - bytes);
        }
        self.0.set(bytes);
        Ok(())
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        release(self.0.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_and_release() {
        let control = Arc::new(InterpreterControl::new());
        install(1000, control.clone());
        let first = Charge::new(400).unwrap();
        let second = Charge::new(400).unwrap();
        assert_eq!(control.memory.load(Ordering::Relaxed), 800);
        assert!(Charge::new(400).is_err());
        assert!(check_available(300).is_err());
        assert!(check_available(100).is_ok());
        drop(first);
        assert_eq!(control.memory.load(Ordering::Relaxed), 400);
        second.resize(900).unwrap();
        assert!(second.resize(1200).is_err());
        assert_eq!(control.peak_memory.load(Ordering::Relaxed), 900);
        drop(second);
        assert_eq!(control.memory.load(Ordering::Relaxed), 0);
        uninstall();
    }

    #[test]
    fn test_unmetered_thread_never_fails() {
        let charge = Charge::new(usize::MAX / 2).unwrap();
        charge.resize(usize::MAX / 2 + 10).unwrap();
    }
}
