//! # Submission Context
//!
//! Fatal error state shared by every pool and channel of one manager, and
//! the busy-wait helper everything blocks through.

use core::sync::atomic::{AtomicBool, Ordering};

use conduit_core::{Error, Result, SpinConfig, SpinLoop};

/// Manager-wide state consulted by every blocking loop
#[derive(Debug)]
pub struct Context {
    fatal: spin::Mutex<Option<Error>>,
    has_fatal: AtomicBool,
    spin: SpinConfig,
}

impl Context {
    /// Create a context with no fatal error recorded
    pub fn new(spin: SpinConfig) -> Self {
        Self {
            fatal: spin::Mutex::new(None),
            has_fatal: AtomicBool::new(false),
            spin,
        }
    }

    /// `Ok` unless a fatal error has been recorded
    #[inline]
    pub fn status(&self) -> Result<()> {
        if !self.has_fatal.load(Ordering::Acquire) {
            return Ok(());
        }
        match *self.fatal.lock() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Recorded fatal error, if any
    pub fn fatal_error(&self) -> Option<Error> {
        *self.fatal.lock()
    }

    /// Record a fatal error; the first one recorded wins
    ///
    /// Returns the error that is recorded after the call.
    pub fn set_fatal(&self, err: Error) -> Error {
        let mut fatal = self.fatal.lock();
        match *fatal {
            Some(first) => first,
            None => {
                *fatal = Some(err);
                self.has_fatal.store(true, Ordering::Release);
                err
            }
        }
    }

    /// Forget the recorded fatal error
    pub fn clear_fatal(&self) -> Option<Error> {
        let mut fatal = self.fatal.lock();
        self.has_fatal.store(false, Ordering::Release);
        fatal.take()
    }

    /// Busy-wait tunables
    pub fn spin_config(&self) -> SpinConfig {
        self.spin
    }

    /// A fresh busy-wait loop
    pub fn spin_loop(&self, what: &'static str) -> SpinLoop {
        SpinLoop::new(self.spin, what)
    }

    /// Poll `done` until it reports true, bailing out on a fatal error
    ///
    /// A fatal error already recorded fails the wait before `done` runs.
    pub fn wait_until<F>(&self, what: &'static str, mut done: F) -> Result<()>
    where
        F: FnMut() -> Result<bool>,
    {
        let mut spin = self.spin_loop(what);
        loop {
            self.status()?;
            if done()? {
                return Ok(());
            }
            spin.spin()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fatal_wins() {
        let ctx = Context::new(SpinConfig::default());
        assert!(ctx.status().is_ok());
        assert_eq!(ctx.set_fatal(Error::EccError), Error::EccError);
        assert_eq!(ctx.set_fatal(Error::ChannelError), Error::EccError);
        assert_eq!(ctx.status(), Err(Error::EccError));
        assert_eq!(ctx.clear_fatal(), Some(Error::EccError));
        assert!(ctx.status().is_ok());
    }

    #[test]
    fn test_wait_until_stops_on_fatal() {
        let ctx = Context::new(SpinConfig::default());
        let mut polls = 0;
        let result = ctx.wait_until("test", || {
            polls += 1;
            if polls == 3 {
                ctx.set_fatal(Error::ChannelError);
            }
            Ok(false)
        });
        assert_eq!(result, Err(Error::ChannelError));
        assert_eq!(polls, 3);
    }

    #[test]
    fn test_wait_after_fatal_skips_polling() {
        let ctx = Context::new(SpinConfig::default());
        ctx.set_fatal(Error::EccError);
        let mut polls = 0;
        let result = ctx.wait_until("test", || {
            polls += 1;
            Ok(true)
        });
        assert_eq!(result, Err(Error::EccError));
        assert_eq!(polls, 0);
    }

    #[test]
    fn test_wait_until_times_out() {
        let ctx = Context::new(SpinConfig {
            max_spins: Some(10),
            ..SpinConfig::default()
        });
        assert_eq!(ctx.wait_until("test", || Ok(false)), Err(Error::Timeout));
        assert!(ctx.wait_until("test", || Ok(true)).is_ok());
    }
}
