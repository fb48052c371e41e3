//! Callback-to-completion utilities for NVMe commands.
//!
//! NVMe completions are delivered by the driver from inside its
//! completion-processing call. Each submitted command carries a
//! [`CompletionSender`] as its callback context; the session keeps the
//! matching [`CompletionReceiver`] and checks it after every poll.
//!
//! # Pattern
//!
//! 1. Create a completion pair with [`completion()`]
//! 2. Hand the sender to the driver with the command; a C backend converts it
//!    with [`CompletionSender::into_raw()`] and back with
//!    [`CompletionSender::from_raw()`] in its callback
//! 3. The callback sends the result
//! 4. Check the receiver with [`CompletionReceiver::try_take()`] after polling
//!    the queue pair

use std::ffi::c_void;

use futures_channel::oneshot;

use crate::error::{Error, Result};

/// Sender half of a completion pair.
pub struct CompletionSender<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> CompletionSender<T> {
    /// Convert sender to raw pointer for passing to C callbacks.
    ///
    /// The returned pointer must be passed to [`from_raw()`](Self::from_raw)
    /// exactly once to avoid memory leaks.
    pub fn into_raw(self) -> *mut c_void {
        Box::into_raw(Box::new(self.tx)) as *mut c_void
    }

    /// Reconstruct sender from raw pointer.
    ///
    /// # Safety
    ///
    /// The pointer must have been created by [`into_raw()`](Self::into_raw)
    /// and must not have been used already.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Self {
        let tx = unsafe { *Box::from_raw(ptr as *mut oneshot::Sender<Result<T>>) };
        Self { tx }
    }

    /// Send a result.
    pub fn complete(self, result: Result<T>) {
        // Receiver may have been dropped by a torn-down session
        let _ = self.tx.send(result);
    }
}

/// Receiver half of a completion pair, checked without blocking via
/// [`try_take()`](Self::try_take).
pub struct CompletionReceiver<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> CompletionReceiver<T> {
    /// Take the result if the sender has fired.
    ///
    /// Returns `None` while the command is still outstanding, and
    /// `Some(Err(Error::Cancelled))` once the sender was dropped unsent.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(Some(result)) => Some(result),
            Ok(None) => None,
            Err(oneshot::Canceled) => Some(Err(Error::Cancelled)),
        }
    }
}

/// Create a completion sender/receiver pair.
pub fn completion<T>() -> (CompletionSender<T>, CompletionReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (CompletionSender { tx }, CompletionReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_success() {
        let (tx, mut rx) = completion::<i32>();
        assert!(rx.try_take().is_none());
        tx.complete(Ok(42));

        match rx.try_take() {
            Some(Ok(v)) => assert_eq!(v, 42),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_completion_error() {
        let (tx, mut rx) = completion::<()>();
        tx.complete(Err(Error::NvmeError { sct: 0, sc: 2 }));

        match rx.try_take() {
            Some(Err(Error::NvmeError { sct: 0, sc: 2 })) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_dropped_sender_cancels() {
        let (tx, mut rx) = completion::<()>();
        drop(tx);
        assert!(matches!(rx.try_take(), Some(Err(Error::Cancelled))));
    }

    #[test]
    fn test_into_raw_from_raw() {
        let (tx, mut rx) = completion::<i32>();
        let ptr = tx.into_raw();
        assert!(!ptr.is_null());
        assert!(rx.try_take().is_none());

        let tx2 = unsafe { CompletionSender::<i32>::from_raw(ptr) };
        tx2.complete(Ok(123));
        assert!(matches!(rx.try_take(), Some(Ok(123))));
    }
}
