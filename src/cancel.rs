//! Cooperative cancellation
//!
//! A [`CancellationSignal`] is shared between the thread running a long
//! blocking call and any thread that may want to stop it. The running call
//! attaches a listener for its duration; the listener flips the call's own
//! flag, which the scanner and writers poll at page and statement
//! boundaries.
//!
//! Attach and detach are serialized with `cancel` under one lock, so a
//! cancellation requested before attachment fires the listener as soon as
//! it is attached, and one requested after detachment reaches nobody.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub type Listener = Box<dyn Fn() + Send>;

struct SignalState {
    canceled: AtomicBool,
    listener: Mutex<Option<Listener>>,
}

/// Shared, cloneable cancellation request.
#[derive(Clone)]
pub struct CancellationSignal {
    state: Arc<SignalState>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState {
                canceled: AtomicBool::new(false),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        let listener = match self.state.listener.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.state.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(ref notify) = *listener {
            notify();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::SeqCst)
    }

    /// Install or clear the listener. Installing on an already canceled
    /// signal invokes the listener immediately.
    pub fn set_on_cancel(&self, listener: Option<Listener>) {
        let mut slot = match self.state.listener.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = listener;
        if self.state.canceled.load(Ordering::SeqCst) {
            if let Some(ref notify) = *slot {
                notify();
            }
        }
    }

    /// Forward this signal into `flag` until the returned guard is dropped.
    pub(crate) fn attach(&self, flag: &Arc<AtomicBool>) -> AttachGuard<'_> {
        let target = Arc::clone(flag);
        self.set_on_cancel(Some(Box::new(move || {
            target.store(true, Ordering::SeqCst);
        })));
        AttachGuard { signal: self }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Detaches the listener when dropped.
pub(crate) struct AttachGuard<'a> {
    signal: &'a CancellationSignal,
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        self.signal.set_on_cancel(None);
    }
}

/// Attach `signal` (if any) to `flag` for the lifetime of the guard.
pub(crate) fn attach_optional<'a>(
    signal: Option<&'a CancellationSignal>,
    flag: &Arc<AtomicBool>,
) -> Option<AttachGuard<'a>> {
    signal.map(|s| s.attach(flag))
}
