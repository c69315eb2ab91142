// Audio focus and wake token capabilities
//
// The engine asks for exclusive use of the audio input and for a token that
// keeps the process awake while recording. Both are explicit capabilities
// handed to the engine at construction, never globals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

/// Observer notified when another component takes or returns audio focus
pub trait FocusListener: Send + Sync {
    fn on_focus_lost(&self);
    fn on_focus_gained(&self);
}

/// Arbitration for the audio input
pub trait AudioFocus: Send + Sync {
    /// Try to win focus; `listener` receives later changes
    fn request(&self, listener: Weak<dyn FocusListener>) -> bool;

    /// Give focus back. Idempotent.
    fn abandon(&self);
}

/// Exclusive wake capability held for the duration of a session
pub trait WakeToken: Send + Sync {
    fn acquire(&self) -> bool;

    /// Idempotent
    fn release(&self);
}

/// Single-holder focus arbiter.
///
/// `interrupt` and `restore` simulate another component (a phone call, a
/// voice assistant) taking the input away and giving it back.
#[derive(Default)]
pub struct ExclusiveFocus {
    holder: Mutex<Option<Weak<dyn FocusListener>>>,
    denied: AtomicBool,
    interrupted: AtomicBool,
}

impl ExclusiveFocus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse future requests (or allow them again)
    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    pub fn is_held(&self) -> bool {
        self.current_listener().is_some()
    }

    /// Another component takes focus
    pub fn interrupt(&self) {
        if self.interrupted.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self.current_listener() {
            info!("Audio focus lost");
            listener.on_focus_lost();
        }
    }

    /// The other component returns focus
    pub fn restore(&self) {
        if !self.interrupted.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self.current_listener() {
            info!("Audio focus regained");
            listener.on_focus_gained();
        }
    }

    fn current_listener(&self) -> Option<Arc<dyn FocusListener>> {
        let holder = match self.holder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        holder.as_ref().and_then(Weak::upgrade)
    }
}

impl AudioFocus for ExclusiveFocus {
    fn request(&self, listener: Weak<dyn FocusListener>) -> bool {
        if self.denied.load(Ordering::SeqCst) || self.interrupted.load(Ordering::SeqCst) {
            debug!("Audio focus request denied");
            return false;
        }
        let mut holder = match self.holder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if holder.as_ref().and_then(Weak::upgrade).is_some() {
            return false;
        }
        *holder = Some(listener);
        true
    }

    fn abandon(&self) {
        let mut holder = match self.holder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *holder = None;
    }
}

/// In-process wake token: at most one holder
#[derive(Debug, Default)]
pub struct ProcessWakeToken {
    held: AtomicBool,
    unavailable: AtomicBool,
}

impl ProcessWakeToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl WakeToken for ProcessWakeToken {
    fn acquire(&self) -> bool {
        if self.unavailable.load(Ordering::SeqCst) {
            return false;
        }
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }
}
