//! Press/hold classification for the single front-panel button.
//!
//! The edge interrupt records the press time on the falling edge and, on the
//! rising edge, classifies the hold and posts one event. The mailbox then stays
//! disarmed until the main loop has taken the event and called [`ButtonMailbox::rearm`],
//! so bounces and a second press arriving before service are dropped.
//!
//! | Hold              | Event        |
//! |-------------------|--------------|
//! | < long press (500 ms) | `ShortPress` |
//! | >= long press     | `LongPress`  |

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    ShortPress,
    LongPress,
}

const NO_EVENT: u8 = 0;
const SHORT_PRESS: u8 = 1;
const LONG_PRESS: u8 = 2;

impl ButtonEvent {
    pub fn classify(hold_ms: u32, long_press_ms: u32) -> Self {
        if hold_ms < long_press_ms {
            Self::ShortPress
        } else {
            Self::LongPress
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::ShortPress => SHORT_PRESS,
            Self::LongPress => LONG_PRESS,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            SHORT_PRESS => Some(Self::ShortPress),
            LONG_PRESS => Some(Self::LongPress),
            _ => None,
        }
    }
}

/// Single-slot mailbox shared between the edge interrupt and the main loop.
/// Only atomics are touched, so the ISR side never blocks.
#[derive(Debug)]
pub struct ButtonMailbox {
    long_press_ms: u32,
    armed: AtomicBool,
    pressed: AtomicBool,
    pressed_at_ms: AtomicU32,
    pending: AtomicU8,
}

impl ButtonMailbox {
    pub const fn new(long_press_ms: u32) -> Self {
        Self {
            long_press_ms,
            armed: AtomicBool::new(true),
            pressed: AtomicBool::new(false),
            pressed_at_ms: AtomicU32::new(0),
            pending: AtomicU8::new(NO_EVENT),
        }
    }

    /// Falling edge.
    pub fn on_press(&self, now_ms: u32) {
        if !self.armed.load(Ordering::Acquire) {
            return;
        }
        self.pressed_at_ms.store(now_ms, Ordering::Relaxed);
        self.pressed.store(true, Ordering::Release);
    }

    /// Rising edge. Posts the classified event and disarms.
    pub fn on_release(&self, now_ms: u32) {
        if !self.armed.load(Ordering::Acquire) || !self.pressed.swap(false, Ordering::AcqRel) {
            return;
        }

        let held_ms = now_ms.wrapping_sub(self.pressed_at_ms.load(Ordering::Relaxed));
        let event = ButtonEvent::classify(held_ms, self.long_press_ms);
        self.armed.store(false, Ordering::Release);
        self.pending.store(event.code(), Ordering::Release);
    }

    /// Dispatches on the pin level read inside the interrupt (active low).
    pub fn on_edge(&self, level_high: bool, now_ms: u32) {
        if level_high {
            self.on_release(now_ms);
        } else {
            self.on_press(now_ms);
        }
    }

    /// Level check after the edge interrupt is re-enabled. Catches an edge
    /// that arrived while it was off and never restarts a press in progress.
    pub fn resync(&self, level_high: bool, now_ms: u32) {
        if level_high {
            self.on_release(now_ms);
        } else if !self.pressed.load(Ordering::Acquire) {
            self.on_press(now_ms);
        }
    }

    pub fn take(&self) -> Option<ButtonEvent> {
        ButtonEvent::from_code(self.pending.swap(NO_EVENT, Ordering::AcqRel))
    }

    pub fn rearm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}
