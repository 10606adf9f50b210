//! Control channel between the registry and one orchestrator loop.
//!
//! The loop only blocks in [`ControlListener::sleep`] and
//! [`ControlListener::changed`]; both return as soon as a directive arrives.

use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Run,
    Pause,
    /// Finish the loop and mark the job stopped.
    Stop,
    /// Leave the loop without touching the persisted status (process shutdown).
    Detach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Control {
    directive: Directive,
    /// Bumped by "generate now" requests.
    act_now: u64,
}

/// Why a sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    Signalled,
}

#[derive(Debug)]
pub struct ControlHandle {
    tx: watch::Sender<Control>,
}

#[derive(Debug)]
pub struct ControlListener {
    rx: watch::Receiver<Control>,
    seen_act_now: u64,
    closed: bool,
}

/// A connected handle/listener pair starting in `initial`.
pub fn channel(initial: Directive) -> (ControlHandle, ControlListener) {
    let (tx, rx) = watch::channel(Control {
        directive: initial,
        act_now: 0,
    });
    (
        ControlHandle { tx },
        ControlListener {
            rx,
            seen_act_now: 0,
            closed: false,
        },
    )
}

impl ControlHandle {
    pub fn directive(&self) -> Directive {
        self.tx.borrow().directive
    }

    pub fn send(&self, directive: Directive) {
        self.tx.send_modify(|c| c.directive = directive);
    }

    pub fn pause(&self) {
        self.send(Directive::Pause);
    }

    pub fn resume(&self) {
        self.send(Directive::Run);
    }

    pub fn stop(&self) {
        self.send(Directive::Stop);
    }

    pub fn detach(&self) {
        self.send(Directive::Detach);
    }

    pub fn act_now(&self) {
        self.tx.send_modify(|c| c.act_now += 1);
    }
}

impl ControlListener {
    /// A dropped handle reads as `Detach`.
    pub fn directive(&self) -> Directive {
        if self.closed {
            return Directive::Detach;
        }
        self.rx.borrow().directive
    }

    /// Consume a pending "generate now" request.
    pub fn take_act_now(&mut self) -> bool {
        let current = self.rx.borrow().act_now;
        if current != self.seen_act_now {
            self.seen_act_now = current;
            return true;
        }
        false
    }

    fn interrupted(&self) -> bool {
        if self.closed {
            return true;
        }
        let c = *self.rx.borrow();
        c.directive != Directive::Run || c.act_now != self.seen_act_now
    }

    /// Sleep for `dur`, returning early on any directive other than `Run` or
    /// on a pending "generate now".
    pub async fn sleep(&mut self, dur: Duration) -> Wake {
        if self.interrupted() {
            return Wake::Signalled;
        }
        let deadline = tokio::time::sleep(dur);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Wake::Elapsed,
                res = self.rx.changed() => {
                    if res.is_err() {
                        self.closed = true;
                    }
                    if self.interrupted() {
                        return Wake::Signalled;
                    }
                }
            }
        }
    }

    /// Wait for the next change of control state.
    pub async fn changed(&mut self) {
        if self.closed {
            return;
        }
        if self.rx.changed().await.is_err() {
            self.closed = true;
        }
    }
}
