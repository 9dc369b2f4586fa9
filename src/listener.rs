//! The receiver listener: a six-state lifecycle machine over the
//! discovery layers, plus the ordered list of discovered receivers.

use crate::errors::Error;
use std::fmt;
use std::net::SocketAddr;

/// Lifecycle states of the receiver listener.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Searching,
    Suspended,
    Stopping,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ListenerState::Stopped => "stopped",
            ListenerState::Starting => "starting",
            ListenerState::Running => "running",
            ListenerState::Searching => "searching",
            ListenerState::Suspended => "suspended",
            ListenerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Whether `from -> to` is a legal committed transition.
fn is_transition_valid(from: ListenerState, to: ListenerState) -> bool {
    use ListenerState::*;
    match from {
        Stopped => matches!(to, Starting | Stopping),
        Starting => matches!(to, Running | Suspended | Stopping),
        Running => matches!(to, Suspended | Searching | Stopping),
        Searching => matches!(to, Running | Suspended | Stopping),
        Suspended => matches!(to, Running | Searching | Stopping),
        Stopping => matches!(to, Stopped),
    }
}

/// A discovered receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiverInfo {
    pub receiver_id: String,
    pub friendly_name: String,
    pub model: String,
    /// SHA-256 fingerprint of the receiver's agent certificate, from the
    /// `pk` TXT field.
    pub fingerprint: String,
    pub endpoint_v4: Option<SocketAddr>,
    pub endpoint_v6: Option<SocketAddr>,
    pub network_interface: u32,
}

/// Observes listener lifecycle changes and receiver list changes.
/// Notifications fire only for the Running, Stopped, Suspended and
/// Searching states, and only when the receiver list actually changed.
pub trait ListenerObserver: Send {
    fn on_started(&mut self) {}
    fn on_stopped(&mut self) {}
    fn on_suspended(&mut self) {}
    fn on_searching(&mut self) {}

    fn on_receiver_added(&mut self, _receiver: &ReceiverInfo) {}
    fn on_receiver_changed(&mut self, _receiver: &ReceiverInfo) {}
    fn on_receiver_removed(&mut self, _receiver: &ReceiverInfo) {}
    fn on_all_receivers_removed(&mut self) {}

    fn on_error(&mut self, _error: &Error) {}
}

/// Performs the discovery mechanics behind the listener. Each request is
/// asynchronous: the delegate later commits the transition through
/// [`ReceiverListener::set_state`].
pub trait ListenerDelegate: Send {
    fn start_listener(&mut self);
    fn start_and_suspend_listener(&mut self);
    fn stop_listener(&mut self);
    fn suspend_listener(&mut self);
    fn resume_listener(&mut self);
    /// `from` is the state to return to when the search completes.
    fn search_now(&mut self, from: ListenerState);
}

/// The ordered collection of discovered receivers. Mutations report
/// whether they changed the list, so observers are only notified on
/// modification.
#[derive(Default)]
pub struct ReceiverList {
    receivers: Vec<ReceiverInfo>,
}

impl ReceiverList {
    pub fn new() -> ReceiverList {
        ReceiverList::default()
    }

    pub fn receivers(&self) -> &[ReceiverInfo] {
        &self.receivers
    }

    pub fn on_receiver_added(&mut self, info: &ReceiverInfo) {
        self.receivers.push(info.clone());
    }

    /// Replaces the entry with a matching `receiver_id`. Returns false if
    /// no such entry exists.
    pub fn on_receiver_changed(&mut self, info: &ReceiverInfo) -> bool {
        match self
            .receivers
            .iter_mut()
            .find(|r| r.receiver_id == info.receiver_id)
        {
            Some(existing) => {
                *existing = info.clone();
                true
            }
            None => false,
        }
    }

    /// Removes entries equal to `info`. Returns false if none matched.
    pub fn on_receiver_removed(&mut self, info: &ReceiverInfo) -> bool {
        let before = self.receivers.len();
        self.receivers.retain(|r| r != info);
        self.receivers.len() != before
    }

    /// Clears the list. Returns false if it was already empty.
    pub fn on_all_receivers_removed(&mut self) -> bool {
        let was_empty = self.receivers.is_empty();
        self.receivers.clear();
        !was_empty
    }
}

/// The listener state machine. Operations return whether the requested
/// transition was legal from the current state; illegal requests leave the
/// listener untouched and reach neither delegate nor observer.
pub struct ReceiverListener {
    state: ListenerState,
    delegate: Box<dyn ListenerDelegate>,
    observer: Option<Box<dyn ListenerObserver>>,
    receiver_list: ReceiverList,
    last_error: Option<Error>,
}

impl ReceiverListener {
    pub fn new(
        delegate: Box<dyn ListenerDelegate>,
        observer: Option<Box<dyn ListenerObserver>>,
    ) -> ReceiverListener {
        ReceiverListener {
            state: ListenerState::Stopped,
            delegate,
            observer,
            receiver_list: ReceiverList::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    pub fn receivers(&self) -> &[ReceiverInfo] {
        self.receiver_list.receivers()
    }

    pub fn start(&mut self) -> bool {
        if self.state != ListenerState::Stopped {
            return false;
        }
        self.state = ListenerState::Starting;
        self.delegate.start_listener();
        true
    }

    pub fn start_and_suspend(&mut self) -> bool {
        if self.state != ListenerState::Stopped {
            return false;
        }
        self.state = ListenerState::Starting;
        self.delegate.start_and_suspend_listener();
        true
    }

    pub fn stop(&mut self) -> bool {
        if self.state == ListenerState::Stopped || self.state == ListenerState::Stopping {
            return false;
        }
        self.state = ListenerState::Stopping;
        self.delegate.stop_listener();
        true
    }

    pub fn suspend(&mut self) -> bool {
        if !matches!(
            self.state,
            ListenerState::Running | ListenerState::Searching | ListenerState::Starting
        ) {
            return false;
        }
        self.delegate.suspend_listener();
        true
    }

    pub fn resume(&mut self) -> bool {
        if !matches!(
            self.state,
            ListenerState::Suspended | ListenerState::Searching
        ) {
            return false;
        }
        self.delegate.resume_listener();
        true
    }

    pub fn search_now(&mut self) -> bool {
        if !matches!(self.state, ListenerState::Running | ListenerState::Suspended) {
            return false;
        }
        self.delegate.search_now(self.state);
        true
    }

    /// Commits a transition requested earlier through the delegate.
    /// Invalid transitions are programming errors.
    pub fn set_state(&mut self, state: ListenerState) {
        debug_assert!(
            is_transition_valid(self.state, state),
            "invalid listener transition {} -> {}",
            self.state,
            state
        );
        self.state = state;
        self.maybe_notify_observer();
    }

    pub fn on_error(&mut self, error: Error) {
        if let Some(observer) = self.observer.as_mut() {
            observer.on_error(&error);
        }
        self.last_error = Some(error);
    }

    pub fn on_receiver_added(&mut self, info: &ReceiverInfo) {
        self.receiver_list.on_receiver_added(info);
        if let Some(observer) = self.observer.as_mut() {
            observer.on_receiver_added(info);
        }
    }

    pub fn on_receiver_changed(&mut self, info: &ReceiverInfo) {
        let any_changed = self.receiver_list.on_receiver_changed(info);
        if any_changed {
            if let Some(observer) = self.observer.as_mut() {
                observer.on_receiver_changed(info);
            }
        }
    }

    pub fn on_receiver_removed(&mut self, info: &ReceiverInfo) {
        let any_removed = self.receiver_list.on_receiver_removed(info);
        if any_removed {
            if let Some(observer) = self.observer.as_mut() {
                observer.on_receiver_removed(info);
            }
        }
    }

    pub fn on_all_receivers_removed(&mut self) {
        let any_removed = self.receiver_list.on_all_receivers_removed();
        if any_removed {
            if let Some(observer) = self.observer.as_mut() {
                observer.on_all_receivers_removed();
            }
        }
    }

    fn maybe_notify_observer(&mut self) {
        let Some(observer) = self.observer.as_mut() else {
            return;
        };
        match self.state {
            ListenerState::Running => observer.on_started(),
            ListenerState::Stopped => observer.on_stopped(),
            ListenerState::Suspended => observer.on_suspended(),
            ListenerState::Searching => observer.on_searching(),
            ListenerState::Starting | ListenerState::Stopping => {}
        }
    }
}
