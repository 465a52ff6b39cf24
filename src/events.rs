//! Asynchronous status fan-out.
//!
//! Unsolicited notifications commit session state first and queue a
//! [`DriverEvent`]; [`Interface::process_events`](crate::Interface) then
//! delivers the queue to the application listener. Delivery therefore
//! always happens in the caller's task context, never in the serial
//! data-ready signal.

/// Wi-Fi association state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkStatus {
    /// Not associated with an access point.
    Disconnected,
    /// Association attempt in progress.
    Connecting,
    /// Associated and an IP address was assigned.
    GlobalUp,
}

/// One status change delivered to the application.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverEvent {
    /// The association state changed.
    LinkStatus(LinkStatus),
    /// Data became available on a previously drained socket.
    SocketReadable(usize),
    /// The device closed a socket (`id,CLOSED`).
    SocketClosed(usize),
}

/// Receiver for driver events.
pub trait EventListener {
    fn on_event(&mut self, event: DriverEvent);
}

/// Listener that drops every event, for applications that poll instead.
#[derive(Default)]
pub struct NullListener;

impl EventListener for NullListener {
    fn on_event(&mut self, _event: DriverEvent) {}
}
