//! # Change Signals and the Change Bus
//!
//! [`ChangeSignal`] is the closed set of wake-up / invalidation signals the
//! backing store emits. A signal carries no data beyond its coordinates;
//! consumers always re-query authoritative state after receiving one.
//!
//! [`ChangeBus`] is the in-process pub/sub seam the notification channel
//! publishes on and the blacklist / cache listeners subscribe to.

mod bus;
mod event;

pub use bus::{ChangeBus, LocalChangeBus, SignalHandler};
pub use event::{channel_names, ChangeSignal, RawNotification, SignalKind};
