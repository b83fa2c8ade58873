//! Deployment notifications
//!
//! A [`NotificationHub`] owns two singleton client slots. The progress slot
//! receives one-way progress ticks; the interactive slot carries prompts that
//! block a deployment until the operator answers or the prompt times out.

mod hub;
pub mod messages;
pub mod ws;

pub use hub::{HubSettings, NotificationHub, Slot};
pub use messages::{ActionMessage, ActionResponse, Input, ProgressMessage, Severity};
