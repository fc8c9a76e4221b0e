//! deskgate: an embedded control-plane HTTP server for a desktop host.
//!
//! Other devices on the network use it to send notifications, read the
//! timetable, capture the screen, close windows and arm an exit gate. The
//! server picks the widest bind it can get, supervises itself and gates every
//! mutating route behind a single access token.

pub mod api;
pub mod bind;
pub mod collab;
pub mod config;
pub mod exit_gate;
pub mod message_log;
pub mod monitor;
pub mod server;
pub mod sweep;
pub mod token;
