//! Relays positioning telemetry from a serial device to WebSocket clients.
//!
//! Data moves device → [`source`] → [`codec`] → [`hub`] → subscribers, while
//! [`supervisor`] keeps the device connection alive:
//!
//! - [`framer`] splits raw device bytes into lines.
//! - [`codec`] filters debug noise, decodes samples and encodes the envelope
//!   pushed to clients.
//! - [`hub`] is an actor that owns the subscriber set and fans payloads out.
//! - [`device`] opens the serial port (or a simulated device for demos).
//! - [`source`] owns the device handle and runs the blocking read loop.
//! - [`supervisor`] drives the reconnect state machine around the reader.
//! - [`server`] exposes `/ws` and a demo page through axum.
//! - [`cli`], [`config`] and [`logging`] are the process shell.

pub mod cli;
pub mod codec;
pub mod config;
pub mod device;
pub mod framer;
pub mod hub;
pub mod logging;
pub mod server;
pub mod source;
pub mod supervisor;
