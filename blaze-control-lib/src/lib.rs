//! # Blaze Control Library
//!
//! `blaze-control-lib` controls networked LED pattern controllers over their
//! websocket protocol and HTTP file API. It turns the device's interleaved
//! stream of replies and unsolicited pushes into plain request/response
//! calls, and it speaks the binary formats the device uses for patterns,
//! pixel maps, expander boards, backups and discovery.
//!
//! ## Features
//!
//! - Discovery of devices announcing themselves on the local network, with
//!   optional time synchronization
//! - A request/response transport that filters statistics, sequencer and
//!   preview pushes out of the reply stream
//! - Pattern selection, controls, brightness, sequencer and map settings
//! - File transfer, pattern download and whole-device backups
//!
//! ## Example
//!
//! ```no_run
//! use blaze_control_lib::control_interface::ControlInterface;
//! use blaze_control_lib::util::discovery::Discovery;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let devices = Discovery::find_devices(Duration::from_secs(3)).await?;
//!
//!     for device in devices {
//!         let control = ControlInterface::new(&device.ip_address.to_string()).await?;
//!         for (id, name) in control.get_pattern_list(false).await? {
//!             println!("{}: {}", id, name);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

// Binary wire formats. Pure encode/decode, no I/O.
pub mod codec;

// The device façade: websocket commands and the HTTP file API.
//
// ```no_run
// use blaze_control_lib::control_interface::ControlInterface;
//
// #[tokio::main]
// async fn main() {
//     let control = ControlInterface::new("192.168.1.100").await.unwrap();
//     control.set_brightness_slider(0.5, false).await.unwrap();
// }
// ```
pub mod control_interface;

// Websocket connection lifecycle and request/response multiplexing.
pub mod transport;

// Discovery of devices on the local network.
pub mod util;
