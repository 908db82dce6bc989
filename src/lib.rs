//! # tc3-ads-rs
//!
//! **Async-first TwinCAT ADS client for symbolic PLC variable access.**
//!
//! Connects to a Beckhoff controller's ADS router over AMS/TCP, resolves PLC
//! variables by name, and keeps their values live through server-side change
//! notifications. The session supervises the link: it refuses controllers
//! that are not in `Run`, notices Run/Stop transitions, and reconnects on a
//! timer after any loss.
//!
//! Runtime failures follow an event-surface contract: accessors return the
//! `Empty`/zeroed sentinel instead of `Result`, and the cause is published on
//! the session's event stream. Polling UIs and data recorders keep their hot
//! path free of error plumbing.
//!
//! ## Quickstart (async)
//!
//! ```no_run
//! use tc3_ads_rs::{Session, PlcValue};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let session = Session::builder("192.168.0.10.1.1:851").build();
//!     session.open().await;
//!
//!     let speed = session.value("MAIN.fSetpoint").await;
//!     speed.set(42.5).await;
//!     println!("setpoint = {}", speed.get().await);
//!
//!     let mut updates = speed.subscribe();
//!     while updates.changed().await.is_ok() {
//!         println!("changed: {}", *updates.borrow_and_update());
//!     }
//! }
//! ```
//!
//! ## Quickstart (blocking)
//!
//! ```no_run
//! # #[cfg(feature = "blocking")]
//! # fn run() -> Result<(), tc3_ads_rs::AdsError> {
//! use tc3_ads_rs::{SessionBlocking, SessionBuilder};
//! let session = SessionBlocking::open(SessionBuilder::new("192.168.0.10.1.1:851"))?;
//! session.set("MAIN.bEnable", true);
//! println!("counter = {}", session.get("MAIN.nCounter"));
//! # Ok(())
//! # }
//! ```
//!
//! Architecture layers:
//! - transport (AMS/TCP framing, invoke-id matching, notification routing)
//! - envelope (command payload pack/unpack)
//! - value handles (resolution, caching, typed access)
//! - session (lifecycle, supervision, reconnection)

/// Error types returned by this crate and the ADS error-code translation.
pub mod error;
/// Stable data models: addresses, symbol metadata, values and conversions.
pub mod model;

mod envelope;
mod registry;
mod session;
mod transport;
mod value;

#[cfg(feature = "blocking")]
/// Blocking wrapper over the async session.
pub mod blocking;

#[cfg(feature = "blocking")]
pub use crate::blocking::SessionBlocking;
pub use crate::error::{ads_error_message, AdsError};
pub use crate::model::symbol::{AdsState, AmsAddr, ArraySpan, PlcKind, SymbolInfo};
pub use crate::model::value::PlcValue;
pub use crate::session::{Session, SessionBuilder, SessionEvent};
pub use crate::value::{NotifyMode, ValueHandle, ValueOptions};
