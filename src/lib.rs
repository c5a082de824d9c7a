#![cfg_attr(docsrs, feature(doc_cfg))]
//! # daren485_lib
//!
//! This crate provides a library for polling battery management units that
//! speak the Daren DR-1363 protocol over RS485 (e.g. DR-JC03, DR48100JC-03-V2).
//! The [`protocol`] module is a pure codec: it builds request frames,
//! validates reply frames and decodes their payloads into telemetry. The
//! optional clients wrap the codec around a serial port.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `daren485` command-line tool and pulls in `serialport` and `serde`.
//!
//! ### Client Features
//! - `serialport`: Enables the **synchronous** client using the `serialport` crate.
//! - `tokio-serial-async`: Enables the **asynchronous** client using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing the decoded data structures.
//! - `bin-dependencies`: Enables all features required by the `daren485` binary executable.

/// Contains error types for the library.
mod error;
/// Defines the DR-1363 communication protocol.
pub mod protocol;

pub use error::Error;

/// Synchronous client for DR-1363 communication.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Asynchronous client for DR-1363 communication.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
