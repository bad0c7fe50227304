//! USB Mass Storage Bulk Only Transport device engine for DMA-driven high-speed controllers
//!
//! The engine is split between two contexts sharing a [SharedState]:
//! * [InterruptHandler] - called from the controller interrupt, flips flow-control flags
//! * [Ufi] - the service loop, receives CBWs, runs UFI commands and answers with CSWs
//!
//! Class requests (GET_MAX_LUN, Bulk-Only Mass Storage Reset) are answered by
//! [MscClass], which also integrates with [usb-device] based control pipes.
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//!
//! [usb-device]: https://crates.io/crates/usb-device
//! [SharedState]: crate::state::SharedState
//! [InterruptHandler]: crate::interrupt::InterruptHandler
//! [Ufi]: crate::subclass::ufi::Ufi
//! [MscClass]: crate::transport::bbb::MscClass

#![no_std]

pub(crate) mod buffer;
pub(crate) mod fmt;
pub mod hal;
pub mod interrupt;
pub mod state;
pub mod storage;
pub mod subclass;
pub mod transport;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;
