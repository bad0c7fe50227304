//! Flow-control state shared between the interrupt handler and the service loop
//!
//! | Field               | Written by                                                                            |
//! |---------------------|---------------------------------------------------------------------------------------|
//! | `session_active`    | [class_request] sets; bus reset clears                                                |
//! | `bulk_state`        | service loop; Bulk-Only reset ([class_request]) and bus reset force [BulkState::Idle] |
//! | `dma_done`          | interrupt sets; service loop clears only while no DMA is running                      |
//! | `in_short_packet`   | service loop sets before the last IN chunk; interrupt and bus reset clear             |
//! | `out_short_pending` | service loop sets before a CBW receive; interrupt and bus reset clear                 |
//! | `max_packet_size`   | [InterruptHandler::configure_endpoints], from `init` and on bus reset                 |
//!
//! Bus reset means either [InterruptHandler] handling the reset interrupt or
//! [MscClass] receiving the [usb-device] reset callback, both through [SharedState::reset].
//! [class_request] runs in control context.
//!
//! [class_request]: crate::transport::bbb::class_request
//! [InterruptHandler]: crate::interrupt::InterruptHandler
//! [InterruptHandler::configure_endpoints]: crate::interrupt::InterruptHandler::configure_endpoints
//! [MscClass]: crate::transport::bbb::MscClass
//! [usb-device]: https://crates.io/crates/usb-device
//!
//! A bus reset ends the session before it resets `bulk_state`, so every blocking wait of
//! the service loop is already on its way out when the state is overwritten.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use num_enum::TryFromPrimitive;

/// Bulk transport state
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BulkState {
    Idle = 0,
    AwaitingCbw = 1,
    CbwReceived = 2,
}

pub struct SharedState {
    session_active: AtomicBool,
    bulk_state: AtomicU8,
    dma_done: AtomicBool,
    in_short_packet: AtomicBool,
    out_short_pending: AtomicBool,
    max_packet_size: AtomicU16,
}

impl SharedState {
    pub const fn new(max_packet_size: u16) -> Self {
        Self {
            session_active: AtomicBool::new(false),
            bulk_state: AtomicU8::new(BulkState::Idle as u8),
            dma_done: AtomicBool::new(false),
            in_short_packet: AtomicBool::new(false),
            out_short_pending: AtomicBool::new(false),
            max_packet_size: AtomicU16::new(max_packet_size),
        }
    }

    pub fn session_active(&self) -> bool {
        self.session_active.load(Ordering::Acquire)
    }

    pub fn set_session_active(&self, active: bool) {
        self.session_active.store(active, Ordering::Release);
    }

    pub fn bulk_state(&self) -> BulkState {
        // only valid discriminants are ever stored
        BulkState::try_from_primitive(self.bulk_state.load(Ordering::Acquire))
            .unwrap_or(BulkState::Idle)
    }

    pub fn set_bulk_state(&self, state: BulkState) {
        self.bulk_state.store(state as u8, Ordering::Release);
    }

    pub fn dma_done(&self) -> bool {
        self.dma_done.load(Ordering::Acquire)
    }

    pub fn set_dma_done(&self, done: bool) {
        self.dma_done.store(done, Ordering::Release);
    }

    pub fn in_short_packet(&self) -> bool {
        self.in_short_packet.load(Ordering::Acquire)
    }

    pub fn set_in_short_packet(&self, pending: bool) {
        self.in_short_packet.store(pending, Ordering::Release);
    }

    pub fn out_short_pending(&self) -> bool {
        self.out_short_pending.load(Ordering::Acquire)
    }

    pub fn set_out_short_pending(&self, pending: bool) {
        self.out_short_pending.store(pending, Ordering::Release);
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size.load(Ordering::Acquire)
    }

    pub fn set_max_packet_size(&self, size: u16) {
        self.max_packet_size.store(size, Ordering::Release);
    }

    /// Start-of-session values, applied on bus reset
    pub fn reset(&self) {
        self.set_session_active(false);
        self.set_bulk_state(BulkState::Idle);
        self.set_in_short_packet(false);
        self.set_out_short_pending(false);
    }
}
