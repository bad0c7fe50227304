//! Device controller abstraction
//!
//! The engine talks to a dual-role high-speed USB device controller through the
//! [Controller] trait. The trait mirrors the register model of such controllers: every
//! interrupt group has a status register, an enable register and a write-one-to-clear
//! acknowledgement; bulk data moves through a single DMA channel shared by all endpoints.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

bitflags! {
    /// Global interrupt status, one bit per interrupt group
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct GlobalInterrupts: u32 {
        const USB = 1 << 0;
        const CONTROL = 1 << 1;
        const EP_A = 1 << 2;
        const EP_B = 1 << 3;
        const EP_C = 1 << 4;
        const EP_D = 1 << 5;
        const EP_E = 1 << 6;
        const EP_F = 1 << 7;
        const EP_G = 1 << 8;
        const EP_H = 1 << 9;
        const EP_I = 1 << 10;
        const EP_J = 1 << 11;
        const EP_K = 1 << 12;
        const EP_L = 1 << 13;
    }
}

impl GlobalInterrupts {
    /// The group bit of an endpoint slot
    pub const fn endpoint(ep: Endpoint) -> Self {
        Self::from_bits_retain(1 << (2 + ep as u32))
    }
}

bitflags! {
    /// Bus events
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct BusInterrupts: u32 {
        const SOF = 1 << 0;
        const RESET = 1 << 1;
        const RESUME = 1 << 2;
        const SUSPEND = 1 << 3;
        const HIGH_SPEED = 1 << 4;
        const DMA_DONE = 1 << 5;
        const PHY_CLOCK_VALID = 1 << 6;
        const VBUS_DETECT = 1 << 8;
    }
}

bitflags! {
    /// Control endpoint events
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ControlInterrupts: u32 {
        const SETUP_TOKEN = 1 << 0;
        const SETUP_PACKET = 1 << 1;
        const OUT_TOKEN = 1 << 2;
        const IN_TOKEN = 1 << 3;
        const PING = 1 << 4;
        const TX_PACKET = 1 << 5;
        const RX_PACKET = 1 << 6;
        const NAK = 1 << 7;
        const STALL = 1 << 8;
        const ERROR = 1 << 9;
        const STATUS_DONE = 1 << 10;
        const BUFFER_FULL = 1 << 11;
        const BUFFER_EMPTY = 1 << 12;
    }
}

bitflags! {
    /// Endpoint events
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct EndpointInterrupts: u32 {
        const BUFFER_FULL = 1 << 0;
        const BUFFER_EMPTY = 1 << 1;
        const SHORT_TX = 1 << 2;
        const TX_PACKET = 1 << 3;
        const RX_PACKET = 1 << 4;
        const OUT_TOKEN = 1 << 5;
        const IN_TOKEN = 1 << 6;
        const PING = 1 << 7;
        const NAK = 1 << 8;
        const STALL = 1 << 9;
        const NYET = 1 << 10;
        const ERROR = 1 << 11;
        const SHORT_RX = 1 << 12;
    }
}

bitflags! {
    /// Endpoint response control
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ResponseControl: u32 {
        const FLUSH = 1 << 0;
        const TOGGLE = 1 << 3;
        const HALT = 1 << 4;
        const ZERO_LEN = 1 << 5;
        /// Terminate the current IN transfer with the partial packet in the buffer
        const SHORT_TX = 1 << 6;
        /// Disable double buffering so a short OUT packet is visible immediately
        const DISABLE_BUFFER = 1 << 7;
    }
}

/// Endpoint slot of the controller
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Endpoint {
    A = 0,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    L,
}

impl Endpoint {
    pub const ALL: [Endpoint; 12] = [
        Endpoint::A,
        Endpoint::B,
        Endpoint::C,
        Endpoint::D,
        Endpoint::E,
        Endpoint::F,
        Endpoint::G,
        Endpoint::H,
        Endpoint::I,
        Endpoint::J,
        Endpoint::K,
        Endpoint::L,
    ];
}

/// Bulk-IN slot
pub const BULK_IN: Endpoint = Endpoint::A;
/// Bulk-OUT slot
pub const BULK_OUT: Endpoint = Endpoint::B;

/// DMA direction, as seen from the memory side
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaDirection {
    /// Memory to IN endpoint
    Read,
    /// OUT endpoint to memory
    Write,
}

/// Memory a DMA transfer runs over
pub enum DmaBuffer<'a> {
    Read(&'a [u8]),
    Write(&'a mut [u8]),
}

impl DmaBuffer<'_> {
    pub fn len(&self) -> usize {
        match self {
            DmaBuffer::Read(buf) => buf.len(),
            DmaBuffer::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointDirection {
    In,
    Out,
}

/// Bulk endpoint configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointConfig {
    /// USB endpoint number (without direction bit)
    pub number: u8,
    pub direction: EndpointDirection,
    pub max_packet_size: u16,
}

/// Control pipe handshake
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlState {
    NakClear,
    Stall,
}

/// High-speed USB device controller
///
/// Status getters return the status **masked** by the matching enable register unless noted
/// otherwise. Clearing writes the given bits back to the status register.
pub trait Controller {
    fn global_interrupts(&self) -> GlobalInterrupts;
    /// Replaces the global interrupt enable mask
    fn enable_global_interrupts(&mut self, flags: GlobalInterrupts);

    fn bus_interrupts(&self) -> BusInterrupts;
    fn clear_bus_interrupts(&mut self, flags: BusInterrupts);
    /// Replaces the bus interrupt enable mask
    fn enable_bus_interrupts(&mut self, flags: BusInterrupts);

    fn control_interrupts(&self) -> ControlInterrupts;
    fn clear_control_interrupts(&mut self, flags: ControlInterrupts);
    /// Replaces the control endpoint interrupt enable mask
    fn enable_control_interrupts(&mut self, flags: ControlInterrupts);

    fn endpoint_interrupts(&self, ep: Endpoint) -> EndpointInterrupts;
    /// Raw endpoint status, not masked by the enable register
    fn endpoint_status(&self, ep: Endpoint) -> EndpointInterrupts;
    fn clear_endpoint_interrupts(&mut self, ep: Endpoint, flags: EndpointInterrupts);
    /// Replaces the endpoint interrupt enable mask
    fn enable_endpoint_interrupts(&mut self, ep: Endpoint, flags: EndpointInterrupts);

    fn configure_endpoint(&mut self, ep: Endpoint, config: EndpointConfig);
    fn response_control(&self, ep: Endpoint) -> ResponseControl;
    fn set_response_control(&mut self, ep: Endpoint, ctrl: ResponseControl);
    /// Number of bytes waiting in an OUT endpoint buffer
    fn out_data_count(&self, ep: Endpoint) -> usize;
    /// Pops a single byte from an endpoint buffer
    fn read_fifo_byte(&mut self, ep: Endpoint) -> u8;

    /// Selects direction and endpoint number of the DMA channel
    fn set_dma(&mut self, direction: DmaDirection, ep_number: u8);
    fn dma_direction(&self) -> DmaDirection;
    /// Programs address and length of `buf` and triggers the DMA channel
    ///
    /// # Safety
    /// The memory behind `buf` must stay valid and unaliased until the controller reports
    /// [BusInterrupts::DMA_DONE] or [Controller::reset_dma] is called.
    unsafe fn start_dma(&mut self, buf: DmaBuffer<'_>);
    /// Strobes the DMA reset control, cancelling whatever is in flight
    fn reset_dma(&mut self);

    fn is_attached(&self) -> bool;
    fn is_high_speed(&self) -> bool;
    fn set_enabled(&mut self, enabled: bool);
    fn software_reset(&mut self);
    fn set_address(&mut self, addr: u8);

    fn set_control_state(&mut self, state: ControlState);
    /// Standard request processing of the USB stack. Class requests are expected to be
    /// routed to [MscClass::handle_request].
    ///
    /// [MscClass::handle_request]: crate::transport::bbb::MscClass::handle_request
    fn process_setup(&mut self);
    /// Sends the next chunk of a pending control-IN data stage
    fn control_in(&mut self);
    /// Whether a control-IN data stage has bytes left
    fn control_in_pending(&self) -> bool;
    /// Applies a completed SET_ADDRESS / SET_CONFIGURATION
    fn update_device_state(&mut self);

    /// Called on every iteration of a blocking wait
    fn wait_for_interrupt(&mut self) {
        core::hint::spin_loop();
    }
}
