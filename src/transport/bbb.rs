//! Bulk Only Transport (BBB/BOT)

use crate::buffer::Buffer;
use crate::fmt::{error, info, trace};
use crate::hal::Controller;
use crate::state::{BulkState, SharedState};
use crate::storage::BLOCK_SIZE;
use crate::subclass::SUBCLASS_SCSI;
use crate::transport::dma::DmaEngine;
use crate::transport::{CommandStatus, Config, ConfigError, TransferError, TRANSPORT_BBB};
use crate::CLASS_MASS_STORAGE;
use core::borrow::BorrowMut;
use usb_device::bus::{InterfaceNumber, UsbBus, UsbBusAllocator};
use usb_device::class::{ControlIn, ControlOut, UsbClass};
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::descriptor::DescriptorWriter;
use usb_device::endpoint::{EndpointAddress, EndpointIn, EndpointOut, EndpointType};
use usb_device::UsbDirection;

const CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET: u8 = 0xFF;
const CLASS_SPECIFIC_GET_MAX_LUN: u8 = 0xFE;

const CBW_SIGNATURE: u32 = 0x43425355;
const CSW_SIGNATURE: u32 = 0x53425355;

pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

/// Only a single logical unit is exposed
const MAX_LUN: [u8; 1] = [0];

type BulkOnlyResult<T> = Result<T, TransferError>;

#[repr(u8)]
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataDirection {
    Out,
    In,
    #[default]
    NotExpected,
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandBlockWrapper {
    pub tag: u32,
    pub data_transfer_len: u32,
    pub direction: DataDirection,
    pub lun: u8,
    pub block_len: u8,
    pub block: [u8; 16],
}

impl CommandBlockWrapper {
    /// Parses a raw CBW, `None` if the signature doesn't match
    pub fn parse(raw: &[u8; CBW_LEN]) -> Option<Self> {
        let field = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);

        if field(0) != CBW_SIGNATURE {
            return None;
        }

        let data_transfer_len = field(8);
        let mut block = [0u8; 16];
        block.copy_from_slice(&raw[15..]);

        Some(CommandBlockWrapper {
            tag: field(4),
            data_transfer_len,
            direction: if data_transfer_len != 0 {
                if (raw[12] & (1 << 7)) > 0 {
                    DataDirection::In
                } else {
                    DataDirection::Out
                }
            } else {
                DataDirection::NotExpected
            },
            lun: raw[13] & 0b00001111,
            block_len: raw[14],
            block,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandStatusWrapper {
    pub tag: u32,
    pub residue: u32,
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut csw = [0u8; CSW_LEN];
        csw[..4].copy_from_slice(CSW_SIGNATURE.to_le_bytes().as_slice());
        csw[4..8].copy_from_slice(self.tag.to_le_bytes().as_slice());
        csw[8..12].copy_from_slice(self.residue.to_le_bytes().as_slice());
        csw[12] = self.status as u8;
        csw
    }
}

/// Bulk Only Transport
///
/// Receives a CBW into the staging buffer, hands it out via [read_command] and sends
/// the CSW via [ack]. Data phases are driven by the subclass through the staging buffer.
///
/// [read_command]: crate::transport::bbb::BulkOnly::read_command
/// [ack]: crate::transport::bbb::BulkOnly::ack
pub struct BulkOnly<'a, C: Controller, Buf: BorrowMut<[u8]>> {
    dma: DmaEngine<'a, C>,
    buf: Buffer<Buf>,
    state: &'a SharedState,
}

impl<'a, C, Buf> BulkOnly<'a, C, Buf>
where
    C: Controller,
    Buf: BorrowMut<[u8]>,
{
    /// Creates a Bulk Only Transport instance
    ///
    /// # Arguments
    /// * `hw` - the device controller
    /// * `state` - flow-control state shared with the [interrupt handler]
    /// * `config` - endpoint and DMA configuration
    /// * `buf` - The staging buffer. It is **required** to fit at least a single block.
    /// It is **recommended** to be a multiple of the max DMA length
    ///
    /// # Errors
    /// Any [ConfigError] reported by [Config::validate]
    ///
    /// [interrupt handler]: crate::interrupt::InterruptHandler
    /// [ConfigError]: crate::transport::ConfigError
    /// [Config::validate]: crate::transport::Config::validate
    pub fn new(
        hw: C,
        state: &'a SharedState,
        config: Config,
        buf: Buf,
    ) -> Result<BulkOnly<'a, C, Buf>, ConfigError> {
        config.validate(buf.borrow().len())?;

        Ok(BulkOnly {
            dma: DmaEngine::new(hw, state, config),
            buf: Buffer::new(buf),
            state,
        })
    }

    pub fn session_active(&self) -> bool {
        self.state.session_active()
    }

    pub fn bulk_state(&self) -> BulkState {
        self.state.bulk_state()
    }

    pub fn controller(&self) -> &C {
        self.dma.controller()
    }

    pub fn controller_mut(&mut self) -> &mut C {
        self.dma.controller_mut()
    }

    /// Drives the transport up to a received command
    ///
    /// Returns `None` while no well-formed CBW is available. A CBW with an invalid signature
    /// is dropped without a status, and the transport starts over.
    pub fn read_command(&mut self) -> BulkOnlyResult<Option<CommandBlockWrapper>> {
        if matches!(
            self.state.bulk_state(),
            BulkState::Idle | BulkState::AwaitingCbw
        ) {
            self.enter_state(BulkState::AwaitingCbw);
            self.receive_cbw()?;
        }

        if self.state.bulk_state() != BulkState::CbwReceived {
            return Ok(None);
        }

        let cbw = self
            .buf
            .slice(0..CBW_LEN)
            .and_then(|raw| <&[u8; CBW_LEN]>::try_from(raw).ok())
            .and_then(CommandBlockWrapper::parse);

        match cbw {
            Some(cbw) => {
                info!("usb: bbb: Recv CBW: {}", cbw);
                Ok(Some(cbw))
            }
            None => {
                info!("usb: bbb: Invalid CBW signature, dropped");
                self.enter_state(BulkState::Idle);
                Ok(None)
            }
        }
    }

    /// Sends the CSW and returns to [BulkState::Idle]
    pub fn ack(&mut self, tag: u32, residue: u32, status: CommandStatus) -> BulkOnlyResult<()> {
        let csw = CommandStatusWrapper {
            tag,
            residue,
            status,
        };
        info!("usb: bbb: Send CSW: {}", csw);

        self.buf.put(0, csw.to_bytes().as_slice());
        let res = self.send_staged(CSW_LEN);
        self.enter_state(BulkState::Idle);
        res
    }

    /// Largest data phase chunk moved through the staging buffer at once
    pub fn chunk_len(&self) -> usize {
        self.buf.capacity() / BLOCK_SIZE * BLOCK_SIZE
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut Buffer<Buf> {
        &mut self.buf
    }

    /// Sends the first `len` staged bytes. Anything past the staging capacity goes out as
    /// zeros.
    pub fn send_staged(&mut self, len: usize) -> BulkOnlyResult<()> {
        let head = len.min(self.chunk_len());
        self.dma.bulk_in(&self.buf.as_slice()[..head])?;
        if len > head {
            self.send_zeros(len - head)?;
        }
        Ok(())
    }

    /// Receives `len` bytes into the staging buffer, `len` must not exceed [chunk_len]
    ///
    /// [chunk_len]: crate::transport::bbb::BulkOnly::chunk_len
    pub fn receive_staged(&mut self, len: usize) -> BulkOnlyResult<()> {
        let len = len.min(self.chunk_len());
        self.dma.bulk_out(&mut self.buf.as_mut_slice()[..len])
    }

    /// Sends a zero payload of `len` bytes
    pub fn send_zeros(&mut self, len: usize) -> BulkOnlyResult<()> {
        let chunk = self.chunk_len();
        self.buf.fill(0..chunk, 0);

        let mut remaining = len;
        while remaining > 0 {
            let count = remaining.min(chunk);
            self.dma.bulk_in(&self.buf.as_slice()[..count])?;
            remaining -= count;
        }
        Ok(())
    }

    /// Receives and drops `len` bytes
    pub fn discard(&mut self, len: usize) -> BulkOnlyResult<()> {
        let chunk = self.chunk_len();

        let mut remaining = len;
        while remaining > 0 {
            let count = remaining.min(chunk);
            self.dma.bulk_out(&mut self.buf.as_mut_slice()[..count])?;
            remaining -= count;
        }
        Ok(())
    }

    /// Forces the transport back to [BulkState::Idle]
    pub fn reset(&mut self) {
        info!("usb: bbb: Reset");
        self.enter_state(BulkState::Idle);
    }

    fn receive_cbw(&mut self) -> BulkOnlyResult<()> {
        let count = self.dma.receive_packet(self.buf.as_mut_slice())?;

        // anything but a full CBW keeps waiting for the next one
        if count == CBW_LEN && self.state.bulk_state() == BulkState::AwaitingCbw {
            self.enter_state(BulkState::CbwReceived);
        } else {
            trace!("usb: bbb: Ignored packet, len: {}", count);
        }
        Ok(())
    }

    #[inline]
    fn enter_state(&mut self, state: BulkState) {
        trace!("usb: bbb: Enter state: {}", state);
        self.state.set_bulk_state(state);
    }
}

/// Answer to a class-specific control request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// Data stage with the given bytes
    Data(&'static [u8]),
    /// Status stage only
    Accepted,
    /// Stall the control pipe
    Stall,
    /// Not a mass storage class request
    Ignored,
}

/// Handles a Bulk Only class request
///
/// Every class request marks the session active.
pub fn class_request(state: &SharedState, req: &Request) -> ControlResponse {
    // not interested in this request
    if !(req.request_type == RequestType::Class && req.recipient == Recipient::Interface) {
        return ControlResponse::Ignored;
    }

    info!(
        "usb: bbb: Class request: {}, direction in: {}",
        req.request,
        req.direction == UsbDirection::In
    );
    state.set_session_active(true);

    match (req.direction, req.request) {
        // BOT 3.2, Get Max LUN
        (UsbDirection::In, CLASS_SPECIFIC_GET_MAX_LUN) => ControlResponse::Data(&MAX_LUN),
        // BOT 3.1, Bulk-Only Mass Storage Reset
        (UsbDirection::Out, CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET) => {
            // an armed CBW receive is already the reset state
            if state.bulk_state() != BulkState::AwaitingCbw {
                state.set_bulk_state(BulkState::Idle);
            }
            ControlResponse::Accepted
        }
        _ => ControlResponse::Stall,
    }
}

/// Mass storage interface for [usb-device] based control pipes
///
/// Owns the bulk endpoint pair so the configuration descriptor carries both of them.
/// Data on those endpoints is still moved by [BulkOnly] through the controller.
///
/// [usb-device]: https://crates.io/crates/usb-device
pub struct MscClass<'a, Bus: UsbBus> {
    interface: InterfaceNumber,
    in_ep: EndpointIn<'a, Bus>,
    out_ep: EndpointOut<'a, Bus>,
    state: &'a SharedState,
}

impl<'a, Bus: UsbBus> MscClass<'a, Bus> {
    /// Creates the interface and claims the bulk endpoints named in `config`
    ///
    /// # Arguments
    /// * `alloc` - [UsbBusAllocator]
    /// * `state` - state shared with the service loop
    /// * `config` - endpoint numbers
    /// * `packet_size` - max packet size advertised for both bulk endpoints
    ///
    /// # Errors
    /// Fails if the bus cannot allocate either endpoint.
    ///
    /// [UsbBusAllocator]: usb_device::bus::UsbBusAllocator
    pub fn new(
        alloc: &'a UsbBusAllocator<Bus>,
        state: &'a SharedState,
        config: Config,
        packet_size: u16,
    ) -> usb_device::Result<Self> {
        let in_ep = alloc.alloc(
            Some(EndpointAddress::from_parts(
                config.bulk_in_ep as usize,
                UsbDirection::In,
            )),
            EndpointType::Bulk,
            packet_size,
            0,
        )?;
        let out_ep = alloc.alloc(
            Some(EndpointAddress::from_parts(
                config.bulk_out_ep as usize,
                UsbDirection::Out,
            )),
            EndpointType::Bulk,
            packet_size,
            0,
        )?;

        Ok(Self {
            interface: alloc.interface(),
            in_ep,
            out_ep,
            state,
        })
    }

    pub fn handle_request(&self, req: &Request) -> ControlResponse {
        class_request(self.state, req)
    }
}

impl<Bus: UsbBus> UsbClass<Bus> for MscClass<'_, Bus> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.interface(
            self.interface,
            CLASS_MASS_STORAGE,
            SUBCLASS_SCSI,
            TRANSPORT_BBB,
        )?;
        writer.endpoint(&self.in_ep)?;
        writer.endpoint(&self.out_ep)?;
        Ok(())
    }

    fn reset(&mut self) {
        self.state.reset();
    }

    fn control_in(&mut self, xfer: ControlIn<Bus>) {
        let req = *xfer.request();
        let res = match self.handle_request(&req) {
            ControlResponse::Data(data) => xfer.accept_with(data),
            ControlResponse::Stall => xfer.reject(),
            ControlResponse::Accepted | ControlResponse::Ignored => Ok(()),
        };
        if let Err(err) = res {
            error!("usb: bbb: Control IN {} failed: {}", req.request, err);
        }
    }

    fn control_out(&mut self, xfer: ControlOut<Bus>) {
        let req = *xfer.request();
        let res = match self.handle_request(&req) {
            ControlResponse::Accepted => xfer.accept(),
            ControlResponse::Stall => xfer.reject(),
            ControlResponse::Data(_) | ControlResponse::Ignored => Ok(()),
        };
        if let Err(err) = res {
            error!("usb: bbb: Control OUT {} failed: {}", req.request, err);
        }
    }
}
