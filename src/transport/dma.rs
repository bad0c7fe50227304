//! DMA-driven bulk endpoint transfers
//!
//! All transfers go through the single DMA channel of the controller. Every call blocks
//! until the interrupt handler reports completion, the link detaches or the session ends.

use crate::fmt::{trace, warning};
use crate::hal::{
    BusInterrupts, Controller, DmaBuffer, DmaDirection, EndpointInterrupts, ResponseControl,
    BULK_IN, BULK_OUT,
};
use crate::state::SharedState;
use crate::transport::{Config, TransferError};

/// Bus events that have to stay enabled while a transfer is in flight
const TRANSFER_BUS_EVENTS: BusInterrupts = BusInterrupts::DMA_DONE
    .union(BusInterrupts::SUSPEND)
    .union(BusInterrupts::RESET)
    .union(BusInterrupts::VBUS_DETECT);

type DmaResult<T> = Result<T, TransferError>;

pub struct DmaEngine<'a, C: Controller> {
    hw: C,
    state: &'a SharedState,
    config: Config,
}

impl<'a, C: Controller> DmaEngine<'a, C> {
    pub fn new(hw: C, state: &'a SharedState, config: Config) -> Self {
        Self { hw, state, config }
    }

    pub fn controller(&self) -> &C {
        &self.hw
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.hw
    }

    pub fn state(&self) -> &'a SharedState {
        self.state
    }

    /// Runs a single DMA transfer over `buf`
    ///
    /// This is the only place the DMA channel is triggered for data phases. On cancellation
    /// the channel is reset so `buf` is no longer referenced by the controller.
    pub fn run_dma(&mut self, buf: DmaBuffer<'_>) -> DmaResult<()> {
        trace!("usb: dma: Start, len: {}", buf.len());

        self.hw.enable_bus_interrupts(TRANSFER_BUS_EVENTS);
        // a stale flag from the previous transfer must not complete this one
        self.state.set_dma_done(false);
        // SAFETY: `buf` is borrowed for the whole call, and the wait below either observes
        // completion or resets the channel before returning
        unsafe { self.hw.start_dma(buf) };

        let res = self.wait(|_, state| state.dma_done());
        if res.is_err() {
            self.hw.reset_dma();
        }
        res
    }

    /// Sends `data` over the bulk-IN endpoint
    ///
    /// `data` goes out in chunks of the max DMA length, then whole packets, then a final
    /// partial packet which is terminated as a short packet. A length that is an exact
    /// multiple of the packet size is not followed by a zero-length packet.
    pub fn bulk_in(&mut self, data: &[u8]) -> DmaResult<()> {
        self.hw.set_dma(DmaDirection::Read, self.config.bulk_in_ep);

        let packet_size = (self.state.max_packet_size() as usize).max(1);
        let mut chunks = data.chunks_exact(self.config.max_dma_len);
        for chunk in &mut chunks {
            self.in_chunk(chunk, false)?;
        }

        let rest = chunks.remainder();
        let whole = rest.len() / packet_size * packet_size;
        if whole > 0 {
            self.in_chunk(&rest[..whole], false)?;
        }
        if whole < rest.len() {
            self.in_chunk(&rest[whole..], true)?;
        }
        Ok(())
    }

    /// Receives `data.len()` bytes from the bulk-OUT endpoint
    pub fn bulk_out(&mut self, data: &mut [u8]) -> DmaResult<()> {
        self.hw.set_dma(DmaDirection::Write, self.config.bulk_out_ep);

        for chunk in data.chunks_mut(self.config.max_dma_len) {
            self.run_dma(DmaBuffer::Write(chunk))?;
        }
        Ok(())
    }

    /// Receives a single packet into `dst`, returning the number of bytes the endpoint held
    ///
    /// Double buffering is disabled for the duration of the call so a short packet is
    /// reported immediately. The packet is drained from the endpoint buffer byte by byte.
    pub fn receive_packet(&mut self, dst: &mut [u8]) -> DmaResult<usize> {
        self.hw.set_dma(DmaDirection::Write, self.config.bulk_out_ep);
        self.state.set_out_short_pending(true);
        self.hw
            .set_response_control(BULK_OUT, ResponseControl::DISABLE_BUFFER);
        self.hw
            .enable_endpoint_interrupts(BULK_OUT, EndpointInterrupts::SHORT_RX);
        self.hw.enable_bus_interrupts(TRANSFER_BUS_EVENTS);

        let window = (self.state.max_packet_size() as usize).min(dst.len());
        self.state.set_dma_done(false);
        // SAFETY: the channel is reset below before `dst` is touched again
        unsafe { self.hw.start_dma(DmaBuffer::Write(&mut dst[..window])) };

        let res = self.wait(|_, state| !state.out_short_pending());

        let count = self.hw.out_data_count(BULK_OUT);
        for i in 0..count {
            let byte = self.hw.read_fifo_byte(BULK_OUT);
            if let Some(slot) = dst.get_mut(i) {
                *slot = byte;
            }
        }
        if count > dst.len() {
            warning!("usb: dma: Packet truncated: {} > {}", count, dst.len());
        }

        self.hw.reset_dma();
        self.hw
            .set_response_control(BULK_OUT, ResponseControl::empty());

        trace!("usb: dma: Received packet, len: {}", count);
        res.map(|_| count)
    }

    fn in_chunk(&mut self, chunk: &[u8], short: bool) -> DmaResult<()> {
        self.hw
            .enable_endpoint_interrupts(BULK_IN, EndpointInterrupts::TX_PACKET);
        self.state.set_in_short_packet(short);
        self.wait(|hw, _| {
            hw.endpoint_status(BULK_IN)
                .contains(EndpointInterrupts::BUFFER_EMPTY)
        })?;
        self.run_dma(DmaBuffer::Read(chunk))
    }

    /// Blocks until `ready` holds
    ///
    /// Ends early with an error once the session is over or the link is detached. There
    /// is no timeout.
    fn wait(&mut self, mut ready: impl FnMut(&C, &SharedState) -> bool) -> DmaResult<()> {
        loop {
            if !self.state.session_active() {
                return Err(TransferError::SessionEnded);
            }
            if ready(&self.hw, self.state) {
                return Ok(());
            }
            if !self.hw.is_attached() {
                return Err(TransferError::Detached);
            }
            self.hw.wait_for_interrupt();
        }
    }
}
