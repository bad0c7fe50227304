use crate::common::bbb::{Cbw, Csw, CSW_LEN};
use hsusbd_storage::hal::{
    BusInterrupts, ControlInterrupts, ControlState, Controller, DmaBuffer, DmaDirection,
    Endpoint, EndpointConfig, EndpointInterrupts, GlobalInterrupts, ResponseControl, BULK_IN,
    BULK_OUT,
};
use hsusbd_storage::interrupt::InterruptHandler;
use hsusbd_storage::state::SharedState;
use hsusbd_storage::transport::bbb::{class_request, ControlResponse};
use hsusbd_storage::transport::Config;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use usb_device::control::Request;

/// Upper bound of interrupts served back to back before the test is considered stuck
const MAX_INTERRUPT_BURST: usize = 64;

/// What happens instead of the n-th DMA transfer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaFault {
    /// The link drops, the transfer never completes
    Detach,
    /// The host resets the bus, the transfer never completes
    BusReset,
}

/// Outcome of a control transfer as seen by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Data(Vec<u8>),
    Ack,
    Stall,
}

/// Register-level model of the device controller plus the host side of the bulk pipes
///
/// DMA transfers complete as soon as they start and raise the same status bits the real
/// controller would. Interrupts are served synchronously from [Controller::wait_for_interrupt].
#[derive(Clone)]
pub struct DummyController {
    inner: Arc<Mutex<Inner>>,
    state: &'static SharedState,
    config: Config,
}

impl DummyController {
    pub fn new(state: &'static SharedState, config: Config, high_speed: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new(high_speed))),
            state,
            config,
        }
    }

    /// Serves pending interrupts the way the interrupt vector would
    pub fn interrupt(&self) {
        for _ in 0..MAX_INTERRUPT_BURST {
            if !self.interrupt_pending() {
                return;
            }
            InterruptHandler::new(self.clone(), self.state, self.config).on_interrupt();
        }
        panic!("interrupt storm");
    }

    fn interrupt_pending(&self) -> bool {
        !self.global_interrupts().is_empty()
    }

    /// Bus reset signalled by the host, negotiating `high_speed`
    pub fn bus_reset(&self, high_speed: bool) {
        {
            let mut lock = self.inner.lock().unwrap();
            lock.high_speed = high_speed;
            lock.bus_status |= BusInterrupts::RESET;
        }
        self.interrupt();
    }

    /// Runs a control transfer as if it was sent by a USB host
    pub fn control(&self, req: Request) -> ControlOutcome {
        {
            let mut lock = self.inner.lock().unwrap();
            lock.control_state = None;
            lock.control_received.clear();
            lock.setup = Some(req);
            lock.control_status |= ControlInterrupts::SETUP_PACKET;
        }
        self.interrupt();

        let stalled = self.inner.lock().unwrap().control_state == Some(ControlState::Stall);
        if stalled {
            return ControlOutcome::Stall;
        }

        // status stage
        self.inner.lock().unwrap().control_status |= ControlInterrupts::STATUS_DONE;
        self.interrupt();

        let lock = self.inner.lock().unwrap();
        if lock.control_received.is_empty() {
            ControlOutcome::Ack
        } else {
            ControlOutcome::Data(lock.control_received.clone())
        }
    }

    /// Plugs or unplugs the cable
    pub fn set_attached(&self, attached: bool) {
        {
            let mut lock = self.inner.lock().unwrap();
            lock.attached = attached;
            lock.bus_status |= BusInterrupts::VBUS_DETECT;
        }
        self.interrupt();
    }

    /// Makes the `n`-th DMA transfer from now on (1-based) fail with `fault`. CBW receives
    /// count as DMA transfers.
    pub fn fail_dma(&self, n: usize, fault: DmaFault) {
        let mut lock = self.inner.lock().unwrap();
        lock.fault = Some((lock.dma_count + n, fault));
    }

    pub fn dma_count(&self) -> usize {
        self.inner.lock().unwrap().dma_count
    }

    pub fn software_resets(&self) -> usize {
        self.inner.lock().unwrap().software_resets
    }

    pub fn status_stages(&self) -> usize {
        self.inner.lock().unwrap().status_stages
    }

    pub fn address(&self) -> u8 {
        self.inner.lock().unwrap().address
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    pub fn packet_size(&self, ep: Endpoint) -> Option<u16> {
        self.inner.lock().unwrap().ep_config[ep as usize].map(|c| c.max_packet_size)
    }

    /// Write Command Block Wrapper as if it was written by a USB host
    pub fn write_cbw(&self, cbw: Cbw) {
        self.write_packet(cbw.into_bytes().as_slice());
    }

    /// Write a single packet as if it was written by a USB host
    pub fn write_packet(&self, packet: &[u8]) {
        let mut lock = self.inner.lock().unwrap();
        lock.out_packets.push_back(packet.to_vec());
        lock.ep_status[BULK_OUT as usize] |= EndpointInterrupts::RX_PACKET;
    }

    /// Write some data as if it was written by a USB host during Host to Device data transfer
    pub fn write_data(&self, data: &[u8]) {
        let packet_size = self.packet_size(BULK_OUT).unwrap() as usize;
        for chunk in data.chunks(packet_size) {
            self.write_packet(chunk);
        }
    }

    /// Read a single packet as if it was read by a USB host during Device to Host data transfer
    pub fn read_packet(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().in_packets.pop_front()
    }

    /// Read packets until `n` bytes arrived
    pub fn read_packets(&self, n: usize) -> Vec<Vec<u8>> {
        let mut packets = vec![];
        let mut len = 0;
        while len < n {
            match self.read_packet() {
                Some(packet) => {
                    len += packet.len();
                    packets.push(packet);
                }
                None => break,
            }
        }
        packets
    }

    pub fn read_data(&self, n: usize) -> Vec<u8> {
        self.read_packets(n).concat()
    }

    /// Read Command Status as if it was read by a USB host
    pub fn read_csw(&self) -> Option<Csw> {
        let packet = self.read_packet()?;
        assert_eq!(CSW_LEN, packet.len(), "CSW must be a single short packet");
        Some(Csw::from_bytes(packet.as_slice()))
    }

    pub fn in_queue_is_empty(&self) -> bool {
        let lock = self.inner.lock().unwrap();
        lock.in_packets.is_empty() && lock.in_partial.is_empty()
    }

    pub fn out_queue_len(&self) -> usize {
        self.inner.lock().unwrap().out_packets.len()
    }
}

struct Inner {
    global_enable: GlobalInterrupts,
    bus_status: BusInterrupts,
    bus_enable: BusInterrupts,
    control_status: ControlInterrupts,
    control_enable: ControlInterrupts,
    ep_status: [EndpointInterrupts; 12],
    ep_enable: [EndpointInterrupts; 12],
    ep_config: [Option<EndpointConfig>; 12],
    response: [ResponseControl; 12],

    dma_direction: DmaDirection,
    dma_ep: u8,
    dma_count: usize,
    fault: Option<(usize, DmaFault)>,

    attached: bool,
    enabled: bool,
    high_speed: bool,
    address: u8,
    software_resets: usize,

    control_state: Option<ControlState>,
    setup: Option<Request>,
    control_in_data: Vec<u8>,
    control_received: Vec<u8>,
    status_stages: usize,

    /// Complete packets the host can read
    in_packets: VecDeque<Vec<u8>>,
    /// Partial packet waiting in the IN buffer
    in_partial: Vec<u8>,
    /// Packets written by the host
    out_packets: VecDeque<Vec<u8>>,
    /// OUT buffer drained byte by byte
    out_fifo: VecDeque<u8>,
}

impl Inner {
    fn new(high_speed: bool) -> Self {
        Self {
            global_enable: GlobalInterrupts::empty(),
            bus_status: BusInterrupts::empty(),
            bus_enable: BusInterrupts::empty(),
            control_status: ControlInterrupts::empty(),
            control_enable: ControlInterrupts::empty(),
            ep_status: [EndpointInterrupts::empty(); 12],
            ep_enable: [EndpointInterrupts::empty(); 12],
            ep_config: [None; 12],
            response: [ResponseControl::empty(); 12],
            dma_direction: DmaDirection::Read,
            dma_ep: 0,
            dma_count: 0,
            fault: None,
            attached: true,
            enabled: false,
            high_speed,
            address: 0xFF,
            software_resets: 0,
            control_state: None,
            setup: None,
            control_in_data: vec![],
            control_received: vec![],
            status_stages: 0,
            in_packets: VecDeque::new(),
            in_partial: vec![],
            out_packets: VecDeque::new(),
            out_fifo: VecDeque::new(),
        }
    }

    fn packet_size(&self, ep: Endpoint) -> usize {
        self.ep_config[ep as usize]
            .map(|c| c.max_packet_size as usize)
            .expect("endpoint not configured")
    }

    fn raw_endpoint_status(&self, ep: Endpoint) -> EndpointInterrupts {
        let mut status = self.ep_status[ep as usize];
        if ep == BULK_IN && self.in_partial.is_empty() {
            status |= EndpointInterrupts::BUFFER_EMPTY;
        }
        status
    }

    fn dma_done(&mut self) {
        self.bus_status |= BusInterrupts::DMA_DONE;
    }

    fn dma_read(&mut self, data: &[u8]) {
        assert_eq!(self.ep_config[BULK_IN as usize].map(|c| c.number), Some(self.dma_ep));
        let packet_size = self.packet_size(BULK_IN);

        self.in_partial.extend_from_slice(data);
        while self.in_partial.len() >= packet_size {
            let packet = self.in_partial.drain(..packet_size).collect();
            self.in_packets.push_back(packet);
        }

        self.ep_status[BULK_IN as usize] |= EndpointInterrupts::TX_PACKET;
        self.dma_done();
    }

    fn dma_write(&mut self, dst: &mut [u8]) {
        assert_eq!(self.ep_config[BULK_OUT as usize].map(|c| c.number), Some(self.dma_ep));
        let packet_size = self.packet_size(BULK_OUT);

        if self.response[BULK_OUT as usize].contains(ResponseControl::DISABLE_BUFFER) {
            let packet = self
                .out_packets
                .pop_front()
                .expect("device blocked: no packet from host");
            if packet.len() < packet_size {
                self.out_fifo.extend(packet);
                self.ep_status[BULK_OUT as usize] |= EndpointInterrupts::SHORT_RX;
            } else {
                dst[..packet.len()].copy_from_slice(&packet);
                self.dma_done();
            }
            return;
        }

        let mut at = 0;
        while at < dst.len() {
            let mut packet = self
                .out_packets
                .pop_front()
                .expect("device blocked: not enough data from host");
            let count = packet.len().min(dst.len() - at);
            dst[at..at + count].copy_from_slice(&packet[..count]);
            at += count;
            if count < packet.len() {
                self.out_packets.push_front(packet.split_off(count));
            }
        }
        self.dma_done();
    }
}

impl Controller for DummyController {
    fn global_interrupts(&self) -> GlobalInterrupts {
        let lock = self.inner.lock().unwrap();

        let mut global = GlobalInterrupts::empty();
        if !(lock.bus_status & lock.bus_enable).is_empty() {
            global |= GlobalInterrupts::USB;
        }
        if !(lock.control_status & lock.control_enable).is_empty() {
            global |= GlobalInterrupts::CONTROL;
        }
        for ep in Endpoint::ALL {
            if !(lock.raw_endpoint_status(ep) & lock.ep_enable[ep as usize]).is_empty() {
                global |= GlobalInterrupts::endpoint(ep);
            }
        }
        global & lock.global_enable
    }

    fn enable_global_interrupts(&mut self, flags: GlobalInterrupts) {
        self.inner.lock().unwrap().global_enable = flags;
    }

    fn bus_interrupts(&self) -> BusInterrupts {
        let lock = self.inner.lock().unwrap();
        lock.bus_status & lock.bus_enable
    }

    fn clear_bus_interrupts(&mut self, flags: BusInterrupts) {
        self.inner.lock().unwrap().bus_status.remove(flags);
    }

    fn enable_bus_interrupts(&mut self, flags: BusInterrupts) {
        self.inner.lock().unwrap().bus_enable = flags;
    }

    fn control_interrupts(&self) -> ControlInterrupts {
        let lock = self.inner.lock().unwrap();
        lock.control_status & lock.control_enable
    }

    fn clear_control_interrupts(&mut self, flags: ControlInterrupts) {
        self.inner.lock().unwrap().control_status.remove(flags);
    }

    fn enable_control_interrupts(&mut self, flags: ControlInterrupts) {
        self.inner.lock().unwrap().control_enable = flags;
    }

    fn endpoint_interrupts(&self, ep: Endpoint) -> EndpointInterrupts {
        let lock = self.inner.lock().unwrap();
        lock.raw_endpoint_status(ep) & lock.ep_enable[ep as usize]
    }

    fn endpoint_status(&self, ep: Endpoint) -> EndpointInterrupts {
        self.inner.lock().unwrap().raw_endpoint_status(ep)
    }

    fn clear_endpoint_interrupts(&mut self, ep: Endpoint, flags: EndpointInterrupts) {
        self.inner.lock().unwrap().ep_status[ep as usize].remove(flags);
    }

    fn enable_endpoint_interrupts(&mut self, ep: Endpoint, flags: EndpointInterrupts) {
        self.inner.lock().unwrap().ep_enable[ep as usize] = flags;
    }

    fn configure_endpoint(&mut self, ep: Endpoint, config: EndpointConfig) {
        self.inner.lock().unwrap().ep_config[ep as usize] = Some(config);
    }

    fn response_control(&self, ep: Endpoint) -> ResponseControl {
        self.inner.lock().unwrap().response[ep as usize]
    }

    fn set_response_control(&mut self, ep: Endpoint, ctrl: ResponseControl) {
        let mut lock = self.inner.lock().unwrap();

        if ctrl.contains(ResponseControl::FLUSH) {
            if ep == BULK_IN {
                lock.in_partial.clear();
            } else if ep == BULK_OUT {
                lock.out_fifo.clear();
            }
        }
        if ctrl.contains(ResponseControl::SHORT_TX) && !lock.in_partial.is_empty() {
            let packet = std::mem::take(&mut lock.in_partial);
            lock.in_packets.push_back(packet);
        }

        // flush and short packet transmit are strobes
        lock.response[ep as usize] =
            ctrl.difference(ResponseControl::FLUSH | ResponseControl::SHORT_TX);
    }

    fn out_data_count(&self, _ep: Endpoint) -> usize {
        self.inner.lock().unwrap().out_fifo.len()
    }

    fn read_fifo_byte(&mut self, _ep: Endpoint) -> u8 {
        self.inner.lock().unwrap().out_fifo.pop_front().unwrap_or(0)
    }

    fn set_dma(&mut self, direction: DmaDirection, ep_number: u8) {
        let mut lock = self.inner.lock().unwrap();
        lock.dma_direction = direction;
        lock.dma_ep = ep_number;
    }

    fn dma_direction(&self) -> DmaDirection {
        self.inner.lock().unwrap().dma_direction
    }

    unsafe fn start_dma(&mut self, buf: DmaBuffer<'_>) {
        let mut lock = self.inner.lock().unwrap();
        lock.dma_count += 1;

        if let Some((n, fault)) = lock.fault {
            if n == lock.dma_count {
                lock.fault = None;
                match fault {
                    DmaFault::Detach => lock.attached = false,
                    DmaFault::BusReset => lock.bus_status |= BusInterrupts::RESET,
                }
                return;
            }
        }

        match buf {
            DmaBuffer::Read(data) => {
                assert_eq!(DmaDirection::Read, lock.dma_direction);
                lock.dma_read(data);
            }
            DmaBuffer::Write(dst) => {
                assert_eq!(DmaDirection::Write, lock.dma_direction);
                lock.dma_write(dst);
            }
        }
    }

    fn reset_dma(&mut self) {}

    fn is_attached(&self) -> bool {
        self.inner.lock().unwrap().attached
    }

    fn is_high_speed(&self) -> bool {
        self.inner.lock().unwrap().high_speed
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.inner.lock().unwrap().enabled = enabled;
    }

    fn software_reset(&mut self) {
        let mut lock = self.inner.lock().unwrap();
        lock.software_resets += 1;
        lock.in_packets.clear();
    }

    fn set_address(&mut self, addr: u8) {
        self.inner.lock().unwrap().address = addr;
    }

    fn set_control_state(&mut self, state: ControlState) {
        self.inner.lock().unwrap().control_state = Some(state);
    }

    fn process_setup(&mut self) {
        let req = self.inner.lock().unwrap().setup.take().expect("no setup packet");

        let mut lock = self.inner.lock().unwrap();
        match class_request(self.state, &req) {
            ControlResponse::Data(data) => {
                lock.control_in_data = data.to_vec();
                lock.control_status |= ControlInterrupts::IN_TOKEN;
                lock.control_enable = ControlInterrupts::IN_TOKEN;
            }
            ControlResponse::Stall => {
                lock.control_state = Some(ControlState::Stall);
            }
            ControlResponse::Accepted | ControlResponse::Ignored => {
                lock.control_state = Some(ControlState::NakClear);
                lock.control_enable = ControlInterrupts::STATUS_DONE;
            }
        }
    }

    fn control_in(&mut self) {
        let mut lock = self.inner.lock().unwrap();
        let data = std::mem::take(&mut lock.control_in_data);
        lock.control_received.extend(data);
        lock.control_status |= ControlInterrupts::TX_PACKET;
    }

    fn control_in_pending(&self) -> bool {
        !self.inner.lock().unwrap().control_in_data.is_empty()
    }

    fn update_device_state(&mut self) {
        self.inner.lock().unwrap().status_stages += 1;
    }

    fn wait_for_interrupt(&mut self) {
        assert!(
            self.interrupt_pending(),
            "device blocked: no interrupt pending"
        );
        InterruptHandler::new(self.clone(), self.state, self.config).on_interrupt();
    }
}
