//! Interrupt/event layer
//!
//! [InterruptHandler::on_interrupt] is meant to be called from the controller's interrupt
//! vector. It runs to completion, only flips [SharedState] flags and acknowledges status
//! bits, and never blocks. Every status bit it acts on is written back right away, a bit
//! left set re-raises the interrupt immediately.

use crate::fmt::{debug, info, trace};
use crate::hal::{
    BusInterrupts, ControlInterrupts, ControlState, Controller, DmaDirection, Endpoint,
    EndpointConfig, EndpointDirection, EndpointInterrupts, GlobalInterrupts, ResponseControl,
    BULK_IN, BULK_OUT,
};
use crate::state::SharedState;
use crate::transport::Config;

/// Control endpoint events in the order they are served, one per interrupt
const CONTROL_EVENTS: [ControlInterrupts; 13] = [
    ControlInterrupts::SETUP_TOKEN,
    ControlInterrupts::SETUP_PACKET,
    ControlInterrupts::OUT_TOKEN,
    ControlInterrupts::IN_TOKEN,
    ControlInterrupts::PING,
    ControlInterrupts::TX_PACKET,
    ControlInterrupts::RX_PACKET,
    ControlInterrupts::NAK,
    ControlInterrupts::STALL,
    ControlInterrupts::ERROR,
    ControlInterrupts::STATUS_DONE,
    ControlInterrupts::BUFFER_FULL,
    ControlInterrupts::BUFFER_EMPTY,
];

pub struct InterruptHandler<'a, C: Controller> {
    hw: C,
    state: &'a SharedState,
    config: Config,
}

impl<'a, C: Controller> InterruptHandler<'a, C> {
    pub fn new(hw: C, state: &'a SharedState, config: Config) -> Self {
        Self { hw, state, config }
    }

    pub fn controller(&self) -> &C {
        &self.hw
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.hw
    }

    /// Enables the interrupt groups the engine serves and configures the endpoints for
    /// high speed
    pub fn init(&mut self) {
        info!("usb: irq: Init");

        self.hw.enable_global_interrupts(
            GlobalInterrupts::USB
                | GlobalInterrupts::CONTROL
                | GlobalInterrupts::endpoint(BULK_IN)
                | GlobalInterrupts::endpoint(BULK_OUT),
        );
        self.hw.enable_bus_interrupts(
            BusInterrupts::DMA_DONE
                | BusInterrupts::RESUME
                | BusInterrupts::RESET
                | BusInterrupts::VBUS_DETECT,
        );
        self.hw.set_address(0);
        self.hw.enable_control_interrupts(
            ControlInterrupts::SETUP_PACKET | ControlInterrupts::STATUS_DONE,
        );

        self.configure_endpoints(true);
    }

    /// Enables the controller once the link is attached, returns whether it was
    pub fn start(&mut self) -> bool {
        let attached = self.hw.is_attached();
        if attached {
            self.hw.set_enabled(true);
        }
        attached
    }

    /// Sets up the bulk endpoint pair for the negotiated speed
    pub fn configure_endpoints(&mut self, high_speed: bool) {
        let max_packet_size = self.config.packet_size(high_speed);
        debug!(
            "usb: irq: Endpoints, high speed: {}, packet size: {}",
            high_speed, max_packet_size
        );

        self.hw.configure_endpoint(
            BULK_IN,
            EndpointConfig {
                number: self.config.bulk_in_ep,
                direction: EndpointDirection::In,
                max_packet_size,
            },
        );
        self.hw.configure_endpoint(
            BULK_OUT,
            EndpointConfig {
                number: self.config.bulk_out_ep,
                direction: EndpointDirection::Out,
                max_packet_size,
            },
        );
        self.hw
            .enable_endpoint_interrupts(BULK_OUT, EndpointInterrupts::RX_PACKET);

        self.state.set_max_packet_size(max_packet_size);
    }

    pub fn on_interrupt(&mut self) {
        let global = self.hw.global_interrupts();
        if global.is_empty() {
            return;
        }

        if global.contains(GlobalInterrupts::USB) {
            self.on_bus_event();
        }

        // a served control event ends the interrupt
        if global.contains(GlobalInterrupts::CONTROL) && self.on_control_event() {
            return;
        }

        if global.contains(GlobalInterrupts::endpoint(BULK_IN)) {
            let status = self.hw.endpoint_interrupts(BULK_IN);
            self.hw
                .enable_endpoint_interrupts(BULK_IN, EndpointInterrupts::empty());
            self.hw.clear_endpoint_interrupts(BULK_IN, status);
        }

        if global.contains(GlobalInterrupts::endpoint(BULK_OUT)) {
            let status = self.hw.endpoint_interrupts(BULK_OUT);
            if status.contains(EndpointInterrupts::SHORT_RX) {
                self.state.set_out_short_pending(false);
            }
            self.hw
                .enable_endpoint_interrupts(BULK_OUT, EndpointInterrupts::empty());
            self.hw.clear_endpoint_interrupts(BULK_OUT, status);
        }

        for ep in Endpoint::ALL.into_iter().skip(2) {
            if global.contains(GlobalInterrupts::endpoint(ep)) {
                let status = self.hw.endpoint_interrupts(ep);
                self.hw.clear_endpoint_interrupts(ep, status);
            }
        }
    }

    fn on_bus_event(&mut self) {
        let status = self.hw.bus_interrupts();

        if status.contains(BusInterrupts::SOF) {
            self.hw.clear_bus_interrupts(BusInterrupts::SOF);
        }

        if status.contains(BusInterrupts::RESET) {
            self.bus_reset();
        }

        if status.contains(BusInterrupts::RESUME) {
            trace!("usb: irq: Resume");
            self.hw
                .enable_bus_interrupts(BusInterrupts::RESET | BusInterrupts::SUSPEND);
            self.hw.clear_bus_interrupts(BusInterrupts::RESUME);
        }

        if status.contains(BusInterrupts::SUSPEND) {
            trace!("usb: irq: Suspend");
            self.hw
                .enable_bus_interrupts(BusInterrupts::RESET | BusInterrupts::RESUME);
            self.hw.clear_bus_interrupts(BusInterrupts::SUSPEND);
        }

        if status.contains(BusInterrupts::HIGH_SPEED) {
            self.hw
                .enable_control_interrupts(ControlInterrupts::SETUP_PACKET);
            self.hw.clear_bus_interrupts(BusInterrupts::HIGH_SPEED);
        }

        if status.contains(BusInterrupts::DMA_DONE) {
            self.dma_done();
        }

        if status.contains(BusInterrupts::PHY_CLOCK_VALID) {
            self.hw.clear_bus_interrupts(BusInterrupts::PHY_CLOCK_VALID);
        }

        if status.contains(BusInterrupts::VBUS_DETECT) {
            let attached = self.hw.is_attached();
            info!("usb: irq: VBUS, attached: {}", attached);
            self.hw.set_enabled(attached);
            self.hw.clear_bus_interrupts(BusInterrupts::VBUS_DETECT);
        }
    }

    fn bus_reset(&mut self) {
        info!("usb: irq: Bus reset");

        self.hw.software_reset();
        // ends the session first so blocked transfers leave their waits
        self.state.reset();

        self.hw.reset_dma();
        self.hw.set_response_control(BULK_IN, ResponseControl::FLUSH);
        self.hw.set_response_control(BULK_OUT, ResponseControl::FLUSH);

        let high_speed = self.hw.is_high_speed();
        self.configure_endpoints(high_speed);

        self.hw
            .enable_control_interrupts(ControlInterrupts::SETUP_PACKET);
        self.hw.set_address(0);
        self.hw.enable_bus_interrupts(
            BusInterrupts::RESET | BusInterrupts::RESUME | BusInterrupts::SUSPEND,
        );
        self.hw.clear_bus_interrupts(BusInterrupts::RESET);
        self.hw.clear_control_interrupts(
            ControlInterrupts::all()
                .difference(ControlInterrupts::SETUP_TOKEN | ControlInterrupts::SETUP_PACKET),
        );
    }

    fn dma_done(&mut self) {
        self.state.set_dma_done(true);
        self.hw.clear_bus_interrupts(BusInterrupts::DMA_DONE);

        match self.hw.dma_direction() {
            DmaDirection::Write => {
                if !self.state.out_short_pending() {
                    self.hw
                        .enable_endpoint_interrupts(BULK_OUT, EndpointInterrupts::RX_PACKET);
                }
            }
            DmaDirection::Read => {
                if self.state.in_short_packet() {
                    // packet end
                    let halt = self.hw.response_control(BULK_IN) & ResponseControl::HALT;
                    self.hw
                        .set_response_control(BULK_IN, halt | ResponseControl::SHORT_TX);
                    self.state.set_in_short_packet(false);
                }
            }
        }
    }

    /// Serves the highest priority control event, returns whether there was one
    fn on_control_event(&mut self) -> bool {
        let status = self.hw.control_interrupts();
        let event = match CONTROL_EVENTS.into_iter().find(|ev| status.contains(*ev)) {
            Some(event) => event,
            None => return false,
        };

        if event == ControlInterrupts::SETUP_PACKET {
            self.hw.clear_control_interrupts(event);
            self.hw.process_setup();
        } else if event == ControlInterrupts::OUT_TOKEN {
            self.hw.clear_control_interrupts(event);
            self.hw
                .enable_control_interrupts(ControlInterrupts::STATUS_DONE);
        } else if event == ControlInterrupts::IN_TOKEN {
            self.hw.clear_control_interrupts(event);
            self.hw
                .clear_control_interrupts(ControlInterrupts::TX_PACKET);
            if status.contains(ControlInterrupts::STATUS_DONE) {
                self.hw.enable_control_interrupts(
                    ControlInterrupts::TX_PACKET | ControlInterrupts::STATUS_DONE,
                );
            } else {
                self.hw
                    .enable_control_interrupts(ControlInterrupts::TX_PACKET);
                self.hw.control_in();
            }
        } else if event == ControlInterrupts::TX_PACKET {
            self.hw
                .clear_control_interrupts(ControlInterrupts::STATUS_DONE);
            self.hw.set_control_state(ControlState::NakClear);
            if self.hw.control_in_pending() {
                self.hw
                    .clear_control_interrupts(ControlInterrupts::IN_TOKEN);
                self.hw
                    .enable_control_interrupts(ControlInterrupts::IN_TOKEN);
            } else {
                self.hw.enable_control_interrupts(
                    ControlInterrupts::SETUP_PACKET | ControlInterrupts::STATUS_DONE,
                );
            }
            self.hw.clear_control_interrupts(event);
        } else if event == ControlInterrupts::RX_PACKET {
            self.hw.clear_control_interrupts(event);
            self.hw.set_control_state(ControlState::NakClear);
            self.hw.enable_control_interrupts(
                ControlInterrupts::SETUP_PACKET | ControlInterrupts::STATUS_DONE,
            );
        } else if event == ControlInterrupts::STATUS_DONE {
            self.hw.update_device_state();
            self.hw.clear_control_interrupts(event);
            self.hw
                .enable_control_interrupts(ControlInterrupts::SETUP_PACKET);
        } else {
            // setup token, ping, NAK, stall, error and buffer events are only acknowledged
            self.hw.clear_control_interrupts(event);
        }
        true
    }
}
