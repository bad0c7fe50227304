#![allow(dead_code)]

use crate::common::controller::{ControlOutcome, DummyController};
use hsusbd_storage::interrupt::InterruptHandler;
use hsusbd_storage::state::SharedState;
use hsusbd_storage::storage::{BlockDevice, RamDisk, BLOCK_SIZE};
use hsusbd_storage::subclass::ufi::Ufi;
use hsusbd_storage::transport::Config;
use std::sync::mpsc::sync_channel;
use std::thread;
use std::time::Duration;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

pub mod controller;

/// Negotiated bus speeds, `true` is high speed
pub const SPEEDS: [bool; 2] = [true, false];

pub const BLOCKS: usize = 60;
pub const BUF_LEN: usize = 4096;

pub type Device = Ufi<'static, DummyController, RamDisk<Vec<u8>>, Vec<u8>>;

/// Brings up an attached, reset and started device with a 60 block RAM disk
pub fn setup(high_speed: bool) -> (Device, DummyController) {
    setup_with(
        high_speed,
        BUF_LEN,
        RamDisk::new(vec![0u8; BLOCKS * BLOCK_SIZE]),
    )
}

/// Same as [setup] with a custom IO buffer length and backing store
pub fn setup_with<D: BlockDevice>(
    high_speed: bool,
    buf_len: usize,
    storage: D,
) -> (Ufi<'static, DummyController, D, Vec<u8>>, DummyController) {
    let state: &'static SharedState = Box::leak(Box::new(SharedState::new(0)));
    let config = Config::default();
    let hw = DummyController::new(state, config, high_speed);

    let mut irq = InterruptHandler::new(hw.clone(), state, config);
    irq.init();
    assert!(irq.start());
    hw.bus_reset(high_speed);
    assert_eq!(ControlOutcome::Data(vec![0]), hw.control(get_max_lun()));

    let ufi = Ufi::new(hw.clone(), state, config, vec![0u8; buf_len], storage).unwrap();

    (ufi, hw)
}

pub fn class_request(direction: UsbDirection, request: u8) -> Request {
    Request {
        direction,
        request_type: RequestType::Class,
        recipient: Recipient::Interface,
        request,
        value: 0,
        index: 0,
        length: if direction == UsbDirection::In { 1 } else { 0 },
    }
}

pub fn get_max_lun() -> Request {
    class_request(UsbDirection::In, 0xFE)
}

pub fn mass_storage_reset() -> Request {
    class_request(UsbDirection::Out, 0xFF)
}

pub fn timeout<F, T>(timeout: Duration, f: F)
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = sync_channel(0);
    thread::spawn(move || {
        f();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(timeout).expect("timeout");
}
