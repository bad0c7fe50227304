//! USB Floppy Interface

use crate::fmt::{debug, error, info, warning};
use crate::hal::Controller;
use crate::state::SharedState;
use crate::storage::{BlockDevice, BlockDeviceError, BLOCK_SIZE};
use crate::transport::bbb::{BulkOnly, CommandBlockWrapper, DataDirection};
use crate::transport::{CommandStatus, Config, ConfigError, TransferError};
use core::borrow::BorrowMut;
use num_enum::TryFromPrimitive;

/* UFI codes */
const TEST_UNIT_READY: u8 = 0x00;
const REZERO_UNIT: u8 = 0x01;
const REQUEST_SENSE: u8 = 0x03;
const FORMAT_UNIT: u8 = 0x04;
const INQUIRY: u8 = 0x12;
const MODE_SENSE_6: u8 = 0x1A;
const START_STOP: u8 = 0x1B;
const SEND_DIAGNOSTIC: u8 = 0x1D;
const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
const READ_FORMAT_CAPACITIES: u8 = 0x23;
const READ_CAPACITY: u8 = 0x25;
const READ_10: u8 = 0x28;
const WRITE_10: u8 = 0x2A;
const SEEK_10: u8 = 0x2B;
const WRITE_AND_VERIFY: u8 = 0x2E;
const VERIFY: u8 = 0x2F;
const MODE_SELECT: u8 = 0x55;
const MODE_SENSE: u8 = 0x5A;
const READ_12: u8 = 0xA8;
const WRITE_12: u8 = 0xAA;

/* Mode pages */
const PAGE_ERROR_RECOVERY: u8 = 0x01;
const PAGE_FLEXIBLE_DISK: u8 = 0x05;
const PAGE_REMOVABLE_BLOCK_ACCESS: u8 = 0x1B;
const PAGE_TIMER_PROTECT: u8 = 0x1C;
const PAGE_ALL: u8 = 0x3F;

/// Standard INQUIRY data
pub const INQUIRY_DATA: [u8; 36] = [
    0x00, // peripheral device type: direct access
    0x80, // removable
    0x00, 0x00, 0x1F, 0x00, 0x00, 0x00, //
    b'N', b'u', b'v', b'o', b't', b'o', b'n', b' ', //
    b'U', b'S', b'B', b' ', b'M', b'a', b's', b's', //
    b' ', b'S', b't', b'o', b'r', b'a', b'g', b'e', //
    b'1', b'.', b'0', b'0',
];

pub const MODE_PAGE_01: [u8; 12] = [
    0x01, 0x0A, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00,
];

pub const MODE_PAGE_05: [u8; 32] = [
    0x05, 0x1E, 0x13, 0x88, 0x08, 0x20, 0x02, 0x00, 0x01, 0xF4, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x05, 0x1E, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x68,
    0x00, 0x00,
];

pub const MODE_PAGE_1B: [u8; 12] = [
    0x1B, 0x0A, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

pub const MODE_PAGE_1C: [u8; 8] = [0x1C, 0x06, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00];

/// MODE SENSE(6) parameter header
pub const MODE_SENSE_6_HEADER: [u8; 4] = [0x03, 0x00, 0x00, 0x00];

const MODE_HEADER_10_LEN: usize = 8;
const REQUEST_SENSE_LEN: usize = 18;
const CAPACITY_LEN: usize = 36;

const ERROR_RECOVERY_PAGES: [&[u8]; 1] = [&MODE_PAGE_01];
const FLEXIBLE_DISK_PAGES: [&[u8]; 1] = [&MODE_PAGE_05];
const REMOVABLE_BLOCK_ACCESS_PAGES: [&[u8]; 1] = [&MODE_PAGE_1B];
const TIMER_PROTECT_PAGES: [&[u8]; 1] = [&MODE_PAGE_1C];
const ALL_PAGES: [&[u8]; 4] = [&MODE_PAGE_01, &MODE_PAGE_05, &MODE_PAGE_1B, &MODE_PAGE_1C];

/// Pages returned by MODE SENSE(10) for a page code, in wire order
fn mode_pages(page_code: u8) -> Option<&'static [&'static [u8]]> {
    match page_code {
        PAGE_ERROR_RECOVERY => Some(&ERROR_RECOVERY_PAGES),
        PAGE_FLEXIBLE_DISK => Some(&FLEXIBLE_DISK_PAGES),
        PAGE_REMOVABLE_BLOCK_ACCESS => Some(&REMOVABLE_BLOCK_ACCESS_PAGES),
        PAGE_TIMER_PROTECT => Some(&TIMER_PROTECT_PAGES),
        PAGE_ALL => Some(&ALL_PAGES),
        _ => None,
    }
}

const FLEXIBLE_DISK_HEADS: u8 = 2;
const FLEXIBLE_DISK_SECTORS: u8 = 64;

/// UFI command
///
/// Refer to the USB Mass Storage UFI command set
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UfiCommand {
    Unknown {
        opcode: u8,
    },

    FormatUnit {
        track: u8,
        parameter_list_len: u16,
    },

    Inquiry {
        alloc_len: u8,
    },

    TestUnitReady,

    PreventAllowMediumRemoval {
        prevent: bool,
    },

    ReadCapacity,

    RequestSense {
        alloc_len: u8,
    },

    ModeSense6 {
        page_control: PageControl,
        page_code: u8,
        alloc_len: u8,
    },

    ModeSense {
        page_control: PageControl,
        page_code: u8,
        param_list_len: u16,
    },

    ModeSelect {
        parameter_list_len: u16,
    },

    StartStop {
        start: bool,
        eject: bool,
    },

    Read {
        lba: u32,
        len: u16,
    },

    Read12 {
        lba: u32,
        len: u32,
    },

    Write {
        lba: u32,
        len: u16,
    },

    Write12 {
        lba: u32,
        len: u32,
    },

    WriteAndVerify {
        lba: u32,
        len: u16,
    },

    ReadFormatCapacities {
        alloc_len: u16,
    },

    RezeroUnit,

    Seek {
        lba: u32,
    },

    SendDiagnostic {
        default: bool,
    },

    Verify {
        lba: u32,
        len: u16,
    },
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageControl {
    CurrentValues = 0b00,
    ChangeableValues = 0b01,
    DefaultValues = 0b10,
    SavedValues = 0b11,
}

impl PageControl {
    fn from_page_byte(byte: u8) -> Self {
        // two bits, every value has a variant
        PageControl::try_from_primitive(byte >> 6).unwrap_or(PageControl::CurrentValues)
    }
}

fn be32(cb: &[u8; 16], at: usize) -> u32 {
    u32::from_be_bytes([cb[at], cb[at + 1], cb[at + 2], cb[at + 3]])
}

fn be16(cb: &[u8; 16], at: usize) -> u16 {
    u16::from_be_bytes([cb[at], cb[at + 1]])
}

pub fn parse_cb(cb: &[u8; 16]) -> UfiCommand {
    match cb[0] {
        TEST_UNIT_READY => UfiCommand::TestUnitReady,
        REZERO_UNIT => UfiCommand::RezeroUnit,
        REQUEST_SENSE => UfiCommand::RequestSense { alloc_len: cb[4] },
        FORMAT_UNIT => UfiCommand::FormatUnit {
            track: cb[2],
            parameter_list_len: be16(cb, 7),
        },
        INQUIRY => UfiCommand::Inquiry { alloc_len: cb[4] },
        MODE_SENSE_6 => UfiCommand::ModeSense6 {
            page_control: PageControl::from_page_byte(cb[2]),
            page_code: cb[2] & 0b00111111,
            alloc_len: cb[4],
        },
        START_STOP => UfiCommand::StartStop {
            start: cb[4] & 1 > 0,
            eject: cb[4] == 2,
        },
        SEND_DIAGNOSTIC => UfiCommand::SendDiagnostic {
            default: cb[1] & 1 << 2 > 0,
        },
        PREVENT_ALLOW_MEDIUM_REMOVAL => UfiCommand::PreventAllowMediumRemoval {
            prevent: cb[4] & 1 > 0,
        },
        READ_FORMAT_CAPACITIES => UfiCommand::ReadFormatCapacities {
            alloc_len: be16(cb, 7),
        },
        READ_CAPACITY => UfiCommand::ReadCapacity,
        READ_10 => UfiCommand::Read {
            lba: be32(cb, 2),
            len: be16(cb, 7),
        },
        WRITE_10 => UfiCommand::Write {
            lba: be32(cb, 2),
            len: be16(cb, 7),
        },
        SEEK_10 => UfiCommand::Seek { lba: be32(cb, 2) },
        WRITE_AND_VERIFY => UfiCommand::WriteAndVerify {
            lba: be32(cb, 2),
            len: be16(cb, 7),
        },
        VERIFY => UfiCommand::Verify {
            lba: be32(cb, 2),
            len: be16(cb, 7),
        },
        MODE_SELECT => UfiCommand::ModeSelect {
            parameter_list_len: be16(cb, 7),
        },
        MODE_SENSE => UfiCommand::ModeSense {
            page_control: PageControl::from_page_byte(cb[2]),
            page_code: cb[2] & 0b00111111,
            param_list_len: be16(cb, 7),
        },
        READ_12 => UfiCommand::Read12 {
            lba: be32(cb, 2),
            len: be32(cb, 6),
        },
        WRITE_12 => UfiCommand::Write12 {
            lba: be32(cb, 2),
            len: be32(cb, 6),
        },
        opcode => UfiCommand::Unknown { opcode },
    }
}

/// Deferred error reported by the next REQUEST SENSE
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub const NONE: Sense = Sense::new(0x00, 0x00, 0x00);
    pub const INVALID_COMMAND: Sense = Sense::new(0x05, 0x20, 0x00);
    pub const LBA_OUT_OF_RANGE: Sense = Sense::new(0x05, 0x21, 0x00);
    pub const INVALID_FIELD: Sense = Sense::new(0x05, 0x24, 0x00);
    pub const READ_ERROR: Sense = Sense::new(0x03, 0x11, 0x00);
    pub const WRITE_ERROR: Sense = Sense::new(0x03, 0x0C, 0x00);

    pub const fn new(key: u8, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }
}

type UfiResult<T> = Result<T, TransferError>;

/// UFI subclass over [Bulk Only Transport]
///
/// Answers every command from static tables or the [BlockDevice], always terminating it
/// with a CSW. Failures are reported through the deferred [Sense] while the CSW status
/// reflects the medium removal prevention flag.
///
/// [Bulk Only Transport]: crate::transport::bbb::BulkOnly
pub struct Ufi<'a, C, D, Buf>
where
    C: Controller,
    D: BlockDevice,
    Buf: BorrowMut<[u8]>,
{
    transport: BulkOnly<'a, C, Buf>,
    storage: D,
    sense: Sense,
    prevent: bool,
}

impl<'a, C, D, Buf> Ufi<'a, C, D, Buf>
where
    C: Controller,
    D: BlockDevice,
    Buf: BorrowMut<[u8]>,
{
    /// Creates a UFI over Bulk Only Transport instance
    ///
    /// # Arguments
    /// * `hw` - the device controller
    /// * `state` - flow-control state shared with the interrupt handler
    /// * `config` - endpoint and DMA configuration
    /// * `buf` - The staging buffer. It is **required** to fit at least a single block
    /// * `storage` - the backing store
    ///
    /// # Errors
    /// Any [ConfigError] reported by [BulkOnly::new]
    ///
    /// [ConfigError]: crate::transport::ConfigError
    /// [BulkOnly::new]: crate::transport::bbb::BulkOnly::new
    pub fn new(
        hw: C,
        state: &'a SharedState,
        config: Config,
        buf: Buf,
        storage: D,
    ) -> Result<Self, ConfigError> {
        BulkOnly::new(hw, state, config, buf).map(|transport| Self {
            transport,
            storage,
            sense: Sense::NONE,
            prevent: false,
        })
    }

    /// Runs one step of the service loop
    ///
    /// Does nothing until a class request starts the session. A failed transfer leaves the
    /// host and the device out of step, so the transport is forced back to idle and the
    /// error is returned.
    pub fn poll(&mut self) -> UfiResult<()> {
        if !self.transport.session_active() {
            return Ok(());
        }

        self.process_command().map_err(|err| {
            warning!("usb: ufi: Transfer cancelled: {}", err);
            self.transport.reset();
            err
        })
    }

    pub fn sense(&self) -> Sense {
        self.sense
    }

    pub fn removal_prevented(&self) -> bool {
        self.prevent
    }

    pub fn storage(&self) -> &D {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut D {
        &mut self.storage
    }

    pub fn transport(&self) -> &BulkOnly<'a, C, Buf> {
        &self.transport
    }

    fn process_command(&mut self) -> UfiResult<()> {
        let cbw = match self.transport.read_command()? {
            Some(cbw) => cbw,
            None => return Ok(()),
        };

        let command = parse_cb(&cbw.block);
        debug!("usb: ufi: Command: {}", command);

        let residue = self.execute(&cbw, command)?;
        let status = if self.prevent {
            CommandStatus::Failed
        } else {
            CommandStatus::Passed
        };
        self.transport.ack(cbw.tag, residue, status)
    }

    /// Executes a command including its data phase, returning the residue
    fn execute(&mut self, cbw: &CommandBlockWrapper, command: UfiCommand) -> UfiResult<u32> {
        let len = cbw.data_transfer_len as usize;

        match command {
            UfiCommand::Read { lba, .. } => self.read(lba, len)?,
            UfiCommand::Write { lba, .. } => self.write(lba, len)?,
            UfiCommand::PreventAllowMediumRemoval { prevent } => {
                if prevent {
                    self.set_sense(Sense::INVALID_FIELD);
                }
                self.prevent = prevent;
            }
            UfiCommand::TestUnitReady
            | UfiCommand::Verify { .. }
            | UfiCommand::StartStop { .. } => {}
            UfiCommand::RequestSense { .. } => self.request_sense(len)?,
            UfiCommand::ReadFormatCapacities { .. } => self.read_format_capacities(len)?,
            UfiCommand::ReadCapacity => self.read_capacity(len)?,
            UfiCommand::ModeSelect { .. } => self.transport.discard(len)?,
            UfiCommand::ModeSense {
                page_control,
                page_code,
                ..
            } => self.mode_sense(page_control, page_code, len)?,
            UfiCommand::ModeSense6 { .. } => {
                self.stage(len, &MODE_SENSE_6_HEADER);
                self.transport.send_staged(len)?;
            }
            UfiCommand::Inquiry { .. } => {
                self.stage(len, &INQUIRY_DATA);
                self.transport.send_staged(len)?;
            }
            _ => {
                info!("usb: ufi: Unsupported command: {}", command);
                self.set_sense(Sense::INVALID_COMMAND);
                match cbw.direction {
                    DataDirection::In => self.transport.send_zeros(len)?,
                    DataDirection::Out => self.transport.discard(len)?,
                    DataDirection::NotExpected => {}
                }
                return Ok(cbw.data_transfer_len);
            }
        }
        Ok(0)
    }

    fn set_sense(&mut self, sense: Sense) {
        debug!("usb: ufi: Sense: {}", sense);
        self.sense = sense;
    }

    /// Zeroes the part of the staging buffer a `len` byte response goes out of and copies
    /// `data` to its start
    fn stage(&mut self, len: usize, data: &[u8]) {
        let chunk = self.transport.chunk_len();
        let buf = self.transport.buffer_mut();
        buf.fill(0..len.max(data.len()).min(chunk), 0);
        buf.put(0, data);
    }

    fn request_sense(&mut self, len: usize) -> UfiResult<()> {
        self.stage(len, &[0u8; REQUEST_SENSE_LEN]);

        let format = if self.prevent { 0x70 } else { 0xF0 };
        self.prevent = false;

        let sense = self.sense;
        let buf = self.transport.buffer_mut();
        buf.put_u8(0, format);
        buf.put_u8(2, sense.key);
        buf.put_u8(7, 0x0A);
        buf.put_u8(12, sense.asc);
        buf.put_u8(13, sense.ascq);
        self.transport.send_staged(len)?;

        self.sense = Sense::NONE;
        Ok(())
    }

    fn read_capacity(&mut self, len: usize) -> UfiResult<()> {
        self.stage(len, &[0u8; CAPACITY_LEN]);

        let last_lba = self.storage.block_count().wrapping_sub(1);
        let buf = self.transport.buffer_mut();
        buf.put_be32(0, last_lba);
        // block length 0x200
        buf.put_u8(6, 0x02);
        self.transport.send_staged(len)
    }

    fn read_format_capacities(&mut self, len: usize) -> UfiResult<()> {
        self.stage(len, &[0u8; CAPACITY_LEN]);

        let total = self.storage.block_count();
        let buf = self.transport.buffer_mut();
        // capacity list length
        buf.put_u8(3, 0x10);
        // current/maximum capacity descriptor, formatted media
        buf.put_be32(4, total);
        buf.put_u8(8, 0x02);
        buf.put_u8(10, 0x02);
        // formattable capacity descriptor
        buf.put_be32(12, total);
        buf.put_u8(18, 0x02);
        self.transport.send_staged(len)
    }

    fn mode_sense(&mut self, page_control: PageControl, page_code: u8, len: usize) -> UfiResult<()> {
        self.stage(len, &[0u8; MODE_HEADER_10_LEN]);

        let pages = match page_control {
            PageControl::CurrentValues => mode_pages(page_code),
            _ => None,
        };
        let pages = match pages {
            Some(pages) => pages,
            None => {
                self.set_sense(Sense::INVALID_FIELD);
                return self.transport.send_staged(len);
            }
        };

        let cylinders = (self.storage.block_count() / 128) as u16;
        let buf = self.transport.buffer_mut();
        let mut at = MODE_HEADER_10_LEN;
        for page in pages {
            let base = at;
            at += buf.put(base, page);
            if page.first() == Some(&PAGE_FLEXIBLE_DISK) {
                buf.put_u8(base + 4, FLEXIBLE_DISK_HEADS);
                buf.put_u8(base + 5, FLEXIBLE_DISK_SECTORS);
                buf.put(base + 8, cylinders.to_be_bytes().as_slice());
            }
        }
        // mode data length excludes its own field
        buf.put_u8(0, (at - 1) as u8);

        self.transport.send_staged(len)
    }

    /// Whether `len` bytes starting at `lba` fit the backing store
    fn in_range(&self, lba: u32, len: usize) -> bool {
        let blocks = len.div_ceil(BLOCK_SIZE) as u64;
        lba as u64 + blocks <= self.storage.block_count() as u64
    }

    fn read(&mut self, lba: u32, len: usize) -> UfiResult<()> {
        if !self.in_range(lba, len) {
            self.set_sense(Sense::LBA_OUT_OF_RANGE);
            return self.transport.send_zeros(len);
        }

        let chunk = self.transport.chunk_len();
        let mut done = 0;
        while done < len {
            let count = (len - done).min(chunk);
            let area = count.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
            let block = lba + (done / BLOCK_SIZE) as u32;

            let res = match self.transport.buffer_mut().slice_mut(0..area) {
                Some(dst) => self.storage.read_blocks(block, dst),
                None => Err(BlockDeviceError::OutOfRange),
            };
            if let Err(err) = res {
                error!("usb: ufi: Read failed at {}: {}", block, err);
                self.set_sense(Sense::READ_ERROR);
                self.transport.buffer_mut().fill(0..area, 0);
            }

            self.transport.send_staged(count)?;
            done += count;
        }
        Ok(())
    }

    fn write(&mut self, lba: u32, len: usize) -> UfiResult<()> {
        if !self.in_range(lba, len) {
            self.set_sense(Sense::LBA_OUT_OF_RANGE);
            return self.transport.discard(len);
        }

        let chunk = self.transport.chunk_len();
        let mut failed = false;
        let mut done = 0;
        while done < len {
            let count = (len - done).min(chunk);
            let block = lba + (done / BLOCK_SIZE) as u32;
            self.transport.receive_staged(count)?;

            if !failed {
                if let Err(err) = self.store(block, count) {
                    error!("usb: ufi: Write failed at {}: {}", block, err);
                    self.set_sense(Sense::WRITE_ERROR);
                    failed = true;
                }
            }
            done += count;
        }
        Ok(())
    }

    /// Writes the first `count` staged bytes at `lba`, keeping the tail of a partial block
    fn store(&mut self, lba: u32, count: usize) -> Result<(), BlockDeviceError> {
        let whole = count / BLOCK_SIZE * BLOCK_SIZE;
        let area = count.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

        if whole < count {
            let mut tail = [0u8; BLOCK_SIZE];
            self.storage
                .read_blocks(lba + (whole / BLOCK_SIZE) as u32, &mut tail)?;
            self.transport
                .buffer_mut()
                .put(count, &tail[count - whole..]);
        }

        match self.transport.buffer_mut().slice(0..area) {
            Some(src) => self.storage.write_blocks(lba, src),
            None => Err(BlockDeviceError::OutOfRange),
        }
    }
}
