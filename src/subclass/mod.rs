//! USB Mass Storage subclasses

pub mod ufi;

/// UFI device subclass code
pub const SUBCLASS_UFI: u8 = 0x04;

/// SCSI transparent command set subclass code, announced in the interface descriptor
pub const SUBCLASS_SCSI: u8 = 0x06;
