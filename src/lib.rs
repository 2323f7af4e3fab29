//! Transparent read/write access to a BitLocker-encrypted volume, given a
//! credential. See [`open`] for the entry point.

mod ccm;
mod codec;
mod credential;
mod device;
mod diffuser;
mod metadata;
mod volume;

pub use credential::CredentialError;
pub use device::{FileDevice, MemoryDevice, PositionedIo};
pub use metadata::MetadataError;
pub use volume::{CredentialSelector, OpenConfig, Volume, VolumeError};

use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;

/// The crate's unified error type; every fallible operation returns this.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Volume(VolumeError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}", e),
            Error::Volume(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Volume(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<VolumeError> for Error {
    fn from(e: VolumeError) -> Error {
        Error::Volume(e)
    }
}

/// Opens a BitLocker volume backed by a real file at `path`.
///
/// `partition_offset` shifts every device access, for images whose
/// BitLocker partition does not start at byte 0.
pub fn open(
    path: impl AsRef<Path>,
    partition_offset: u64,
    selector: CredentialSelector,
    config: OpenConfig,
) -> Result<Volume, Error> {
    let file = OpenOptions::new()
        .read(true)
        .write(!config.read_only)
        .open(path)?;
    let device = Box::new(device::FileDevice::open(file, partition_offset));
    log::debug!("opened backing device, partition_offset={}", partition_offset);
    Volume::open(device, selector, config).map_err(Error::from)
}

/// Opens a BitLocker volume over any caller-supplied [`PositionedIo`]
/// implementation (used by the test suite to build in-memory fixtures).
pub fn open_with_device(
    device: Box<dyn PositionedIo>,
    selector: CredentialSelector,
    config: OpenConfig,
) -> Result<Volume, Error> {
    Volume::open(device, selector, config).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_volume_errors() {
        let err: Error = VolumeError::ReadOnly.into();
        assert!(err.to_string().contains("read-only"));
    }
}
