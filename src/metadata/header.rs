//! Volume header (first 512 bytes of the partition) and information header
//! (the fixed-size prefix of each metadata replica).

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use zeroize::Zeroize;

use super::guid::Guid;

#[derive(Debug)]
pub enum HeaderError {
    ShortRead,
    UnsupportedSignature([u8; 8]),
    UnsupportedVersion(u16),
    ReplicaOffsetMismatch,
    InvalidSize,
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::ShortRead => write!(f, "header buffer shorter than expected"),
            HeaderError::UnsupportedSignature(sig) => {
                write!(f, "unsupported volume signature: {:?}", sig)
            }
            HeaderError::UnsupportedVersion(v) => write!(f, "unsupported metadata version: {}", v),
            HeaderError::ReplicaOffsetMismatch => {
                write!(f, "volume header and information header disagree on replica offsets")
            }
            HeaderError::InvalidSize => write!(f, "information header declares an invalid size"),
        }
    }
}

impl std::error::Error for HeaderError {}

const SIGNATURE_FVE: &[u8; 8] = b"-FVE-FS-";
const SIGNATURE_NTFS: &[u8; 8] = b"NTFS    ";

/// Signature found in the first 8 bytes of a volume once its boot sector
/// has been taken over by the encryption driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeSignature {
    /// `-FVE-FS-`: volume is fully under BitLocker control.
    Fve,
    /// `NTFS    `: volume is partially encrypted or the encryption is
    /// paused; the real NTFS boot sector underneath has been preserved.
    Ntfs,
}

/// The first 512 bytes of the encrypted partition.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub signature: VolumeSignature,
    pub sector_size: u16,
    pub sectors_per_cluster: u8,
    pub volume_guid: Guid,
    pub metadata_lcn: u64,
    pub information_offsets: [u64; 3],
}

impl VolumeHeader {
    pub const SIZE: usize = 512;

    pub fn parse(buf: &[u8]) -> Result<VolumeHeader, HeaderError> {
        if buf.len() < Self::SIZE {
            return Err(HeaderError::ShortRead);
        }
        let mut sig = [0u8; 8];
        sig.copy_from_slice(&buf[3..11]);
        let signature = if &sig == SIGNATURE_FVE {
            VolumeSignature::Fve
        } else if &sig == SIGNATURE_NTFS {
            VolumeSignature::Ntfs
        } else {
            return Err(HeaderError::UnsupportedSignature(sig));
        };

        let sector_size = LittleEndian::read_u16(&buf[11..13]);
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(HeaderError::InvalidSize);
        }
        let sectors_per_cluster = buf[13];
        let volume_guid = Guid::from_bytes(&buf[160..176]).ok_or(HeaderError::ShortRead)?;
        // `metadata_lcn`/`mft_mirror` is a union at offset 0x38 (56), distinct
        // from the offset triplet at 0xb0 (176) read below.
        let metadata_lcn = LittleEndian::read_u64(&buf[56..64]);

        // The offset triplet lives at the same byte range for both
        // signatures; when `metadata_lcn != 0` the caller recomputes it from
        // the replica reached through `first_replica_hint()` regardless of
        // what is read here.
        let mut information_offsets = [0u64; 3];
        information_offsets[0] = LittleEndian::read_u64(&buf[176..184]);
        information_offsets[1] = LittleEndian::read_u64(&buf[184..192]);
        information_offsets[2] = LittleEndian::read_u64(&buf[192..200]);

        Ok(VolumeHeader {
            signature,
            sector_size,
            sectors_per_cluster,
            volume_guid,
            metadata_lcn,
            information_offsets,
        })
    }

    pub fn first_replica_hint(&self) -> u64 {
        self.metadata_lcn * self.sectors_per_cluster as u64 * self.sector_size as u64
    }
}

/// Patch a Vista boot sector (or its encrypted-extent mirror) from its
/// on-disk `-FVE-FS-` form to the `NTFS    ` form an NTFS-aware reader
/// expects, in place. `metadata_lcn` and `mft_mirror` share the same union
/// field at offset 0x38, so swapping the 8-byte signature is the only edit
/// needed to make the sector look like a genuine NTFS boot sector again.
pub fn vista_vbr_fve_to_ntfs(sector: &mut [u8]) {
    if sector.len() >= 11 {
        sector[3..11].copy_from_slice(SIGNATURE_NTFS);
    }
}

/// Inverse of [`vista_vbr_fve_to_ntfs`]: restore the `-FVE-FS-` signature
/// before a patched sector is written back to disk.
pub fn vista_vbr_ntfs_to_fve(sector: &mut [u8]) {
    if sector.len() >= 11 {
        sector[3..11].copy_from_slice(SIGNATURE_FVE);
    }
}

/// Encryption state of the volume, as recorded in the information header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataState {
    Null,
    Decrypted,
    SwitchingEncryption,
    EowActivated,
    Encrypted,
    SwitchEncryptionPaused,
    Unknown(u16),
}

impl From<u16> for MetadataState {
    fn from(v: u16) -> MetadataState {
        match v {
            0 => MetadataState::Null,
            1 => MetadataState::Decrypted,
            2 => MetadataState::SwitchingEncryption,
            3 => MetadataState::EowActivated,
            4 => MetadataState::Encrypted,
            5 => MetadataState::SwitchEncryptionPaused,
            other => MetadataState::Unknown(other),
        }
    }
}

impl MetadataState {
    /// States the translator will mount without an explicit override.
    pub fn is_safe_to_mount(&self) -> bool {
        matches!(
            self,
            MetadataState::Decrypted
                | MetadataState::Encrypted
                | MetadataState::SwitchEncryptionPaused
        )
    }
}

/// Metadata version: `1` is Vista, `2` is Windows 7/8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataVersion {
    Vista,
    SevenOrEight,
}

impl MetadataVersion {
    fn from_u16(v: u16) -> Result<MetadataVersion, HeaderError> {
        match v {
            1 => Ok(MetadataVersion::Vista),
            2 => Ok(MetadataVersion::SevenOrEight),
            other => Err(HeaderError::UnsupportedVersion(other)),
        }
    }
}

/// The 0x70-byte header prefixing every metadata replica.
#[derive(Debug, Clone, Zeroize)]
pub struct InformationHeader {
    #[zeroize(skip)]
    pub version: MetadataVersion,
    #[zeroize(skip)]
    pub size: u32,
    #[zeroize(skip)]
    pub curr_state: MetadataState,
    #[zeroize(skip)]
    pub next_state: MetadataState,
    pub encrypted_volume_size: u64,
    pub convert_size: u64,
    pub nb_backup_sectors: u32,
    #[zeroize(skip)]
    pub offsets: [u64; 3],
    /// Boot-sectors backup address (version 2) or MFT-mirror backup
    /// (version 1); interpretation depends on `version`.
    pub backup_address: u64,
}

impl InformationHeader {
    pub const BASE_SIZE: usize = 0x70;

    pub fn parse(buf: &[u8], volume_header: &VolumeHeader) -> Result<InformationHeader, HeaderError> {
        if buf.len() < Self::BASE_SIZE {
            return Err(HeaderError::ShortRead);
        }
        let raw_version = LittleEndian::read_u16(&buf[0x8..0xa]);
        let version = MetadataVersion::from_u16(raw_version)?;

        let raw_size = LittleEndian::read_u32(&buf[0x0..0x4]);
        let size = match version {
            MetadataVersion::SevenOrEight => raw_size
                .checked_mul(16)
                .ok_or(HeaderError::InvalidSize)?,
            MetadataVersion::Vista => raw_size,
        };
        if size < InformationHeader::BASE_SIZE as u32 {
            return Err(HeaderError::InvalidSize);
        }

        let curr_state = MetadataState::from(LittleEndian::read_u16(&buf[0xc..0xe]));
        let next_state = MetadataState::from(LittleEndian::read_u16(&buf[0xe..0x10]));
        let encrypted_volume_size = LittleEndian::read_u64(&buf[0x10..0x18]);
        let convert_size = LittleEndian::read_u64(&buf[0x18..0x20]);
        let nb_backup_sectors = LittleEndian::read_u32(&buf[0x20..0x24]);

        let mut offsets = [0u64; 3];
        offsets[0] = LittleEndian::read_u64(&buf[0x28..0x30]);
        offsets[1] = LittleEndian::read_u64(&buf[0x30..0x38]);
        offsets[2] = LittleEndian::read_u64(&buf[0x38..0x40]);

        if volume_header.signature == VolumeSignature::Fve
            && volume_header.information_offsets != [0, 0, 0]
            && volume_header.information_offsets != offsets
        {
            return Err(HeaderError::ReplicaOffsetMismatch);
        }

        let backup_address = LittleEndian::read_u64(&buf[0x68..0x70]);

        Ok(InformationHeader {
            version,
            size,
            curr_state,
            next_state,
            encrypted_volume_size,
            convert_size,
            nb_backup_sectors,
            offsets,
            backup_address,
        })
    }

    pub fn crc_validate(replica: &[u8]) -> Result<(), HeaderError> {
        if replica.len() < Self::BASE_SIZE {
            return Err(HeaderError::ShortRead);
        }
        let raw_version = LittleEndian::read_u16(&replica[0x8..0xa]);
        let version = MetadataVersion::from_u16(raw_version)?;
        let raw_size = LittleEndian::read_u32(&replica[0x0..0x4]);
        let size = match version {
            MetadataVersion::SevenOrEight => raw_size as usize * 16,
            MetadataVersion::Vista => raw_size as usize,
        };
        if replica.len() < size + 4 {
            return Err(HeaderError::ShortRead);
        }
        let stored_crc = LittleEndian::read_u32(&replica[size..size + 4]);
        let computed = crc32fast::hash(&replica[..size]);
        if stored_crc != computed {
            return Err(HeaderError::InvalidSize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_volume_header() -> Vec<u8> {
        let mut buf = vec![0u8; VolumeHeader::SIZE];
        buf[3..11].copy_from_slice(SIGNATURE_FVE);
        LittleEndian::write_u16(&mut buf[11..13], 512);
        buf[13] = 8;
        LittleEndian::write_u64(&mut buf[176..184], 0x4000);
        LittleEndian::write_u64(&mut buf[184..192], 0x8000);
        LittleEndian::write_u64(&mut buf[192..200], 0xc000);
        buf
    }

    #[test]
    fn parses_fve_signature_and_offsets() {
        let buf = sample_volume_header();
        let header = VolumeHeader::parse(&buf).unwrap();
        assert_eq!(header.signature, VolumeSignature::Fve);
        assert_eq!(header.sector_size, 512);
        assert_eq!(header.information_offsets, [0x4000, 0x8000, 0xc000]);
    }

    #[test]
    fn rejects_unknown_signature() {
        let mut buf = sample_volume_header();
        buf[3..11].copy_from_slice(b"XXXXXXXX");
        assert!(matches!(
            VolumeHeader::parse(&buf),
            Err(HeaderError::UnsupportedSignature(_))
        ));
    }

    #[test]
    fn rejects_non_power_of_two_sector_size() {
        let mut buf = sample_volume_header();
        LittleEndian::write_u16(&mut buf[11..13], 500);
        assert!(matches!(VolumeHeader::parse(&buf), Err(HeaderError::InvalidSize)));
    }

    #[test]
    fn vista_vbr_patch_round_trips_the_signature() {
        let mut sector = vec![0u8; 512];
        sector[3..11].copy_from_slice(SIGNATURE_FVE);
        vista_vbr_fve_to_ntfs(&mut sector);
        assert_eq!(&sector[3..11], SIGNATURE_NTFS);
        vista_vbr_ntfs_to_fve(&mut sector);
        assert_eq!(&sector[3..11], SIGNATURE_FVE);
    }

    #[test]
    fn safe_states() {
        assert!(MetadataState::Decrypted.is_safe_to_mount());
        assert!(MetadataState::Encrypted.is_safe_to_mount());
        assert!(MetadataState::SwitchEncryptionPaused.is_safe_to_mount());
        assert!(!MetadataState::SwitchingEncryption.is_safe_to_mount());
    }
}
