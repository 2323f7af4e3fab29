//! Metadata store: locates a valid metadata replica and parses its dataset.

pub mod guid;
pub mod header;
pub mod record;

use std::fmt;

use crate::device::PositionedIo;
use header::{HeaderError, InformationHeader, VolumeHeader};
use record::{Dataset, RecordError};

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Header(HeaderError),
    Record(RecordError),
    NoValidReplica,
    UnsupportedVolumeType,
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::Io(e) => write!(f, "metadata I/O error: {}", e),
            MetadataError::Header(e) => write!(f, "{}", e),
            MetadataError::Record(e) => write!(f, "{}", e),
            MetadataError::NoValidReplica => write!(f, "no metadata replica passed CRC validation"),
            MetadataError::UnsupportedVolumeType => {
                write!(f, "volume type is not supported (e.g. BitLocker To Go)")
            }
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> MetadataError {
        MetadataError::Io(e)
    }
}

impl From<HeaderError> for MetadataError {
    fn from(e: HeaderError) -> MetadataError {
        MetadataError::Header(e)
    }
}

impl From<RecordError> for MetadataError {
    fn from(e: RecordError) -> MetadataError {
        MetadataError::Record(e)
    }
}

/// Result of locating and parsing one metadata replica.
pub struct Metadata {
    pub volume_header: VolumeHeader,
    pub information: InformationHeader,
    pub dataset: Dataset,
    pub replica_index: usize,
}

/// Read the full chain: volume header, then the first valid information
/// header + dataset among the three replicas.
///
/// `force_replica`, when `Some(1..=3)`, skips CRC validation and loads that
/// replica unconditionally.
pub fn load(device: &dyn PositionedIo, force_replica: Option<u8>) -> Result<Metadata, MetadataError> {
    let mut header_buf = [0u8; VolumeHeader::SIZE];
    device.read_at(0, &mut header_buf)?;
    let mut volume_header = VolumeHeader::parse(&header_buf)?;

    // `compute_real_offsets()`'s equivalent: triggered by `metadata_lcn`
    // being set, regardless of signature. `offset[0]` becomes the computed
    // hint itself; `offset[1]`/`offset[2]` come from the probed replica's
    // own self-reported offsets. The stored triplet is zeroed first so the
    // probe's cross-check in `InformationHeader::parse` doesn't fire against
    // whatever (possibly stale) bytes were on-disk at 0xb0.
    if volume_header.metadata_lcn != 0 {
        let hint = volume_header.first_replica_hint();
        volume_header.information_offsets = [0, 0, 0];
        let mut probe = [0u8; InformationHeader::BASE_SIZE];
        device.read_at(hint, &mut probe)?;
        let info = InformationHeader::parse(&probe, &volume_header)?;
        volume_header.information_offsets = [hint, info.offsets[1], info.offsets[2]];
    }

    let offsets = volume_header.information_offsets;
    if offsets == [0, 0, 0] {
        return Err(MetadataError::UnsupportedVolumeType);
    }

    let candidates: Vec<(usize, u64)> = match force_replica {
        Some(n @ 1..=3) => vec![(n as usize, offsets[n as usize - 1])],
        _ => offsets.iter().enumerate().map(|(i, &o)| (i + 1, o)).collect(),
    };

    let skip_crc = force_replica.is_some();

    for (idx, offset) in candidates {
        match try_load_replica(device, &volume_header, offset, skip_crc) {
            Ok((information, dataset)) => {
                return Ok(Metadata { volume_header, information, dataset, replica_index: idx });
            }
            Err(_) if !skip_crc => continue,
            Err(e) => return Err(e),
        }
    }

    Err(MetadataError::NoValidReplica)
}

fn try_load_replica(
    device: &dyn PositionedIo,
    volume_header: &VolumeHeader,
    offset: u64,
    skip_crc: bool,
) -> Result<(InformationHeader, Dataset), MetadataError> {
    let mut base = [0u8; InformationHeader::BASE_SIZE];
    device.read_at(offset, &mut base)?;
    let information = InformationHeader::parse(&base, volume_header)?;

    let mut replica = vec![0u8; information.size as usize + 4];
    device.read_at(offset, &mut replica)?;

    if !skip_crc {
        InformationHeader::crc_validate(&replica)?;
    }

    let dataset_bytes = &replica[InformationHeader::BASE_SIZE..];
    let dataset = Dataset::parse(dataset_bytes)?;

    Ok((information, dataset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use byteorder::{ByteOrder, LittleEndian};

    fn build_minimal_volume(information_offset: u64, replica: &[u8]) -> Vec<u8> {
        let total = (information_offset as usize + replica.len()).max(VolumeHeader::SIZE);
        let mut buf = vec![0u8; total];
        buf[3..11].copy_from_slice(b"-FVE-FS-");
        LittleEndian::write_u16(&mut buf[11..13], 512);
        buf[13] = 1;
        LittleEndian::write_u64(&mut buf[176..184], information_offset);
        LittleEndian::write_u64(&mut buf[184..192], information_offset);
        LittleEndian::write_u64(&mut buf[192..200], information_offset);
        buf[information_offset as usize..information_offset as usize + replica.len()]
            .copy_from_slice(replica);
        buf
    }

    fn build_replica(information_offset: u64) -> Vec<u8> {
        // No records: dataset `size` stops right after its own header, while
        // `copy_size` still satisfies Dataset::parse's `>= header_size + 8`
        // reservation check without extending the buffer (those 8 bytes
        // would otherwise be read back as a bogus zero-length record).
        let dataset_size = Dataset::HEADER_SIZE as u32;
        let dataset_copy_size = Dataset::HEADER_SIZE as u32 + 8;
        let mut replica = vec![0u8; InformationHeader::BASE_SIZE + dataset_size as usize];
        LittleEndian::write_u32(&mut replica[0x0..0x4], InformationHeader::BASE_SIZE as u32 + dataset_size);
        LittleEndian::write_u16(&mut replica[0x8..0xa], 1); // version = Vista: no x16 size scaling
        LittleEndian::write_u16(&mut replica[0xc..0xe], 4);
        LittleEndian::write_u64(&mut replica[0x28..0x30], information_offset);
        LittleEndian::write_u64(&mut replica[0x30..0x38], information_offset);
        LittleEndian::write_u64(&mut replica[0x38..0x40], information_offset);
        let dataset_off = InformationHeader::BASE_SIZE;
        LittleEndian::write_u32(&mut replica[dataset_off..dataset_off + 4], dataset_size);
        LittleEndian::write_u32(&mut replica[dataset_off + 4..dataset_off + 8], Dataset::HEADER_SIZE as u32);
        LittleEndian::write_u32(&mut replica[dataset_off + 8..dataset_off + 12], dataset_copy_size);

        let mut full = replica.clone();
        let crc = crc32fast::hash(&full);
        full.extend_from_slice(&crc.to_le_bytes());
        full
    }

    #[test]
    fn loads_metadata_via_crc_validated_replica() {
        let replica = build_replica(0x4000);
        let volume = build_minimal_volume(0x4000, &replica);
        let device = MemoryDevice::new(volume, 0);
        let metadata = load(&device, None).unwrap();
        assert_eq!(metadata.replica_index, 1);
        assert_eq!(metadata.information.nb_backup_sectors, 0);
    }

    #[test]
    fn force_replica_skips_crc() {
        let mut replica = build_replica(0x4000);
        let len = replica.len();
        replica[len - 1] ^= 0xff; // corrupt CRC
        let volume = build_minimal_volume(0x4000, &replica);
        let device = MemoryDevice::new(volume, 0);
        let metadata = load(&device, Some(1)).unwrap();
        assert_eq!(metadata.replica_index, 1);
    }

    /// Three real replicas are discovered through three independent offsets;
    /// when the first fails its CRC, `load` must keep trying the next one
    /// instead of giving up.
    #[test]
    fn falls_back_to_next_replica_when_first_fails_crc() {
        let offset1 = 0x4000u64;
        let offset2 = 0x8000u64;
        let offset3 = 0xc000u64;

        let mut replica1 = build_replica(offset1);
        let len1 = replica1.len();
        replica1[len1 - 1] ^= 0xff; // corrupt replica 1's CRC
        let replica2 = build_replica(offset2);
        let replica3 = build_replica(offset3);

        let total = (offset3 as usize + replica3.len()).max(VolumeHeader::SIZE);
        let mut buf = vec![0u8; total];
        buf[3..11].copy_from_slice(b"-FVE-FS-");
        LittleEndian::write_u16(&mut buf[11..13], 512);
        buf[13] = 1;
        LittleEndian::write_u64(&mut buf[176..184], offset1);
        LittleEndian::write_u64(&mut buf[184..192], offset2);
        LittleEndian::write_u64(&mut buf[192..200], offset3);
        buf[offset1 as usize..offset1 as usize + replica1.len()].copy_from_slice(&replica1);
        buf[offset2 as usize..offset2 as usize + replica2.len()].copy_from_slice(&replica2);
        buf[offset3 as usize..offset3 as usize + replica3.len()].copy_from_slice(&replica3);

        let device = MemoryDevice::new(buf, 0);
        let metadata = load(&device, None).unwrap();
        assert_eq!(metadata.replica_index, 2);
    }
}
