//! The volume translator: turns positioned ciphertext access into a
//! logical plaintext view, handling virtualized regions, partial
//! encryption, and the per-version boot-sector fix-ups.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ccm::{self, AesKey, CcmError};
use crate::codec::{CodecError, SectorCipher};
use crate::credential::{CredentialError, IntermediateKey};
use crate::device::PositionedIo;
use crate::metadata::guid::Guid;
use crate::metadata::header::{self, MetadataState, MetadataVersion};
use crate::metadata::record::{self, Dataset, Record, TaggedRecord};
use crate::metadata::{self, MetadataError};

#[derive(Debug)]
pub enum VolumeError {
    Metadata(MetadataError),
    Ccm(CcmError),
    Codec(CodecError),
    Credential(CredentialError),
    Io(std::io::Error),
    MissingCredential,
    NoMatchingVmk,
    NoFvekRecord,
    UnsafeState(MetadataState),
    OffsetOutOfRange,
    ReadOnly,
    DeniedMetadataWrite,
    StoppedAt(OpenStage),
}

impl fmt::Display for VolumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeError::Metadata(e) => write!(f, "{}", e),
            VolumeError::Ccm(e) => write!(f, "{}", e),
            VolumeError::Codec(e) => write!(f, "{}", e),
            VolumeError::Credential(e) => write!(f, "{}", e),
            VolumeError::Io(e) => write!(f, "{}", e),
            VolumeError::MissingCredential => write!(f, "no supplied credential unwrapped a volume master key"),
            VolumeError::NoMatchingVmk => write!(f, "no VMK record matched the requested selector"),
            VolumeError::NoFvekRecord => write!(f, "metadata has no full-volume-encryption key record"),
            VolumeError::UnsafeState(state) => write!(f, "metadata state {:?} is not safe to mount", state),
            VolumeError::OffsetOutOfRange => write!(f, "requested range falls outside the volume"),
            VolumeError::ReadOnly => write!(f, "volume was opened read-only"),
            VolumeError::DeniedMetadataWrite => write!(f, "write denied: target range overlaps protected metadata"),
            VolumeError::StoppedAt(stage) => write!(f, "open pipeline stopped at {:?} as requested", stage),
        }
    }
}

impl std::error::Error for VolumeError {}

impl From<MetadataError> for VolumeError {
    fn from(e: MetadataError) -> VolumeError {
        VolumeError::Metadata(e)
    }
}
impl From<CcmError> for VolumeError {
    fn from(e: CcmError) -> VolumeError {
        VolumeError::Ccm(e)
    }
}
impl From<CodecError> for VolumeError {
    fn from(e: CodecError) -> VolumeError {
        VolumeError::Codec(e)
    }
}
impl From<CredentialError> for VolumeError {
    fn from(e: CredentialError) -> VolumeError {
        VolumeError::Credential(e)
    }
}
impl From<std::io::Error> for VolumeError {
    fn from(e: std::io::Error) -> VolumeError {
        VolumeError::Io(e)
    }
}

/// How a given sector must be routed before/after the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    Normal,
    Virtualized,
    SevenRedirect { real_sector: u64 },
    /// Sector 0 or the last sector of the encrypted extent on a Vista
    /// volume: copied raw, with the NTFS-signature/MFT-mirror union field
    /// patched, never run through the cipher.
    VistaBootSectorPatch,
    /// Sectors 1 through 15 on a Vista volume: copied raw, untouched by
    /// both the cipher and the boot-sector patch.
    VistaPassthrough,
    PastEncryptedExtent,
}

/// Pure fix-up classification, independent of any I/O.
pub fn sector_fixup(
    version: MetadataVersion,
    sector_index: u64,
    sector_size: u64,
    nb_backup_sectors: u32,
    backup_address: u64,
    encrypted_volume_size: u64,
    encrypted_extent_total_sectors: u64,
) -> FixupKind {
    let byte_offset = sector_index * sector_size;

    if version == MetadataVersion::SevenOrEight && sector_index < nb_backup_sectors as u64 {
        let real_sector = (backup_address + sector_index * sector_size) / sector_size;
        return FixupKind::SevenRedirect { real_sector };
    }

    if encrypted_volume_size != 0 && byte_offset >= encrypted_volume_size {
        return FixupKind::PastEncryptedExtent;
    }

    if version == MetadataVersion::Vista
        && (sector_index < 16 || sector_index + 1 == encrypted_extent_total_sectors)
    {
        if sector_index < 1 || sector_index + 1 == encrypted_extent_total_sectors {
            return FixupKind::VistaBootSectorPatch;
        }
        return FixupKind::VistaPassthrough;
    }

    FixupKind::Normal
}

/// Which of the several credential mechanisms to try.
pub enum CredentialSelector {
    ClearKey,
    RecoveryPassword(String),
    UserPassword(String),
    Vmk { key: [u8; 32] },
    /// Raw bytes of a `.bek` external-key file (itself a small dataset
    /// carrying one `EXTERNAL_KEY` record), matched against the volume's
    /// own VMK by GUID rather than by priority range.
    BekFile(Vec<u8>),
    /// Raw bytes of an FVEK file: a 2-byte algorithm code followed by key
    /// material, used directly as the full-volume-encryption key with no
    /// VMK involved at all.
    FvekFile(Vec<u8>),
}

/// Parse a `.bek` file's bytes as a dataset, and pull out the GUID and
/// cleartext key payload carried in its `EXTERNAL_KEY` record.
fn decode_bek_file(bytes: &[u8]) -> Result<(Guid, IntermediateKey), VolumeError> {
    let dataset = Dataset::parse(bytes).map_err(|_| CredentialError::MalformedKeyfile)?;
    let external = dataset
        .find(None, record::VALUE_EXTERNAL_KEY)
        .ok_or(CredentialError::MalformedKeyfile)?;
    let (guid, nested) = match &external.record {
        Record::ExternalKey { guid, nested } => (*guid, nested),
        _ => return Err(CredentialError::MalformedKeyfile.into()),
    };
    let key_record = record::find_nested(nested, record::VALUE_KEY).ok_or(CredentialError::MalformedKeyfile)?;
    let payload = match &key_record.record {
        Record::Key { payload, .. } => payload,
        _ => return Err(CredentialError::MalformedKeyfile.into()),
    };
    if payload.len() != 32 {
        return Err(CredentialError::MalformedKeyfile.into());
    }
    let mut buf = [0u8; 32];
    buf.copy_from_slice(payload);
    Ok((guid, IntermediateKey(buf)))
}

/// Parse an FVEK file's bytes: 2-byte little-endian algorithm code followed
/// directly by key material, usable as-is by [`SectorCipher::new`].
fn decode_fvek_file(bytes: &[u8]) -> Result<Fvek, VolumeError> {
    if bytes.len() < 3 {
        return Err(CredentialError::MalformedKeyfile.into());
    }
    let algorithm = u16::from_le_bytes([bytes[0], bytes[1]]);
    let material = bytes[2..].to_vec();
    Ok(Fvek { algorithm, material })
}

/// A named checkpoint in the open pipeline, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStage {
    MetadataLoaded,
    VmkUnwrapped,
    FvekUnwrapped,
    CipherReady,
}

#[derive(Default)]
pub struct OpenConfig {
    pub force_replica: Option<u8>,
    pub read_only: bool,
    pub allow_unsafe_state: bool,
    pub worker_threads: usize,
    /// Stop the open pipeline right after this stage completes, returning
    /// `VolumeError::StoppedAt` instead of a `Volume`. Used to diagnose
    /// which stage of a problematic volume's open sequence fails.
    pub init_stop_at: Option<OpenStage>,
}

impl OpenConfig {
    pub fn worker_threads_or_default(&self) -> usize {
        if self.worker_threads == 0 {
            1
        } else {
            self.worker_threads
        }
    }
}

/// A decoded FVEK record payload, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct Fvek {
    algorithm: u16,
    #[zeroize(skip)]
    material: Vec<u8>,
}

struct VirtualRegion {
    start: u64,
    len: u64,
}

impl VirtualRegion {
    fn contains_range(&self, offset: u64, len: u64) -> bool {
        let end = offset.saturating_add(len);
        let region_end = self.start.saturating_add(self.len);
        offset < region_end && end > self.start
    }
}

/// An opened BitLocker volume ready to serve logical reads and writes.
pub struct Volume {
    device: Box<dyn PositionedIo>,
    sector_size: u64,
    version: MetadataVersion,
    encrypted_volume_size: u64,
    nb_backup_sectors: u32,
    backup_address: u64,
    virtual_regions: Vec<VirtualRegion>,
    cipher: SectorCipher,
    read_only: bool,
    worker_threads: usize,
}

/// Decode a raw `KEY` record payload found as the plaintext of an
/// AES-CCM-wrapped VMK.
fn decode_inner_key(plaintext: &[u8]) -> Option<Vec<u8>> {
    if plaintext.len() < 12 {
        return None;
    }
    let value_type = u16::from_le_bytes([plaintext[4], plaintext[5]]);
    if value_type != record::VALUE_KEY {
        return None;
    }
    Some(plaintext[12..].to_vec())
}

fn unwrap_vmk(vmk_record: &TaggedRecord, intermediate: &IntermediateKey) -> Result<[u8; 32], VolumeError> {
    let nested = match &vmk_record.record {
        Record::Vmk { nested, .. } => nested,
        _ => return Err(VolumeError::NoMatchingVmk),
    };
    let aes_ccm = record::find_nested(nested, record::VALUE_AES_CCM).ok_or(VolumeError::NoMatchingVmk)?;
    let (ccm_nonce, tag, ciphertext) = match &aes_ccm.record {
        Record::AesCcm { nonce, tag, ciphertext } => (nonce, tag, ciphertext),
        _ => return Err(VolumeError::NoMatchingVmk),
    };
    let key = AesKey::new(&intermediate.0)?;
    let plaintext = ccm::decrypt(&key, ccm_nonce, tag, ciphertext)?;

    let payload = decode_inner_key(&plaintext).ok_or(VolumeError::NoMatchingVmk)?;
    if payload.len() != 32 {
        return Err(VolumeError::NoMatchingVmk);
    }
    let mut vmk = [0u8; 32];
    vmk.copy_from_slice(&payload);
    Ok(vmk)
}

fn unwrap_fvek(dataset: &crate::metadata::record::Dataset, vmk: &[u8; 32]) -> Result<Fvek, VolumeError> {
    let fvek_record = dataset.find(None, record::VALUE_AES_CCM).ok_or(VolumeError::NoFvekRecord)?;
    let (nonce, tag, ciphertext) = match &fvek_record.record {
        Record::AesCcm { nonce, tag, ciphertext } => (nonce, tag, ciphertext),
        _ => return Err(VolumeError::NoFvekRecord),
    };
    let key = AesKey::new(vmk)?;
    let plaintext = ccm::decrypt(&key, nonce, tag, ciphertext)?;
    if plaintext.len() < 12 {
        return Err(VolumeError::NoFvekRecord);
    }
    let algorithm = u16::from_le_bytes([plaintext[8], plaintext[9]]);
    let material = plaintext[12..].to_vec();
    Ok(Fvek { algorithm, material })
}

fn find_salt(vmk_record: &TaggedRecord) -> Option<[u8; 16]> {
    let nested = match &vmk_record.record {
        Record::Vmk { nested, .. } => nested,
        _ => return None,
    };
    record::find_nested(nested, record::VALUE_STRETCH_KEY).and_then(|r| match &r.record {
        Record::StretchKey { salt, .. } => Some(*salt),
        _ => None,
    })
}

impl Volume {
    pub fn open(
        device: Box<dyn PositionedIo>,
        selector: CredentialSelector,
        config: OpenConfig,
    ) -> Result<Volume, VolumeError> {
        let meta = metadata::load(device.as_ref(), config.force_replica)?;

        if !config.allow_unsafe_state && !meta.information.curr_state.is_safe_to_mount() {
            return Err(VolumeError::UnsafeState(meta.information.curr_state));
        }

        if config.init_stop_at == Some(OpenStage::MetadataLoaded) {
            return Err(VolumeError::StoppedAt(OpenStage::MetadataLoaded));
        }

        // The FVEK-file path bypasses the VMK entirely: the file already
        // carries the full-volume-encryption key in the clear.
        let fvek = if let CredentialSelector::FvekFile(bytes) = &selector {
            decode_fvek_file(bytes)?
        } else {
            let (vmk_record, intermediate): (&TaggedRecord, IntermediateKey) = match &selector {
                CredentialSelector::ClearKey => {
                    let vmk_record = meta
                        .dataset
                        .find_vmk_by_priority(0x0000..=0x00ff)
                        .ok_or(VolumeError::NoMatchingVmk)?;
                    let nested = match &vmk_record.record {
                        Record::Vmk { nested, .. } => nested,
                        _ => return Err(VolumeError::NoMatchingVmk),
                    };
                    let key_record =
                        record::find_nested(nested, record::VALUE_KEY).ok_or(VolumeError::NoMatchingVmk)?;
                    let payload = match &key_record.record {
                        Record::Key { payload, .. } => payload.clone(),
                        _ => return Err(VolumeError::NoMatchingVmk),
                    };
                    if payload.len() != 32 {
                        return Err(VolumeError::NoMatchingVmk);
                    }
                    let mut buf = [0u8; 32];
                    buf.copy_from_slice(&payload);
                    (vmk_record, IntermediateKey(buf))
                }
                CredentialSelector::RecoveryPassword(password) => {
                    let vmk_record = meta
                        .dataset
                        .find_vmk_by_priority(0x0800..=0x0fff)
                        .ok_or(VolumeError::NoMatchingVmk)?;
                    let salt = find_salt(vmk_record).ok_or(VolumeError::MissingCredential)?;
                    let intermediate = crate::credential::recovery_password_key(password, &salt)
                        .map_err(|_| VolumeError::MissingCredential)?;
                    (vmk_record, intermediate)
                }
                CredentialSelector::UserPassword(password) => {
                    let vmk_record = meta
                        .dataset
                        .find_vmk_by_priority(0x2000..=0x2000)
                        .ok_or(VolumeError::NoMatchingVmk)?;
                    let salt = find_salt(vmk_record).ok_or(VolumeError::MissingCredential)?;
                    (vmk_record, crate::credential::user_password_key_str(password, &salt))
                }
                CredentialSelector::Vmk { key } => {
                    let vmk_record = meta
                        .dataset
                        .find_vmk_by_priority(0x0000..=0xffff)
                        .ok_or(VolumeError::NoMatchingVmk)?;
                    (vmk_record, IntermediateKey(*key))
                }
                CredentialSelector::BekFile(bytes) => {
                    let (guid, intermediate) = decode_bek_file(bytes)?;
                    let vmk_record =
                        meta.dataset.find_vmk_by_guid(&guid).ok_or(VolumeError::NoMatchingVmk)?;
                    (vmk_record, intermediate)
                }
                CredentialSelector::FvekFile(_) => unreachable!("handled before this match"),
            };

            let vmk = unwrap_vmk(vmk_record, &intermediate)?;
            if config.init_stop_at == Some(OpenStage::VmkUnwrapped) {
                return Err(VolumeError::StoppedAt(OpenStage::VmkUnwrapped));
            }
            unwrap_fvek(&meta.dataset, &vmk)?
        };

        if config.init_stop_at == Some(OpenStage::FvekUnwrapped) {
            return Err(VolumeError::StoppedAt(OpenStage::FvekUnwrapped));
        }

        let cipher = SectorCipher::new(fvek.algorithm, &fvek.material)?;

        if config.init_stop_at == Some(OpenStage::CipherReady) {
            return Err(VolumeError::StoppedAt(OpenStage::CipherReady));
        }

        let sector_size = meta.volume_header.sector_size as u64;
        let mut virtual_regions = Vec::new();
        for &offset in &meta.volume_header.information_offsets {
            virtual_regions.push(VirtualRegion { start: offset, len: meta.information.size as u64 + 4 });
        }
        if let Some((_, virtualized_size)) = meta
            .dataset
            .find(None, record::VALUE_VIRTUALIZATION_INFO)
            .and_then(|r| match &r.record {
                Record::VirtualizationInfo { backup_address, virtualized_size } => {
                    Some((*backup_address, *virtualized_size))
                }
                _ => None,
            })
        {
            if virtualized_size > 0 {
                virtual_regions.push(VirtualRegion { start: 0, len: virtualized_size });
            }
        }

        Ok(Volume {
            device,
            sector_size,
            version: meta.information.version,
            encrypted_volume_size: meta.information.encrypted_volume_size,
            nb_backup_sectors: meta.information.nb_backup_sectors,
            backup_address: meta.information.backup_address,
            virtual_regions,
            cipher,
            read_only: config.read_only,
            worker_threads: config.worker_threads_or_default(),
        })
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    /// Reported volume size: sector 0's `nb_sectors_64b` field (offset 0x28 of
    /// the NTFS boot sector), read through the normal fix-up/decrypt path
    /// rather than trusted from raw device length, times the sector size.
    /// Falls back to `encrypted_volume_size`, and then to the device's raw
    /// length, when sector 0 doesn't carry a usable count.
    pub fn volume_size(&self) -> Result<u64, VolumeError> {
        let mut sector0 = vec![0u8; self.sector_size as usize];
        if self.read_sector(0, &mut sector0).is_ok() && sector0.len() >= 0x30 {
            let nb_sectors = LittleEndian::read_u64(&sector0[0x28..0x30]);
            if nb_sectors != 0 {
                return Ok(nb_sectors * self.sector_size);
            }
        }

        if self.encrypted_volume_size != 0 {
            return Ok(self.encrypted_volume_size);
        }
        Ok(self.device.len()?)
    }

    fn is_virtualized(&self, sector_index: u64) -> bool {
        let offset = sector_index * self.sector_size;
        self.virtual_regions.iter().any(|r| r.contains_range(offset, self.sector_size))
    }

    fn extent_total_sectors(&self) -> u64 {
        if self.encrypted_volume_size == 0 {
            0
        } else {
            self.encrypted_volume_size / self.sector_size
        }
    }

    fn read_sector(&self, sector_index: u64, out: &mut [u8]) -> Result<(), VolumeError> {
        if self.is_virtualized(sector_index) {
            out.iter_mut().for_each(|b| *b = 0);
            return Ok(());
        }

        let fixup = sector_fixup(
            self.version,
            sector_index,
            self.sector_size,
            self.nb_backup_sectors,
            self.backup_address,
            self.encrypted_volume_size,
            self.extent_total_sectors(),
        );

        match fixup {
            FixupKind::SevenRedirect { real_sector } => {
                self.device.read_at(real_sector * self.sector_size, out)?;
                let real_offset = real_sector * self.sector_size;
                if self.encrypted_volume_size == 0 || real_offset < self.encrypted_volume_size {
                    self.cipher.decrypt_sector(real_sector, self.sector_size as usize, out);
                }
            }
            FixupKind::PastEncryptedExtent | FixupKind::VistaPassthrough => {
                self.device.read_at(sector_index * self.sector_size, out)?;
            }
            FixupKind::VistaBootSectorPatch => {
                self.device.read_at(sector_index * self.sector_size, out)?;
                header::vista_vbr_fve_to_ntfs(out);
            }
            FixupKind::Normal => {
                self.device.read_at(sector_index * self.sector_size, out)?;
                self.cipher.decrypt_sector(sector_index, self.sector_size as usize, out);
            }
            FixupKind::Virtualized => unreachable!("handled above"),
        }
        Ok(())
    }

    fn write_sector(&self, sector_index: u64, data: &[u8]) -> Result<(), VolumeError> {
        if self.is_virtualized(sector_index) {
            return Err(VolumeError::DeniedMetadataWrite);
        }

        let fixup = sector_fixup(
            self.version,
            sector_index,
            self.sector_size,
            self.nb_backup_sectors,
            self.backup_address,
            self.encrypted_volume_size,
            self.extent_total_sectors(),
        );

        let mut buf = data.to_vec();
        match fixup {
            FixupKind::SevenRedirect { real_sector } => {
                self.cipher.encrypt_sector(real_sector, self.sector_size as usize, &mut buf);
                self.device.write_at(real_sector * self.sector_size, &buf)?;
            }
            FixupKind::PastEncryptedExtent | FixupKind::VistaPassthrough => {
                self.device.write_at(sector_index * self.sector_size, &buf)?;
            }
            FixupKind::VistaBootSectorPatch => {
                header::vista_vbr_ntfs_to_fve(&mut buf);
                self.device.write_at(sector_index * self.sector_size, &buf)?;
            }
            FixupKind::Normal => {
                self.cipher.encrypt_sector(sector_index, self.sector_size as usize, &mut buf);
                self.device.write_at(sector_index * self.sector_size, &buf)?;
            }
            FixupKind::Virtualized => unreachable!("handled above"),
        }
        Ok(())
    }

    /// Read `len` logical plaintext bytes starting at `offset` into `out`.
    pub fn read(&self, offset: u64, len: u64, out: &mut [u8]) -> Result<(), VolumeError> {
        if out.len() as u64 != len {
            return Err(VolumeError::OffsetOutOfRange);
        }
        let volume_size = self.volume_size()?;
        if offset.checked_add(len).map_or(true, |end| end > volume_size) {
            return Err(VolumeError::OffsetOutOfRange);
        }

        let s = self.sector_size;
        let first_sector = offset / s;
        let last_sector = (offset + len - 1) / s;
        let sector_count = (last_sector - first_sector + 1) as usize;

        let mut sectors = vec![vec![0u8; s as usize]; sector_count];
        self.read_sectors_parallel(first_sector, &mut sectors)?;

        let start_in_first = (offset % s) as usize;
        let mut written = 0usize;
        for (i, sector) in sectors.iter().enumerate() {
            let sector_start = if i == 0 { start_in_first } else { 0 };
            let remaining = len as usize - written;
            let available = s as usize - sector_start;
            let take = remaining.min(available);
            out[written..written + take].copy_from_slice(&sector[sector_start..sector_start + take]);
            written += take;
            if written == len as usize {
                break;
            }
        }
        Ok(())
    }

    /// Write `len` logical plaintext bytes starting at `offset` from `data`.
    pub fn write(&self, offset: u64, len: u64, data: &[u8]) -> Result<(), VolumeError> {
        if self.read_only {
            return Err(VolumeError::ReadOnly);
        }
        if data.len() as u64 != len {
            return Err(VolumeError::OffsetOutOfRange);
        }
        let volume_size = self.volume_size()?;
        if offset.checked_add(len).map_or(true, |end| end > volume_size) {
            return Err(VolumeError::OffsetOutOfRange);
        }

        let s = self.sector_size;
        let first_sector = offset / s;
        let last_sector = (offset + len - 1) / s;
        let sector_count = (last_sector - first_sector + 1) as usize;

        // Read-modify-write: partial boundary sectors need their untouched
        // bytes preserved, so every sector touched is first decrypted.
        let mut sectors: Vec<Vec<u8>> = Vec::with_capacity(sector_count);
        for i in 0..sector_count {
            let idx = first_sector + i as u64;
            let mut buf = vec![0u8; s as usize];
            self.read_sector(idx, &mut buf)?;
            sectors.push(buf);
        }

        let start_in_first = (offset % s) as usize;
        let mut read_pos = 0usize;
        for (i, sector) in sectors.iter_mut().enumerate() {
            let sector_start = if i == 0 { start_in_first } else { 0 };
            let remaining = len as usize - read_pos;
            let available = s as usize - sector_start;
            let take = remaining.min(available);
            sector[sector_start..sector_start + take].copy_from_slice(&data[read_pos..read_pos + take]);
            read_pos += take;
            if read_pos == len as usize {
                break;
            }
        }

        for (i, sector) in sectors.iter().enumerate() {
            self.write_sector(first_sector + i as u64, sector)?;
        }
        Ok(())
    }

    fn read_sectors_parallel(&self, first_sector: u64, sectors: &mut [Vec<u8>]) -> Result<(), VolumeError> {
        if self.worker_threads <= 1 || sectors.len() <= 1 {
            for (i, sector) in sectors.iter_mut().enumerate() {
                self.read_sector(first_sector + i as u64, sector)?;
            }
            return Ok(());
        }

        let chunk_size = (sectors.len() + self.worker_threads - 1) / self.worker_threads;
        std::thread::scope(|scope| -> Result<(), VolumeError> {
            let mut handles = Vec::new();
            for (chunk_idx, chunk) in sectors.chunks_mut(chunk_size).enumerate() {
                let start = first_sector + (chunk_idx * chunk_size) as u64;
                let this = &*self;
                handles.push(scope.spawn(move || -> Result<(), VolumeError> {
                    for (i, sector) in chunk.iter_mut().enumerate() {
                        this.read_sector(start + i as u64, sector)?;
                    }
                    Ok(())
                }));
            }
            for handle in handles {
                handle.join().expect("sector worker thread panicked")?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::header::MetadataVersion;

    #[test]
    fn sector_fixup_classifies_seven_redirect() {
        let fixup = sector_fixup(MetadataVersion::SevenOrEight, 0, 512, 16, 0x10000, 0, 0);
        assert!(matches!(fixup, FixupKind::SevenRedirect { .. }));
    }

    #[test]
    fn sector_fixup_classifies_past_encrypted_extent() {
        let fixup = sector_fixup(MetadataVersion::SevenOrEight, 100, 512, 0, 0, 512 * 50, 50);
        assert_eq!(fixup, FixupKind::PastEncryptedExtent);
    }

    #[test]
    fn sector_fixup_classifies_vista_boot_sector_patch() {
        let fixup = sector_fixup(MetadataVersion::Vista, 0, 512, 0, 0, 512 * 1000, 1000);
        assert_eq!(fixup, FixupKind::VistaBootSectorPatch);
        let fixup_last = sector_fixup(MetadataVersion::Vista, 999, 512, 0, 0, 512 * 1000, 1000);
        assert_eq!(fixup_last, FixupKind::VistaBootSectorPatch);
    }

    #[test]
    fn sector_fixup_classifies_vista_passthrough_sectors() {
        let fixup = sector_fixup(MetadataVersion::Vista, 1, 512, 0, 0, 512 * 1000, 1000);
        assert_eq!(fixup, FixupKind::VistaPassthrough);
        let fixup_15 = sector_fixup(MetadataVersion::Vista, 15, 512, 0, 0, 512 * 1000, 1000);
        assert_eq!(fixup_15, FixupKind::VistaPassthrough);
    }

    #[test]
    fn sector_fixup_normal_path() {
        let fixup = sector_fixup(MetadataVersion::Vista, 500, 512, 0, 0, 512 * 1000, 1000);
        assert_eq!(fixup, FixupKind::Normal);
    }

    #[test]
    fn virtual_region_overlap() {
        let r = VirtualRegion { start: 100, len: 50 };
        assert!(r.contains_range(120, 10));
        assert!(!r.contains_range(200, 10));
        assert!(r.contains_range(90, 20));
    }
}
