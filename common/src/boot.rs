use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::flash::{check_erase_alignment, BlockDevice, FlashError, FlashRegion};

pub const NO_PENDING_GENERATION: u32 = u32::MAX;

const RECORD_MAGIC: [u8; 4] = *b"ACID";
const RECORD_LEN: usize = 24;
const CHECKED_LEN: usize = 20;
const SLOT_COUNT: usize = 2;

const STATUS_NORMAL: u8 = 0x01;
const STATUS_ONGOING: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootStatus {
    Normal,
    Ongoing,
}

impl BootStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Ongoing => "ONGOING",
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Normal => STATUS_NORMAL,
            Self::Ongoing => STATUS_ONGOING,
        }
    }

    fn from_byte(value: u8) -> Option<Self> {
        match value {
            STATUS_NORMAL => Some(Self::Normal),
            STATUS_ONGOING => Some(Self::Ongoing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootRecord {
    #[serde(rename = "currentGeneration")]
    pub current_generation: u32,
    #[serde(rename = "pendingGeneration")]
    pub pending_generation: u32,
    pub status: BootStatus,
}

impl Default for BootRecord {
    fn default() -> Self {
        Self {
            current_generation: 0,
            pending_generation: NO_PENDING_GENERATION,
            status: BootStatus::Normal,
        }
    }
}

impl BootRecord {
    pub fn pending(&self) -> Option<u32> {
        (self.pending_generation != NO_PENDING_GENERATION).then_some(self.pending_generation)
    }
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("boot flash access failed: {0}")]
    Flash(#[from] FlashError),
    #[error("invalid flash layout: {0}")]
    Layout(String),
    #[error("boot record store failed: {0}")]
    Store(String),
}

pub trait BootStateStore {
    fn read(&mut self) -> Result<BootRecord, BootError>;
    fn commit(&mut self, record: &BootRecord) -> Result<(), BootError>;
    fn erase_alternate_bank(&mut self) -> Result<(), BootError>;
}

impl<S: BootStateStore + ?Sized> BootStateStore for &mut S {
    fn read(&mut self) -> Result<BootRecord, BootError> {
        (**self).read()
    }

    fn commit(&mut self, record: &BootRecord) -> Result<(), BootError> {
        (**self).commit(record)
    }

    fn erase_alternate_bank(&mut self) -> Result<(), BootError> {
        (**self).erase_alternate_bank()
    }
}

/// Confirms a freshly booted bank and promotes any pending generation.
///
/// Must run once, before any service loop starts. Order: persist the
/// confirmation, erase the alternate bank, then promote the pending
/// generation. A failed erase aborts startup; a failed promotion leaves the
/// generation pending.
pub fn validate_boot_state<S: BootStateStore + ?Sized>(
    store: &mut S,
) -> Result<BootRecord, BootError> {
    let mut record = store.read()?;
    info!(
        "boot record: current {}, pending {}, status {}",
        record.current_generation,
        describe_pending(&record),
        record.status.as_str()
    );

    if record.status == BootStatus::Ongoing {
        record.status = BootStatus::Normal;
        store.commit(&record)?;
        info!("boot confirmed, status now {}", record.status.as_str());

        if let Err(err) = store.erase_alternate_bank() {
            error!("failed to erase alternate flash bank: {err}");
            return Err(err);
        }
        debug!("alternate flash bank erased");
    }

    if let Some(pending) = record.pending() {
        let promoted = BootRecord {
            current_generation: pending,
            pending_generation: NO_PENDING_GENERATION,
            ..record
        };
        match store.commit(&promoted) {
            Ok(()) => {
                info!("generation {pending} is now current");
                record = promoted;
            }
            Err(err) => warn!("failed to promote pending generation {pending}: {err}"),
        }
    }

    Ok(record)
}

fn describe_pending(record: &BootRecord) -> String {
    match record.pending() {
        Some(generation) => generation.to_string(),
        None => "none".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashLayout {
    // Two record slots, one erase unit each.
    pub metadata: FlashRegion,
    // Bank 1 receives updates and is erased after a confirmed boot.
    pub banks: [FlashRegion; 2],
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self {
            metadata: FlashRegion::new(0x0000_0000, 0x0000_2000),
            banks: [
                FlashRegion::new(0x0001_0000, 0x0007_0000),
                FlashRegion::new(0x0008_0000, 0x0007_0000),
            ],
        }
    }
}

impl FlashLayout {
    pub const ACTIVE_BANK: usize = 0;
    pub const ALTERNATE_BANK: usize = 1;

    pub fn validate(&self, capacity: u32, erase_size: u32) -> Result<(), BootError> {
        let regions = [
            ("metadata", self.metadata),
            ("bank 0", self.banks[0]),
            ("bank 1", self.banks[1]),
        ];

        for (name, region) in regions {
            if region.size == 0 {
                return Err(BootError::Layout(format!("{name} region is empty")));
            }
            if region.end() > u64::from(capacity) {
                return Err(BootError::Layout(format!(
                    "{name} region ends at {:#x}, past device capacity {capacity:#x}",
                    region.end()
                )));
            }
            check_erase_alignment(erase_size, region.offset, region.size)
                .map_err(|err| BootError::Layout(format!("{name} region: {err}")))?;
        }

        if u64::from(self.metadata.size) < SLOT_COUNT as u64 * u64::from(erase_size) {
            return Err(BootError::Layout(format!(
                "metadata region needs {SLOT_COUNT} erase units of {erase_size:#x} bytes"
            )));
        }

        for (i, (name_a, a)) in regions.iter().enumerate() {
            for (name_b, b) in regions.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(BootError::Layout(format!("{name_a} overlaps {name_b}")));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotState {
    slot: usize,
    sequence: u32,
}

/// [`BootStateStore`] over a pair of record slots on a [`BlockDevice`].
///
/// Each commit goes to the slot that does not hold the latest record, with
/// the sequence number bumped, so a torn write loses at most the record
/// being written.
pub struct FlashBootStore<D> {
    device: D,
    layout: FlashLayout,
    latest: Option<SlotState>,
    scanned: bool,
}

impl<D: BlockDevice> FlashBootStore<D> {
    pub fn new(device: D, layout: FlashLayout) -> Result<Self, BootError> {
        layout.validate(device.capacity(), device.erase_size())?;
        Ok(Self {
            device,
            layout,
            latest: None,
            scanned: false,
        })
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    pub fn alternate_bank(&self) -> FlashRegion {
        self.layout.banks[FlashLayout::ALTERNATE_BANK]
    }

    pub fn active_bank(&self) -> FlashRegion {
        self.layout.banks[FlashLayout::ACTIVE_BANK]
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    pub fn stage_update(&mut self, generation: u32) -> Result<BootRecord, BootError> {
        let mut record = self.read()?;
        record.pending_generation = generation;
        record.status = BootStatus::Ongoing;
        self.commit(&record)?;
        info!("staged generation {generation} for validation on next boot");
        Ok(record)
    }

    fn slot_offset(&self, slot: usize) -> u32 {
        self.layout.metadata.offset + slot as u32 * self.device.erase_size()
    }

    fn read_slot(&mut self, slot: usize) -> Result<Option<(u32, BootRecord)>, BootError> {
        let mut raw = [0_u8; RECORD_LEN];
        self.device.read(self.slot_offset(slot), &mut raw)?;
        Ok(decode_record(&raw))
    }

    fn scan(&mut self) -> Result<Option<BootRecord>, BootError> {
        let mut best: Option<(SlotState, BootRecord)> = None;
        for slot in 0..SLOT_COUNT {
            if let Some((sequence, record)) = self.read_slot(slot)? {
                let newer = best
                    .as_ref()
                    .map_or(true, |(state, _)| sequence > state.sequence);
                if newer {
                    best = Some((SlotState { slot, sequence }, record));
                }
            }
        }

        self.scanned = true;
        self.latest = best.as_ref().map(|(state, _)| *state);
        Ok(best.map(|(_, record)| record))
    }
}

impl<D: BlockDevice> BootStateStore for FlashBootStore<D> {
    fn read(&mut self) -> Result<BootRecord, BootError> {
        Ok(self.scan()?.unwrap_or_default())
    }

    fn commit(&mut self, record: &BootRecord) -> Result<(), BootError> {
        if !self.scanned {
            self.scan()?;
        }

        let (slot, sequence) = match self.latest {
            Some(state) => ((state.slot + 1) % SLOT_COUNT, state.sequence.wrapping_add(1)),
            None => (0, 1),
        };

        let offset = self.slot_offset(slot);
        let erase_size = self.device.erase_size();
        self.device.erase(offset, erase_size)?;
        self.device.write(offset, &encode_record(sequence, record))?;

        self.latest = Some(SlotState { slot, sequence });
        Ok(())
    }

    fn erase_alternate_bank(&mut self) -> Result<(), BootError> {
        let bank = self.alternate_bank();
        self.device.erase(bank.offset, bank.size)?;
        Ok(())
    }
}

fn record_checksum(bytes: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(bytes);
    [digest[0], digest[1], digest[2], digest[3]]
}

fn encode_record(sequence: u32, record: &BootRecord) -> [u8; RECORD_LEN] {
    let mut raw = [0_u8; RECORD_LEN];
    raw[0..4].copy_from_slice(&RECORD_MAGIC);
    raw[4..8].copy_from_slice(&sequence.to_le_bytes());
    raw[8..12].copy_from_slice(&record.current_generation.to_le_bytes());
    raw[12..16].copy_from_slice(&record.pending_generation.to_le_bytes());
    raw[16] = record.status.to_byte();
    let checksum = record_checksum(&raw[..CHECKED_LEN]);
    raw[CHECKED_LEN..].copy_from_slice(&checksum);
    raw
}

fn decode_record(raw: &[u8; RECORD_LEN]) -> Option<(u32, BootRecord)> {
    if raw[0..4] != RECORD_MAGIC || raw[CHECKED_LEN..] != record_checksum(&raw[..CHECKED_LEN]) {
        return None;
    }

    let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
    let record = BootRecord {
        current_generation: word(8),
        pending_generation: word(12),
        status: BootStatus::from_byte(raw[16])?,
    };
    Some((word(4), record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{region_is_erased, MemFlash};
    use pretty_assertions::assert_eq;

    const CAPACITY: u32 = 0x0010_0000;
    const ERASE: u32 = 0x1000;

    fn store() -> FlashBootStore<MemFlash> {
        FlashBootStore::new(MemFlash::new(CAPACITY, ERASE), FlashLayout::default()).unwrap()
    }

    fn fill_alternate_bank(store: &mut FlashBootStore<MemFlash>) {
        let bank = store.alternate_bank();
        store.device_mut().write(bank.offset, &[0xA5; 512]).unwrap();
    }

    #[test]
    fn blank_flash_reads_as_default_record() {
        let mut store = store();
        assert_eq!(store.read().unwrap(), BootRecord::default());
        assert_eq!(store.read().unwrap().pending(), None);
    }

    #[test]
    fn commit_round_trips_and_alternates_slots() {
        let mut store = store();
        let first = BootRecord {
            current_generation: 3,
            pending_generation: 4,
            status: BootStatus::Ongoing,
        };
        store.commit(&first).unwrap();
        assert_eq!(store.read().unwrap(), first);

        let second = BootRecord {
            current_generation: 4,
            ..BootRecord::default()
        };
        store.commit(&second).unwrap();
        assert_eq!(store.read().unwrap(), second);

        // Both slots now hold a record; a fresh store must pick the newer one.
        let mut reopened = FlashBootStore::new(store.into_inner(), FlashLayout::default()).unwrap();
        assert_eq!(reopened.read().unwrap(), second);
    }

    #[test]
    fn torn_commit_keeps_previous_record() {
        let mut store = store();
        let committed = BootRecord {
            current_generation: 7,
            ..BootRecord::default()
        };
        store.commit(&committed).unwrap();

        store.device_mut().tear_next_write(10);
        let attempted = BootRecord {
            current_generation: 8,
            ..BootRecord::default()
        };
        assert!(store.commit(&attempted).is_err());

        let mut reopened = FlashBootStore::new(store.into_inner(), FlashLayout::default()).unwrap();
        assert_eq!(reopened.read().unwrap(), committed);
    }

    #[test]
    fn ongoing_boot_is_confirmed_and_alternate_bank_erased() {
        let mut store = store();
        store.commit(&BootRecord {
            current_generation: 1,
            pending_generation: 2,
            status: BootStatus::Ongoing,
        })
        .unwrap();
        fill_alternate_bank(&mut store);

        let record = validate_boot_state(&mut store).unwrap();

        assert_eq!(record.status, BootStatus::Normal);
        assert_eq!(record.current_generation, 2);
        assert_eq!(record.pending(), None);
        assert_eq!(store.read().unwrap(), record);

        let bank = store.alternate_bank();
        assert!(region_is_erased(store.device_mut(), bank).unwrap());
    }

    #[test]
    fn erase_failure_aborts_startup_without_promoting() {
        let mut store = store();
        store.commit(&BootRecord {
            current_generation: 1,
            pending_generation: 2,
            status: BootStatus::Ongoing,
        })
        .unwrap();
        store.device_mut().set_fail_erase(true);

        let err = validate_boot_state(&mut store).unwrap_err();
        assert!(matches!(err, BootError::Flash(FlashError::Device(_))));

        store.device_mut().set_fail_erase(false);
        let record = store.read().unwrap();
        assert_eq!(record.current_generation, 1);
        assert_eq!(record.pending(), Some(2));
    }

    #[test]
    fn validation_is_idempotent() {
        let mut store = store();
        store.stage_update(5).unwrap();
        fill_alternate_bank(&mut store);

        let first = validate_boot_state(&mut store).unwrap();
        let erases_after_first = store.device_mut().erase_count();
        let second = validate_boot_state(&mut store).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.read().unwrap(), first);
        assert_eq!(store.device_mut().erase_count(), erases_after_first);
    }

    #[test]
    fn normal_boot_without_pending_touches_nothing() {
        let mut store = store();
        fill_alternate_bank(&mut store);

        let record = validate_boot_state(&mut store).unwrap();

        assert_eq!(record, BootRecord::default());
        assert_eq!(store.device_mut().erase_count(), 0);
        let bank = store.alternate_bank();
        assert!(!region_is_erased(store.device_mut(), bank).unwrap());
    }

    struct ScriptedStore {
        record: BootRecord,
        commits: usize,
        fail_commit_from: Option<usize>,
        erased: bool,
    }

    impl BootStateStore for ScriptedStore {
        fn read(&mut self) -> Result<BootRecord, BootError> {
            Ok(self.record)
        }

        fn commit(&mut self, record: &BootRecord) -> Result<(), BootError> {
            self.commits += 1;
            if self.fail_commit_from.is_some_and(|from| self.commits >= from) {
                return Err(BootError::Store("commit rejected".to_string()));
            }
            self.record = *record;
            Ok(())
        }

        fn erase_alternate_bank(&mut self) -> Result<(), BootError> {
            self.erased = true;
            Ok(())
        }
    }

    #[test]
    fn failed_promotion_is_not_fatal_and_stays_pending() {
        let mut store = ScriptedStore {
            record: BootRecord {
                current_generation: 1,
                pending_generation: 2,
                status: BootStatus::Ongoing,
            },
            commits: 0,
            fail_commit_from: Some(2),
            erased: false,
        };

        let record = validate_boot_state(&mut store).unwrap();

        assert!(store.erased);
        assert_eq!(record.status, BootStatus::Normal);
        assert_eq!(record.current_generation, 1);
        assert_eq!(record.pending(), Some(2));
        assert_eq!(store.record, record);
    }

    #[test]
    fn failed_confirmation_is_fatal() {
        let mut store = ScriptedStore {
            record: BootRecord {
                status: BootStatus::Ongoing,
                ..BootRecord::default()
            },
            commits: 0,
            fail_commit_from: Some(1),
            erased: false,
        };

        assert!(validate_boot_state(&mut store).is_err());
        assert!(!store.erased);
    }

    #[test]
    fn layout_validation_rejects_overlap_and_misalignment() {
        let mut layout = FlashLayout::default();
        layout.banks[1].offset = layout.banks[0].offset + ERASE;
        assert!(matches!(
            layout.validate(CAPACITY, ERASE),
            Err(BootError::Layout(_))
        ));

        let mut layout = FlashLayout::default();
        layout.banks[0].offset += 1;
        assert!(layout.validate(CAPACITY, ERASE).is_err());

        let mut layout = FlashLayout::default();
        layout.metadata.size = ERASE;
        assert!(layout.validate(CAPACITY, ERASE).is_err());

        assert!(FlashLayout::default().validate(CAPACITY, ERASE).is_ok());
    }
}
