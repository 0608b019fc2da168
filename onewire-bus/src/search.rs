use crate::{
    AnyDevices, BusSpeed, OneWire, OneWireError, OneWireMaster, OneWireResult, OneWireStatus,
    ResetOutcome, RomId,
    consts::{ONEWIRE_CONDITIONAL_SEARCH_CMD, ONEWIRE_SEARCH_CMD, ROM_ID_BITS, ROM_ID_SIZE},
};
use alloc::vec::Vec;
use core::iter::FusedIterator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
/// Type of search performed with a [`SearchCursor`].
pub enum SearchKind {
    /// Normal search
    #[default]
    Normal = ONEWIRE_SEARCH_CMD,
    /// Search only for devices with alarm
    Alarmed = ONEWIRE_CONDITIONAL_SEARCH_CMD,
}

/// State of one enumeration pass over a bus.
///
/// A cursor is created at the start of a listing and advanced one device at a time
/// with [`next_both`]. Once the pass ends the cursor stays exhausted.
#[derive(Debug, Clone)]
pub struct SearchCursor {
    kind: SearchKind,
    family: Option<u8>,
    rom: [u8; ROM_ID_SIZE],
    last_discrepancy: Option<u8>,
    last_device: bool,
    started: bool,
    gulp: Option<Vec<RomId>>,
    gulp_index: usize,
}

impl SearchCursor {
    /// Creates a cursor for a fresh pass.
    pub fn new(kind: SearchKind) -> Self {
        Self {
            kind,
            family: None,
            rom: [0; ROM_ID_SIZE],
            last_discrepancy: None,
            last_device: false,
            started: false,
            gulp: None,
            gulp_index: 0,
        }
    }

    /// Creates a cursor that starts at `family` and ends the pass at the first
    /// device of another family.
    pub fn with_family(kind: SearchKind, family: u8) -> Self {
        let mut cursor = Self::new(kind);
        cursor.family = Some(family);
        cursor.rom[0] = family;
        cursor.last_discrepancy = Some(ROM_ID_BITS - 1);
        cursor
    }

    /// Creates a cursor whose first step replays every bit of `rom`.
    /// The step finds `rom` only if that device is on the bus.
    pub fn verify(kind: SearchKind, rom: &RomId) -> Self {
        let mut cursor = Self::new(kind);
        cursor.rom = *rom.as_bytes();
        cursor.last_discrepancy = Some(ROM_ID_BITS);
        cursor
    }

    /// Search kind.
    pub fn kind(&self) -> SearchKind {
        self.kind
    }

    /// ROM command byte that starts a pass.
    pub fn command(&self) -> u8 {
        self.kind as u8
    }

    /// Family filter, if any.
    pub fn family(&self) -> Option<u8> {
        self.family
    }

    /// ROM ID found by the last step.
    pub fn rom(&self) -> RomId {
        RomId::new(self.rom)
    }

    /// Bit position (0..64) of the last unexplored discrepancy, [`None`] before the first step.
    pub fn last_discrepancy(&self) -> Option<u8> {
        self.last_discrepancy
    }

    /// Whether a step of this pass has run.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the pass is exhausted.
    pub fn is_last_device(&self) -> bool {
        self.last_device
    }

    /// Branch to take at `bit` if devices disagree there: earlier choices are
    /// replayed, the last discrepancy flips to 1, later ones take 0.
    pub fn direction(&self, bit: u8) -> bool {
        match self.last_discrepancy {
            None => false,
            Some(ld) if bit < ld => self.rom[(bit / 8) as usize] & (1 << (bit % 8)) != 0,
            Some(ld) => bit == ld,
        }
    }

    /// ROM pattern whose bits are the branch choices of the next step.
    /// Accelerated adapters take it as their search input.
    pub fn replay_rom(&self) -> [u8; ROM_ID_SIZE] {
        let mut out = [0u8; ROM_ID_SIZE];
        for bit in 0..ROM_ID_BITS {
            if self.direction(bit) {
                out[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        out
    }

    /// Records the result of a step. `last_discrepancy` is the highest bit where the
    /// 0 branch was taken with devices disagreeing; [`None`] makes this the last device.
    pub fn record(&mut self, rom: [u8; ROM_ID_SIZE], last_discrepancy: Option<u8>) {
        self.rom = rom;
        self.last_discrepancy = last_discrepancy;
        self.last_device = last_discrepancy.is_none();
    }

    /// Ends the pass.
    pub fn finish(&mut self) {
        self.last_device = true;
    }

    /// Whether an adapter has already fetched the whole listing into this cursor.
    pub fn is_gulped(&self) -> bool {
        self.gulp.is_some()
    }

    /// Stores a complete listing fetched in one exchange.
    pub fn store_gulp(&mut self, roms: Vec<RomId>) {
        self.gulp = Some(roms);
        self.gulp_index = 0;
    }

    /// Next ROM ID of a stored listing.
    pub fn next_gulped(&mut self) -> Option<RomId> {
        let rom = self.gulp.as_ref()?.get(self.gulp_index).copied();
        if rom.is_some() {
            self.gulp_index += 1;
        }
        rom
    }
}

/// Advances a search pass by one device.
///
/// # Returns
/// - `Ok(Some(rom))`: the next device.
/// - `Ok(None)`: the pass is complete. An empty bus ends on the first call, and an
///   all-ones ID (nothing answered) ends it as well.
/// - `Err(_)`: the pass is aborted. A ROM ID with a bad CRC8 or a zero family code
///   gives [`OneWireError::InvalidRomCrc`].
///
/// After `Ok(None)` or an error the cursor is exhausted.
pub fn next_both<M: OneWireMaster + ?Sized>(
    master: &mut M,
    cursor: &mut SearchCursor,
) -> OneWireResult<Option<RomId>, M::Error> {
    if cursor.is_last_device() {
        return Ok(None);
    }
    cursor.started = true;
    let found = match master.search_next(cursor) {
        Ok(found) => found,
        Err(e) => {
            cursor.finish();
            return Err(e);
        }
    };
    let Some(rom) = found else {
        cursor.finish();
        return Ok(None);
    };
    if rom.as_bytes() == &[0xff; ROM_ID_SIZE] {
        cursor.finish();
        return Ok(None);
    }
    if !rom.is_valid() {
        log::debug!("search returned invalid ROM ID {rom:?}");
        cursor.finish();
        return Err(OneWireError::InvalidRomCrc);
    }
    if cursor.family().is_some_and(|f| f != rom.family()) {
        cursor.finish();
        return Ok(None);
    }
    Ok(Some(rom))
}

/// One step of the [1-Wire search algorithm](https://www.analog.com/en/resources/app-notes/1wire-search-algorithm.html)
/// over a bit-level bridge.
///
/// Uses the bridge's triplet command when available, otherwise two read slots and a
/// write slot per bit.
pub fn search_bitwise<T: OneWire + ?Sized>(
    onewire: &mut T,
    cursor: &mut SearchCursor,
) -> OneWireResult<Option<RomId>, T::BusError> {
    let status = match onewire.reset() {
        Ok(status) => status,
        Err(OneWireError::NoDevicePresent) => return Ok(None),
        Err(e) => return Err(e),
    };
    if status.shortcircuit() {
        return Err(OneWireError::ShortCircuit);
    }
    if !status.presence() {
        return Ok(None);
    }
    onewire.write_byte(cursor.command())?;
    let mut rom = [0u8; ROM_ID_SIZE];
    let mut last_zero = None;
    for bit in 0..ROM_ID_BITS {
        let dir = cursor.direction(bit);
        let (id_bit, complement_bit, write) = match onewire.read_triplet(dir) {
            Ok(triplet) => (triplet.0, triplet.1, false),
            Err(OneWireError::Unimplemented) => {
                let id_bit = onewire.read_bit()?;
                let complement_bit = onewire.read_bit()?;
                (id_bit, complement_bit, true)
            }
            Err(e) => return Err(e),
        };
        if id_bit && complement_bit {
            if bit == 0 {
                // nobody took part, e.g. no device in alarm state
                return Ok(None);
            }
            return Err(OneWireError::SearchCollision);
        }
        let set = if id_bit != complement_bit {
            id_bit
        } else {
            if !dir {
                last_zero = Some(bit);
            }
            dir
        };
        if set {
            rom[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        if write {
            onewire.write_bit(set)?;
        }
    }
    cursor.record(rom, last_zero);
    Ok(Some(RomId::new(rom)))
}

/// A [`OneWireMaster`] built on a bit-level [`OneWire`] bridge.
pub struct BitBanged<T> {
    onewire: T,
    any_devices: AnyDevices,
    speed: BusSpeed,
}

impl<T: OneWire> BitBanged<T> {
    /// Wraps a bit-level bridge.
    pub fn new(mut onewire: T) -> Self {
        let speed = if onewire.get_overdrive_mode() {
            BusSpeed::Overdrive
        } else {
            BusSpeed::Regular
        };
        Self {
            onewire,
            any_devices: AnyDevices::Unknown,
            speed,
        }
    }
}

impl<T> BitBanged<T> {
    /// The wrapped bridge.
    pub fn inner(&mut self) -> &mut T {
        &mut self.onewire
    }

    /// Unwraps the bridge.
    pub fn into_inner(self) -> T {
        self.onewire
    }
}

impl<T: OneWire> OneWireMaster for BitBanged<T> {
    type Error = T::BusError;

    fn reset(&mut self) -> OneWireResult<ResetOutcome, Self::Error> {
        match self.onewire.reset() {
            Ok(status) if status.shortcircuit() => {
                self.any_devices = AnyDevices::Unknown;
                Ok(ResetOutcome::Short)
            }
            Ok(status) => {
                self.any_devices = status.presence().into();
                Ok(ResetOutcome::Ok)
            }
            Err(OneWireError::NoDevicePresent) => {
                self.any_devices = AnyDevices::No;
                Ok(ResetOutcome::Ok)
            }
            Err(OneWireError::ShortCircuit) => {
                self.any_devices = AnyDevices::Unknown;
                Ok(ResetOutcome::Short)
            }
            Err(e) => Err(e),
        }
    }

    fn write_read(&mut self, out: &[u8], input: &mut [u8]) -> OneWireResult<usize, Self::Error> {
        if input.len() < out.len() {
            return Err(OneWireError::ShortRead {
                expected: out.len(),
                received: input.len(),
            });
        }
        for (o, i) in out.iter().zip(input.iter_mut()) {
            *i = self.onewire.touch_byte(*o)?;
        }
        Ok(out.len())
    }

    fn search_next(
        &mut self,
        cursor: &mut SearchCursor,
    ) -> OneWireResult<Option<RomId>, Self::Error> {
        let found = search_bitwise(&mut self.onewire, cursor)?;
        if found.is_some() {
            self.any_devices = AnyDevices::Yes;
        }
        Ok(found)
    }

    fn any_devices(&self) -> AnyDevices {
        self.any_devices
    }

    fn speed(&self) -> BusSpeed {
        self.speed
    }

    fn set_speed(&mut self, speed: BusSpeed) -> OneWireResult<(), Self::Error> {
        match speed {
            BusSpeed::Regular => self.onewire.set_overdrive_mode(false)?,
            BusSpeed::Overdrive => self.onewire.set_overdrive_mode(true)?,
            BusSpeed::Flexible => return Err(OneWireError::InvalidSpeed),
        }
        self.speed = speed;
        Ok(())
    }
}

/// Lazy iterator over the devices of one search pass.
///
/// Yields each device once, then ends. The first error is yielded and ends the
/// pass as well; devices yielded before it form a partial listing.
pub struct Search<'a, M: OneWireMaster + ?Sized> {
    master: &'a mut M,
    cursor: SearchCursor,
    done: bool,
}

impl<'a, M: OneWireMaster + ?Sized> Search<'a, M> {
    /// Starts a pass of the given kind.
    pub fn new(master: &'a mut M, kind: SearchKind) -> Self {
        Self::with_cursor(master, SearchCursor::new(kind))
    }

    /// Starts a pass from a prepared cursor, such as [`SearchCursor::with_family`].
    pub fn with_cursor(master: &'a mut M, cursor: SearchCursor) -> Self {
        Self {
            master,
            cursor,
            done: false,
        }
    }

    /// Cursor state of the pass.
    pub fn cursor(&self) -> &SearchCursor {
        &self.cursor
    }
}

impl<M: OneWireMaster + ?Sized> Iterator for Search<'_, M> {
    type Item = OneWireResult<RomId, M::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match next_both(self.master, &mut self.cursor) {
            Ok(Some(rom)) => Some(Ok(rom)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<M: OneWireMaster + ?Sized> FusedIterator for Search<'_, M> {}
