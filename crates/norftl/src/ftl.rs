//! The translation engine.
//!
//! [`Ftl`] ties the pieces together: it mounts (or formats) a volume on a
//! [`NorFlash`] device, serves sector reads and writes through the page
//! cache, and flushes pending updates with a sync protocol whose ordering
//! makes power loss recoverable at any device-call boundary.
//!
//! # Crash ordering
//!
//! Sync programs data pages first, then secondary table pages, and the
//! master table last. The master's generation serial only advances when the
//! master itself relocates, and a torn master program fails its header CRC,
//! so a remount always lands on the newest *complete* master: either the
//! pre-sync or the post-sync snapshot, never a mixture.

use tracing::{debug, info, warn};

use norftl_common::constants::{
    PAGE_SIZE, SECTOR_SIZE, SECTORS_PER_PAGE, TT_HEADER_SIZE, TT_RECORDS_PER_PAGE,
};
use norftl_common::{LogicalPageNo, PhysicalPageNo};

use crate::buffer::{BufferCache, ProgramMode};
use crate::error::{FtlError, FtlResult};
use crate::geometry::Geometry;
use crate::hal::NorFlash;
use crate::state::{PageState, PageStateMap};
use crate::table::{self, PageInfo, TableHeader};

/// Flash translation layer over a NOR device.
///
/// Exposes 512-byte logical sectors; see the crate docs for the data model.
/// The engine is single-threaded: callers serialize access, and dropping it
/// discards pending updates — call [`Ftl::sync`] first when durability is
/// required.
pub struct Ftl<F: NorFlash> {
    hal: F,
    geometry: Geometry,
    /// Physical location of the master translation table.
    mtt_physical: PhysicalPageNo,
    /// Next physical page the allocator examines.
    write_frontier: PhysicalPageNo,
    state: PageStateMap,
    cache: BufferCache,
}

impl<F: NorFlash> Ftl<F> {
    /// Mounts the volume on `hal`, formatting a fresh one when no valid
    /// master table exists on the device.
    pub fn new(hal: F, geometry: Geometry) -> FtlResult<Self> {
        let mut ftl = Self {
            hal,
            geometry,
            mtt_physical: PhysicalPageNo::new(0),
            write_frontier: PhysicalPageNo::new(0),
            state: PageStateMap::new(geometry.page_count),
            cache: BufferCache::new(geometry.slot_count),
        };

        if !ftl.load_volume()? {
            ftl.format_volume()?;
        }
        Ok(ftl)
    }

    /// Device geometry this volume was mounted with.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Number of sectors exposed to the caller.
    pub fn usable_sectors(&self) -> u32 {
        self.geometry.usable_sector_count
    }

    /// Releases the engine without flushing and returns the device.
    pub fn into_hal(self) -> F {
        self.hal
    }

    /// Reads sector `sector` into `out`.
    ///
    /// A sector that was never written reads as all-ones.
    pub fn read_sector(&mut self, sector: u32, out: &mut [u8; SECTOR_SIZE]) -> FtlResult<()> {
        if sector >= self.geometry.usable_sector_count {
            return Err(FtlError::SectorOutOfRange {
                start: sector,
                end: sector.saturating_add(1),
                limit: self.geometry.usable_sector_count,
            });
        }

        let logical = self.geometry.logical_page_of_sector(sector);
        let sector_in_page = sector as usize % SECTORS_PER_PAGE;

        let info = self.read_page_info(logical)?;
        if info.is_sector_blank(sector_in_page) {
            out.fill(0xFF);
            return Ok(());
        }

        let index = self.cache.load(&mut self.hal, logical, info.physical)?;
        let start = sector_in_page * SECTOR_SIZE;
        out.copy_from_slice(&self.cache.slot(index).data[start..start + SECTOR_SIZE]);
        Ok(())
    }

    /// Writes whole sectors starting at `start_sector`; `data` must be a
    /// multiple of the sector size.
    ///
    /// Updates are buffered and reach the device on [`Ftl::sync`], which the
    /// engine also invokes itself when the cache runs out of slack.
    pub fn write_sectors(&mut self, start_sector: u32, data: &[u8]) -> FtlResult<()> {
        if data.len() % SECTOR_SIZE != 0 {
            return Err(FtlError::UnalignedLength { len: data.len() });
        }
        let count = (data.len() / SECTOR_SIZE) as u32;

        self.resolve_states(self.geometry.table_page_count as usize);

        let end = start_sector.checked_add(count);
        match end {
            Some(end) if end <= self.geometry.usable_sector_count => {}
            _ => {
                return Err(FtlError::SectorOutOfRange {
                    start: start_sector,
                    end: end.unwrap_or(u32::MAX),
                    limit: self.geometry.usable_sector_count,
                })
            }
        }

        for (i, payload) in data.chunks_exact(SECTOR_SIZE).enumerate() {
            self.write_one_sector(start_sector + i as u32, payload)?;
        }
        Ok(())
    }

    /// Flushes every pending update.
    ///
    /// Phase order: data pages, then secondary tables, then the master
    /// table. Within a phase the order among slots is irrelevant. A second
    /// sync with nothing pending touches the device only to read.
    pub fn sync(&mut self) -> FtlResult<()> {
        // data pages first, recording their (possibly new) locations in the
        // owning table pages
        for index in 0..self.cache.len() {
            let slot = self.cache.slot(index);
            if !slot.locked || slot.logical.as_u16() < self.geometry.table_page_count {
                continue;
            }
            self.program_slot(index)?;

            let logical = self.cache.slot(index).logical;
            let mut record = self.read_page_info(logical)?;
            record.physical = self.cache.slot(index).physical;
            self.update_page_info(logical, record)?;

            self.cache.slot_mut(index).settle();
        }

        // secondary tables next, recording their locations in the master
        let mtt_index = self
            .cache
            .load(&mut self.hal, LogicalPageNo::MASTER, self.mtt_physical)?;
        for index in 0..self.cache.len() {
            let slot = self.cache.slot(index);
            if !slot.locked {
                continue;
            }
            let logical = slot.logical.as_u16();
            if logical == 0 || logical >= self.geometry.table_page_count {
                continue;
            }
            self.program_slot(index)?;

            let mut record = table::read_record(&self.cache.slot(mtt_index).data, logical as usize);
            record.physical = self.cache.slot(index).physical;
            table::write_record(
                &mut self.cache.slot_mut(mtt_index).data,
                logical as usize,
                record,
            );

            self.cache.slot_mut(index).settle();
        }

        // master table last; this is the commit point
        if self.cache.slot(mtt_index).locked {
            self.program_slot(mtt_index)?;
            self.cache.slot_mut(mtt_index).settle();
            debug!(root = self.mtt_physical.as_u16(), "sync committed");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Write path
    // -------------------------------------------------------------------------

    fn write_one_sector(&mut self, sector: u32, payload: &[u8]) -> FtlResult<()> {
        // one sector write can dirty up to three pages: data + table + master
        if self.cache.free_slots() < 3 {
            self.sync()?;
        }

        let logical = self.geometry.logical_page_of_sector(sector);
        let sector_in_page = sector as usize % SECTORS_PER_PAGE;

        let mut info = self.read_page_info(logical)?;

        let data_index = if !info.physical.is_valid() {
            // first touch of this logical page
            info.physical = self.allocate_physical()?;
            let index = self.cache.init(logical, info.physical)?;
            info.sector_status = 0xFF;
            self.update_page_info(logical, info)?;
            index
        } else {
            self.cache.load(&mut self.hal, logical, info.physical)?
        };

        let start = sector_in_page * SECTOR_SIZE;
        if info.is_sector_blank(sector_in_page) {
            // appending into still-erased bytes; an in-place program suffices
            info.mark_sector_written(sector_in_page);
            self.update_page_info(logical, info)?;

            let slot = self.cache.slot_mut(data_index);
            slot.locked = true;
            slot.promote_mode(ProgramMode::Program);
            slot.data[start..start + SECTOR_SIZE].copy_from_slice(payload);
        } else {
            // rewriting programmed bytes; the page must relocate, and the
            // table pages that reference it move with it
            let slot = self.cache.slot_mut(data_index);
            slot.locked = true;
            slot.promote_mode(ProgramMode::RelocateEraseProgram);
            slot.data[start..start + SECTOR_SIZE].copy_from_slice(payload);

            let table_logical =
                LogicalPageNo::new(logical.as_u16() / TT_RECORDS_PER_PAGE as u16);
            let table_info = self.read_page_info(table_logical)?;
            let table_index =
                self.cache
                    .load(&mut self.hal, table_logical, table_info.physical)?;
            let table_slot = self.cache.slot_mut(table_index);
            table_slot.locked = true;
            table_slot.promote_mode(ProgramMode::RelocateEraseProgram);

            if table_logical.as_u16() > 0 {
                let mtt_index =
                    self.cache
                        .load(&mut self.hal, LogicalPageNo::MASTER, self.mtt_physical)?;
                let mtt_slot = self.cache.slot_mut(mtt_index);
                mtt_slot.locked = true;
                mtt_slot.promote_mode(ProgramMode::RelocateEraseProgram);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Translation table access
    // -------------------------------------------------------------------------

    /// Looks up the translation record for `logical`.
    ///
    /// Records for logical pages below the per-page record count live
    /// directly in the master table (record 0 is the master's
    /// self-reference); the rest resolve through their secondary table.
    fn read_page_info(&mut self, logical: LogicalPageNo) -> FtlResult<PageInfo> {
        let page_no = logical.as_u16() as usize;
        if page_no < TT_RECORDS_PER_PAGE {
            let index = self
                .cache
                .load(&mut self.hal, LogicalPageNo::MASTER, self.mtt_physical)?;
            Ok(table::read_record(&self.cache.slot(index).data, page_no))
        } else {
            let table_logical = LogicalPageNo::new((page_no / TT_RECORDS_PER_PAGE) as u16);
            let table_info = {
                let index = self
                    .cache
                    .load(&mut self.hal, LogicalPageNo::MASTER, self.mtt_physical)?;
                table::read_record(&self.cache.slot(index).data, table_logical.as_u16() as usize)
            };
            let index = self
                .cache
                .load(&mut self.hal, table_logical, table_info.physical)?;
            Ok(table::read_record(
                &self.cache.slot(index).data,
                page_no % TT_RECORDS_PER_PAGE,
            ))
        }
    }

    /// Rewrites the translation record for `logical` in its owning table
    /// page, locking that page for the next sync.
    fn update_page_info(&mut self, logical: LogicalPageNo, info: PageInfo) -> FtlResult<()> {
        let page_no = logical.as_u16() as usize;
        let (index, record) = if page_no < TT_RECORDS_PER_PAGE {
            let index = self
                .cache
                .load(&mut self.hal, LogicalPageNo::MASTER, self.mtt_physical)?;
            (index, page_no)
        } else {
            let table_logical = LogicalPageNo::new((page_no / TT_RECORDS_PER_PAGE) as u16);
            let table_info = {
                let index = self
                    .cache
                    .load(&mut self.hal, LogicalPageNo::MASTER, self.mtt_physical)?;
                table::read_record(&self.cache.slot(index).data, table_logical.as_u16() as usize)
            };
            let index = self
                .cache
                .load(&mut self.hal, table_logical, table_info.physical)?;
            (index, page_no % TT_RECORDS_PER_PAGE)
        };

        let slot = self.cache.slot_mut(index);
        slot.locked = true;
        slot.promote_mode(ProgramMode::Program);
        table::write_record(&mut slot.data, record, info);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Allocation and programming
    // -------------------------------------------------------------------------

    /// Claims the next non-referenced physical page at the write frontier.
    ///
    /// The returned page may still need an erase; the program path handles
    /// that. The circular scan is what spreads wear across the device.
    fn allocate_physical(&mut self) -> FtlResult<PhysicalPageNo> {
        let mut examined = 0u32;
        while self.state.get(self.write_frontier) == PageState::Used {
            self.write_frontier = self.write_frontier.wrapping_next(self.geometry.page_count);
            examined += 1;
            if examined > self.geometry.page_count as u32 {
                // statistically impossible given the reserved-page slack
                warn!(
                    frontier = self.write_frontier.as_u16(),
                    "no allocatable page after a full revolution"
                );
                return Err(FtlError::OutOfPages {
                    frontier: self.write_frontier.as_u16(),
                });
            }
        }

        let page = self.write_frontier;
        self.write_frontier = self.write_frontier.wrapping_next(self.geometry.page_count);
        Ok(page)
    }

    /// Executes the pending program action of cache slot `index`.
    fn program_slot(&mut self, index: usize) -> FtlResult<()> {
        match self.cache.slot(index).mode {
            ProgramMode::None => Ok(()),
            ProgramMode::Program => {
                let physical = self.cache.slot(index).physical;
                self.hal
                    .program(physical.byte_offset(), &self.cache.slot(index).data)?;
                self.state.set(physical, PageState::Used);
                Ok(())
            }
            ProgramMode::EraseProgram => {
                let physical = self.cache.slot(index).physical;
                let addr = physical.byte_offset();
                if self.state.get(physical) != PageState::Erased {
                    self.hal.erase(addr)?;
                }
                self.hal.program(addr, &self.cache.slot(index).data)?;
                self.state.set(physical, PageState::Used);
                Ok(())
            }
            ProgramMode::RelocateEraseProgram => {
                let target = self.allocate_physical()?;
                let old = self.cache.slot(index).physical;
                let logical = self.cache.slot(index).logical;

                if logical.as_u16() < self.geometry.table_page_count {
                    if logical == LogicalPageNo::MASTER {
                        // the master's record 0 tracks its own location
                        let mut self_record = table::read_record(&self.cache.slot(index).data, 0);
                        self_record.physical = target;
                        table::write_record(&mut self.cache.slot_mut(index).data, 0, self_record);
                    }
                    // a moved table page is a new generation
                    table::advance_serial(&mut self.cache.slot_mut(index).data);
                }

                let addr = target.byte_offset();
                if self.state.get(target) != PageState::Erased {
                    self.hal.erase(addr)?;
                }
                self.hal.program(addr, &self.cache.slot(index).data)?;

                self.state.set(old, PageState::EraseRequired);
                self.cache.slot_mut(index).physical = target;
                self.state.set(target, PageState::Used);

                if logical == LogicalPageNo::MASTER {
                    self.mtt_physical = target;
                }
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // State resolution
    // -------------------------------------------------------------------------

    /// Resolves up to `budget` pages of unknown erase state, walking from
    /// the write frontier and wrapping. Once a full pass finds nothing left
    /// to resolve, the map latches and later calls are no-ops.
    fn resolve_states(&mut self, budget: usize) {
        if self.state.is_resolved() {
            return;
        }

        let mut budget = budget;
        let mut page = self.write_frontier;
        for _ in 0..self.geometry.page_count {
            if self.state.get(page) == PageState::Unknown {
                let resolved = if self.hal.is_erased(page.byte_offset()) {
                    PageState::Erased
                } else {
                    PageState::EraseRequired
                };
                self.state.set(page, resolved);
                budget -= 1;
                if budget == 0 {
                    return;
                }
            }
            page = page.wrapping_next(self.geometry.page_count);
        }
        self.state.mark_resolved();
    }

    // -------------------------------------------------------------------------
    // Mount and format
    // -------------------------------------------------------------------------

    /// Scans the device for the authoritative master table and rebuilds the
    /// in-RAM view from it. Returns false when no valid candidate exists.
    fn load_volume(&mut self) -> FtlResult<bool> {
        let mut best_serial = 0u32;
        let mut best_page = PhysicalPageNo::INVALID;
        let mut header_bytes = [0u8; TT_HEADER_SIZE];

        for page in 0..self.geometry.page_count {
            let candidate = PhysicalPageNo::new(page);
            self.hal.read(candidate.byte_offset(), &mut header_bytes)?;
            let header = TableHeader::decode(&header_bytes);
            if header.logical_page_no == 0 && header.is_valid() && header.serial > best_serial {
                best_serial = header.serial;
                best_page = candidate;
            }
        }

        if !best_page.is_valid() {
            return Ok(false);
        }
        info!(
            root = best_page.as_u16(),
            serial = best_serial,
            "mounted existing volume"
        );

        self.mtt_physical = best_page;
        self.state.set(best_page, PageState::Used);
        self.write_frontier = best_page.wrapping_next(self.geometry.page_count);

        let mtt_index = self
            .cache
            .load(&mut self.hal, LogicalPageNo::MASTER, best_page)?;
        let mtt_records: Vec<PageInfo> = {
            let data = &self.cache.slot(mtt_index).data;
            (0..TT_RECORDS_PER_PAGE)
                .map(|record| table::read_record(data, record))
                .collect()
        };

        for (record, info) in mtt_records.iter().enumerate().skip(1) {
            if info.physical.is_valid() {
                self.state.set(info.physical, PageState::Used);
            }
            if record < self.geometry.table_page_count as usize && info.physical.is_valid() {
                let stt_index = self.cache.load(
                    &mut self.hal,
                    LogicalPageNo::new(record as u16),
                    info.physical,
                )?;
                for r in 0..TT_RECORDS_PER_PAGE {
                    let data_info = table::read_record(&self.cache.slot(stt_index).data, r);
                    if data_info.physical.is_valid() {
                        self.state.set(data_info.physical, PageState::Used);
                    }
                }
            }
        }

        // settle the erase state of the pages the frontier will meet first
        self.resolve_states(self.cache.len());
        Ok(true)
    }

    /// Lays down a fresh volume: secondary tables on pages 1..T, the master
    /// on page 0, frontier parked behind them.
    fn format_volume(&mut self) -> FtlResult<()> {
        info!("no valid master table found, formatting volume");

        self.write_frontier = PhysicalPageNo::new(0);
        self.resolve_states(self.cache.len());

        let mut master = vec![0xFF; PAGE_SIZE];
        table::init_table_page(&mut master, 0);
        table::write_record(
            &mut master,
            0,
            PageInfo {
                physical: PhysicalPageNo::new(0),
                sector_status: 0,
            },
        );

        let mut secondary = vec![0xFF; PAGE_SIZE];
        for table_page in 1..self.geometry.table_page_count {
            table::init_table_page(&mut secondary, table_page as u32);
            let target = PhysicalPageNo::new(table_page);
            self.program_fresh(target, &secondary)?;
            self.state.set(target, PageState::Used);
            table::write_record(
                &mut master,
                table_page as usize,
                PageInfo {
                    physical: target,
                    sector_status: 0,
                },
            );
        }

        let root = PhysicalPageNo::new(0);
        self.program_fresh(root, &master)?;
        self.state.set(root, PageState::Used);
        self.mtt_physical = root;
        self.write_frontier = PhysicalPageNo::new(self.geometry.table_page_count);
        Ok(())
    }

    /// Erases `page` unless already erased, then programs `data` there.
    fn program_fresh(&mut self, page: PhysicalPageNo, data: &[u8]) -> FtlResult<()> {
        let addr = page.byte_offset();
        if self.state.get(page) != PageState::Erased {
            self.hal.erase(addr)?;
        }
        self.hal.program(addr, data)?;
        Ok(())
    }
}

impl<F: NorFlash> std::fmt::Debug for Ftl<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ftl")
            .field("geometry", &self.geometry)
            .field("mtt_physical", &self.mtt_physical)
            .field("write_frontier", &self.write_frontier)
            .field("state_resolved", &self.state.is_resolved())
            .field(
                "locked_slots",
                &(self.cache.len() - self.cache.free_slots()),
            )
            .finish()
    }
}
