use std::backtrace::Backtrace;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::gc::sweep::{EagerSweep, FullSweep};
use crate::gc::{formatted_size, Address};

pub type Site = &'static Location<'static>;

struct Birth {
    site: Site,
    completed: u64,
}

/// Allocations of one site and the number of GC cycles they survived.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LifetimeProfile {
    pub objects: usize,
    pub bytes: usize,
    /// Cycles survived -> objects that died after surviving that many.
    pub deaths: BTreeMap<u64, usize>,
}

/// Traces kept per fade site.
pub const FADE_SITE_TRACES: usize = 8;

#[derive(Clone, Debug)]
pub struct FadeSite {
    pub events: usize,
    pub objects: usize,
    /// Stack traces of the first `FADE_SITE_TRACES` fade events at this site.
    pub backtraces: Vec<String>,
}

#[derive(Default)]
struct Profiles {
    births: HashMap<Address, Birth>,
    lifetimes: HashMap<Site, LifetimeProfile>,
    fade_sites: HashMap<Site, FadeSite>,
    skip_sites: HashMap<Site, usize>,
    region_lifetimes: BTreeMap<u64, usize>,
}

#[derive(Default)]
struct SweepTotals {
    eager_sweeps: usize,
    eager_lines: usize,
    eager_blocks_freed: usize,
    eager_deferred: usize,
    full_sweeps: usize,
    full_lines: usize,
    full_blocks_freed: usize,
    general_freed: usize,
}

/// Counters and profiles of the region allocator. Counting is always on,
/// per-site profiles only with the `profile` option.
pub struct Diagnostics {
    profile: bool,
    region_objects: AtomicUsize,
    region_bytes: AtomicUsize,
    general_objects: AtomicUsize,
    faded_objects: AtomicUsize,
    region_skips: AtomicUsize,
    regions: AtomicUsize,
    sweeps: Mutex<SweepTotals>,
    pauses: Mutex<Vec<f32>>,
    profiles: Mutex<Profiles>,
}

impl Diagnostics {
    pub fn new(profile: bool) -> Diagnostics {
        Diagnostics {
            profile,
            region_objects: AtomicUsize::new(0),
            region_bytes: AtomicUsize::new(0),
            general_objects: AtomicUsize::new(0),
            faded_objects: AtomicUsize::new(0),
            region_skips: AtomicUsize::new(0),
            regions: AtomicUsize::new(0),
            sweeps: Mutex::new(SweepTotals::default()),
            pauses: Mutex::new(Vec::new()),
            profiles: Mutex::new(Profiles::default()),
        }
    }

    pub fn is_profiling(&self) -> bool {
        self.profile
    }

    pub fn region_objects(&self) -> usize {
        self.region_objects.load(Ordering::Relaxed)
    }

    pub fn faded_objects(&self) -> usize {
        self.faded_objects.load(Ordering::Relaxed)
    }

    pub fn region_skips(&self) -> usize {
        self.region_skips.load(Ordering::Relaxed)
    }

    /// Faded objects per region-allocated object.
    pub fn fade_ratio(&self) -> f64 {
        ratio(self.faded_objects(), self.region_objects())
    }

    pub(crate) fn record_region_object(
        &self,
        addr: Address,
        size: usize,
        site: Site,
        completed: u64,
    ) {
        self.region_objects.fetch_add(1, Ordering::Relaxed);
        self.region_bytes.fetch_add(size, Ordering::Relaxed);
        self.record_birth(addr, size, site, completed);
    }

    pub(crate) fn record_general_object(
        &self,
        addr: Address,
        size: usize,
        site: Site,
        completed: u64,
    ) {
        self.general_objects.fetch_add(1, Ordering::Relaxed);
        self.record_birth(addr, size, site, completed);
    }

    fn record_birth(&self, addr: Address, size: usize, site: Site, completed: u64) {
        if !self.profile {
            return;
        }

        let mut profiles = self.profiles.lock();
        profiles.births.insert(addr, Birth { site, completed });

        let lifetime = profiles.lifetimes.entry(site).or_default();
        lifetime.objects += 1;
        lifetime.bytes += size;
    }

    /// Called for every object whose memory is reclaimed by either sweep.
    pub(crate) fn record_death(&self, addr: Address, completed: u64) {
        if !self.profile {
            return;
        }

        let mut profiles = self.profiles.lock();

        if let Some(birth) = profiles.births.remove(&addr) {
            let survived = completed.saturating_sub(birth.completed);
            let lifetime = profiles.lifetimes.entry(birth.site).or_default();
            *lifetime.deaths.entry(survived).or_insert(0) += 1;
        }
    }

    pub(crate) fn record_deaths(&self, objects: &[Address], completed: u64) {
        if !self.profile || objects.is_empty() {
            return;
        }

        for &addr in objects {
            self.record_death(addr, completed);
        }
    }

    pub(crate) fn record_fade(&self, site: Site, objects: usize) {
        self.faded_objects.fetch_add(objects, Ordering::Relaxed);

        if !self.profile {
            return;
        }

        let mut profiles = self.profiles.lock();
        let entry = profiles.fade_sites.entry(site).or_insert_with(|| FadeSite {
            events: 0,
            objects: 0,
            backtraces: Vec::new(),
        });

        entry.events += 1;
        entry.objects += objects;

        if entry.backtraces.len() < FADE_SITE_TRACES {
            entry
                .backtraces
                .push(Backtrace::force_capture().to_string());
        }
    }

    pub(crate) fn record_skip(&self, site: Site) {
        self.region_skips.fetch_add(1, Ordering::Relaxed);

        if self.profile {
            *self.profiles.lock().skip_sites.entry(site).or_insert(0) += 1;
        }
    }

    /// `cycles` is the number of completed GC cycles between entering and
    /// sweeping the region.
    pub(crate) fn record_region_exit(&self, cycles: u64) {
        self.regions.fetch_add(1, Ordering::Relaxed);

        if self.profile {
            *self.profiles.lock().region_lifetimes.entry(cycles).or_insert(0) += 1;
        }
    }

    pub(crate) fn record_eager_sweep(&self, sweep: &EagerSweep) {
        let mut totals = self.sweeps.lock();
        totals.eager_sweeps += 1;
        totals.eager_lines += sweep.lines_released;
        totals.eager_blocks_freed += sweep.blocks_freed;
        totals.eager_deferred += sweep.blocks_deferred;
    }

    pub(crate) fn record_deferred_release(&self, sweep: &EagerSweep) {
        let mut totals = self.sweeps.lock();
        totals.eager_lines += sweep.lines_released;
        totals.eager_blocks_freed += sweep.blocks_freed;
    }

    pub(crate) fn record_full_sweep(&self, sweep: &FullSweep) {
        let mut totals = self.sweeps.lock();
        totals.full_sweeps += 1;
        totals.full_lines += sweep.lines_released;
        totals.full_blocks_freed += sweep.blocks_freed;
        totals.general_freed += sweep.general.freed_objects;
    }

    pub(crate) fn record_pause(&self, ms: f32) {
        self.pauses.lock().push(ms);
    }

    pub fn report(&self) -> DiagnosticsReport {
        let sweeps = self.sweeps.lock();
        let profiles = self.profiles.lock();

        let mut lifetimes: Vec<(String, LifetimeProfile)> = profiles
            .lifetimes
            .iter()
            .map(|(site, profile)| (site.to_string(), profile.clone()))
            .collect();
        lifetimes.sort_by(|a, b| a.0.cmp(&b.0));

        let mut fade_sites: Vec<(String, FadeSite)> = profiles
            .fade_sites
            .iter()
            .map(|(site, fade)| (site.to_string(), fade.clone()))
            .collect();
        fade_sites.sort_by(|a, b| a.0.cmp(&b.0));

        let mut skip_sites: Vec<(String, usize)> = profiles
            .skip_sites
            .iter()
            .map(|(site, &count)| (site.to_string(), count))
            .collect();
        skip_sites.sort();

        DiagnosticsReport {
            region_objects: self.region_objects(),
            region_bytes: self.region_bytes.load(Ordering::Relaxed),
            general_objects: self.general_objects.load(Ordering::Relaxed),
            faded_objects: self.faded_objects(),
            region_skips: self.region_skips(),
            regions: self.regions.load(Ordering::Relaxed),
            eager_sweeps: sweeps.eager_sweeps,
            eager_lines: sweeps.eager_lines,
            eager_blocks_freed: sweeps.eager_blocks_freed,
            eager_deferred: sweeps.eager_deferred,
            full_sweeps: sweeps.full_sweeps,
            full_lines: sweeps.full_lines,
            full_blocks_freed: sweeps.full_blocks_freed,
            general_freed: sweeps.general_freed,
            pauses: Numbers::of(&self.pauses.lock()),
            lifetimes,
            fade_sites,
            skip_sites,
            region_lifetimes: profiles.region_lifetimes.clone(),
        }
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Numbers {
    pub count: usize,
    pub avg: f32,
    pub sum: f32,
    pub min: f32,
    pub max: f32,
}

impl Numbers {
    fn of(data: &[f32]) -> Numbers {
        if data.is_empty() {
            return Numbers::default();
        }

        let mut sum = 0f32;
        let mut min = data[0];
        let mut max = data[0];

        for &el in data {
            sum += el;
            min = f32::min(min, el);
            max = f32::max(max, el);
        }

        Numbers {
            count: data.len(),
            avg: sum / (data.len() as f32),
            sum,
            min,
            max,
        }
    }
}

impl fmt::Display for Numbers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "count={} avg={:.1} sum={:.1} min={:.1} max={:.1}",
            self.count, self.avg, self.sum, self.min, self.max
        )
    }
}

/// Snapshot of all counters and profiles.
#[derive(Clone, Debug)]
pub struct DiagnosticsReport {
    pub region_objects: usize,
    pub region_bytes: usize,
    pub general_objects: usize,
    pub faded_objects: usize,
    pub region_skips: usize,
    pub regions: usize,
    pub eager_sweeps: usize,
    pub eager_lines: usize,
    pub eager_blocks_freed: usize,
    pub eager_deferred: usize,
    pub full_sweeps: usize,
    pub full_lines: usize,
    pub full_blocks_freed: usize,
    pub general_freed: usize,
    pub pauses: Numbers,
    pub lifetimes: Vec<(String, LifetimeProfile)>,
    pub fade_sites: Vec<(String, FadeSite)>,
    pub skip_sites: Vec<(String, usize)>,
    pub region_lifetimes: BTreeMap<u64, usize>,
}

impl DiagnosticsReport {
    pub fn fade_ratio(&self) -> f64 {
        ratio(self.faded_objects, self.region_objects)
    }
}

impl fmt::Display for DiagnosticsReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "GC stats: regions={}", self.regions)?;
        writeln!(
            f,
            "GC stats: region-objects={} ({})",
            self.region_objects,
            formatted_size(self.region_bytes)
        )?;
        writeln!(f, "GC stats: general-objects={}", self.general_objects)?;
        writeln!(
            f,
            "GC stats: faded-objects={} ratio={:.3}",
            self.faded_objects,
            self.fade_ratio()
        )?;
        writeln!(f, "GC stats: region-skips={}", self.region_skips)?;
        writeln!(
            f,
            "GC stats: eager-sweeps={} lines={} blocks-freed={} deferred={}",
            self.eager_sweeps, self.eager_lines, self.eager_blocks_freed, self.eager_deferred
        )?;
        writeln!(
            f,
            "GC stats: full-sweeps={} lines={} blocks-freed={} general-freed={}",
            self.full_sweeps, self.full_lines, self.full_blocks_freed, self.general_freed
        )?;
        write!(f, "GC stats: pauses {}", self.pauses)?;

        for (site, profile) in &self.lifetimes {
            write!(
                f,
                "\nGC stats: lifetime {} objects={} bytes={} deaths={:?}",
                site, profile.objects, profile.bytes, profile.deaths
            )?;
        }

        for (site, fade) in &self.fade_sites {
            write!(
                f,
                "\nGC stats: fade-site {} events={} objects={} traces={}",
                site,
                fade.events,
                fade.objects,
                fade.backtraces.len()
            )?;
        }

        for (site, count) in &self.skip_sites {
            write!(f, "\nGC stats: skip-site {} count={}", site, count)?;
        }

        if !self.region_lifetimes.is_empty() {
            write!(f, "\nGC stats: region-lifetimes={:?}", self.region_lifetimes)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_without_profiling() {
        let diagnostics = Diagnostics::new(false);
        let site = Location::caller();

        diagnostics.record_region_object(Address::from(0x1000), 16, site, 0);
        diagnostics.record_region_object(Address::from(0x1010), 16, site, 0);
        diagnostics.record_fade(site, 1);
        diagnostics.record_skip(site);

        assert_eq!(diagnostics.region_objects(), 2);
        assert_eq!(diagnostics.faded_objects(), 1);
        assert_eq!(diagnostics.region_skips(), 1);
        assert_eq!(diagnostics.fade_ratio(), 0.5);

        let report = diagnostics.report();
        assert!(report.lifetimes.is_empty());
        assert!(report.fade_sites.is_empty());
    }

    #[test]
    fn lifetime_histogram_counts_survived_cycles() {
        let diagnostics = Diagnostics::new(true);
        let site = Location::caller();

        diagnostics.record_region_object(Address::from(0x1000), 16, site, 1);
        diagnostics.record_region_object(Address::from(0x2000), 32, site, 1);
        diagnostics.record_death(Address::from(0x1000), 1);
        diagnostics.record_death(Address::from(0x2000), 3);
        diagnostics.record_death(Address::from(0x3000), 3);

        let report = diagnostics.report();
        assert_eq!(report.lifetimes.len(), 1);

        let (_, profile) = &report.lifetimes[0];
        assert_eq!(profile.objects, 2);
        assert_eq!(profile.bytes, 48);
        assert_eq!(profile.deaths.get(&0), Some(&1));
        assert_eq!(profile.deaths.get(&2), Some(&1));
    }

    #[test]
    fn fade_sites_capture_backtraces() {
        let diagnostics = Diagnostics::new(true);
        let site = Location::caller();

        diagnostics.record_fade(site, 3);
        diagnostics.record_fade(site, 2);
        diagnostics.record_region_exit(0);
        diagnostics.record_region_exit(2);
        diagnostics.record_region_exit(2);

        let report = diagnostics.report();
        let (_, fade) = &report.fade_sites[0];
        assert_eq!(fade.events, 2);
        assert_eq!(fade.objects, 5);
        assert_eq!(fade.backtraces.len(), 2);
        assert!(fade.backtraces.iter().all(|trace| !trace.is_empty()));
        assert_eq!(report.region_lifetimes.get(&2), Some(&2));

        let text = report.to_string();
        assert!(text.starts_with("GC stats: regions=3"));
        assert!(text.contains("fade-site"));
    }

    #[test]
    fn fade_site_traces_are_bounded() {
        let diagnostics = Diagnostics::new(true);
        let site = Location::caller();

        for _ in 0..FADE_SITE_TRACES + 4 {
            diagnostics.record_fade(site, 1);
        }

        let report = diagnostics.report();
        let (_, fade) = &report.fade_sites[0];
        assert_eq!(fade.events, FADE_SITE_TRACES + 4);
        assert_eq!(fade.backtraces.len(), FADE_SITE_TRACES);
    }
}
