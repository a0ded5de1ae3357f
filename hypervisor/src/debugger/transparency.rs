//! Concealing the hypervisor from the guest.
//!
//! While hidden, CPUID no longer advertises a hypervisor, the synthetic hypervisor MSR range can
//! raise #GP, and back-to-back timestamp reads advance by samples of the bare-metal timing
//! profile instead of by the cost of a VM exit.

use {
    crate::{
        debugger::events::resources::ResourceController,
        error::HypervisorError,
        intel::vcpu::Interception,
        platform::{CpuidResult, Platform},
    },
    alloc::vec::Vec,
    core::sync::atomic::{AtomicBool, AtomicU64, Ordering},
    rand::{rngs::SmallRng, Rng, SeedableRng},
    spin::Mutex,
};

/// CPUID.1:ECX bit reporting a hypervisor.
const HYPERVISOR_PRESENT_BIT: u32 = 1 << 31;

const HYPERVISOR_VENDOR_LEAF: u32 = 0x4000_0000;
const HYPERVISOR_INTERFACE_LEAF: u32 = 0x4000_0001;
const HYPERVISOR_LEAF_LAST: u32 = 0x4000_00FF;

/// "HyperDbg" split over EBX and ECX, and the "Hv#0" interface signature.
const VENDOR_EBX: u32 = 0x6570_7948;
const VENDOR_ECX: u32 = 0x6762_4472;
const INTERFACE_EAX: u32 = 0x3023_7648;

/// Synthetic MSRs hypervisors expose, which a bare processor rejects.
const SYNTHETIC_MSR_FIRST: u32 = 0x4000_0000;
const SYNTHETIC_MSR_LAST: u32 = 0x4000_00F0;

/// Reads further apart than this many average deltas are not considered back-to-back.
const BACK_TO_BACK_FACTOR: u64 = 64;

/// Samples the profile is measured from when none is supplied.
const PROFILE_SAMPLES: u64 = 64;

/// ln(2) in Q16.
const LN2_Q16: i128 = 45_426;

/// Timestamp delta a guest sees between two consecutive reads on bare metal.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TimingProfile {
    pub average: u64,
    pub deviation: u64,
}

#[derive(Debug, Default, Copy, Clone)]
struct TscTrack {
    /// Last value returned to the guest.
    reported: u64,
    /// Real counter at that moment.
    real: u64,
}

pub struct Transparency {
    hidden: AtomicBool,
    profile: Mutex<TimingProfile>,
    rng: Mutex<Option<SmallRng>>,
    tracks: Vec<Mutex<TscTrack>>,
    adjusted_reads: AtomicU64,
}

impl Transparency {
    pub fn new(processor_count: u32) -> Self {
        Self {
            hidden: AtomicBool::new(false),
            profile: Mutex::new(TimingProfile::default()),
            rng: Mutex::new(None),
            tracks: (0..processor_count).map(|_| Mutex::new(TscTrack::default())).collect(),
            adjusted_reads: AtomicU64::new(0),
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::Acquire)
    }

    pub fn profile(&self) -> TimingProfile {
        *self.profile.lock()
    }

    /// Number of timestamp reads that were reshaped since the last hide.
    pub fn adjusted_reads(&self) -> u64 {
        self.adjusted_reads.load(Ordering::Relaxed)
    }

    /// Starts concealing the hypervisor.
    ///
    /// # Arguments
    ///
    /// * `platform` - Used to seed the generator and, for an empty profile, to measure one.
    /// * `resources` - RDTSC exiting is acquired on every processor.
    /// * `profile` - Bare-metal timing measured by the requester, or zero to measure it here.
    pub fn hide(&self, platform: &dyn Platform, resources: &ResourceController, profile: TimingProfile) -> Result<(), HypervisorError> {
        if self.hidden.swap(true, Ordering::AcqRel) {
            return Err(HypervisorError::AlreadyHidden);
        }

        let profile = match profile.average {
            0 => measure_profile(platform),
            _ => profile,
        };
        *self.profile.lock() = profile;
        *self.rng.lock() = Some(SmallRng::seed_from_u64(platform.rdtsc()));
        self.tracks.iter().for_each(|track| *track.lock() = TscTrack::default());
        self.adjusted_reads.store(0, Ordering::Relaxed);

        if let Err(error) = resources.acquire_on(platform, None, Interception::RdtscExiting) {
            self.hidden.store(false, Ordering::Release);
            return Err(error);
        }

        log::info!("Hypervisor hidden, timing profile {} +/- {}", profile.average, profile.deviation);
        Ok(())
    }

    /// Stops concealing the hypervisor.
    pub fn unhide(&self, platform: &dyn Platform, resources: &ResourceController) -> Result<(), HypervisorError> {
        if !self.hidden.swap(false, Ordering::AcqRel) {
            return Err(HypervisorError::AlreadyVisible);
        }

        resources.release_on(platform, None, Interception::RdtscExiting);
        *self.rng.lock() = None;
        log::info!("Hypervisor visible");
        Ok(())
    }

    /// Rewrites a CPUID result the way the current mode presents it.
    ///
    /// Visible, the hypervisor announces itself. Hidden, leaf 1 drops the hypervisor bit and the
    /// hypervisor range echoes the leaf like a processor without one.
    pub fn adjust_cpuid(&self, leaf: u32, result: &mut CpuidResult) {
        if self.is_hidden() {
            match leaf {
                1 => result.ecx &= !HYPERVISOR_PRESENT_BIT,
                HYPERVISOR_VENDOR_LEAF..=HYPERVISOR_LEAF_LAST => {
                    *result = CpuidResult { eax: leaf, ebx: leaf, ecx: leaf, edx: leaf };
                }
                _ => {}
            }
            return;
        }

        match leaf {
            1 => result.ecx |= HYPERVISOR_PRESENT_BIT,
            HYPERVISOR_VENDOR_LEAF => {
                *result = CpuidResult { eax: HYPERVISOR_INTERFACE_LEAF, ebx: VENDOR_EBX, ecx: VENDOR_ECX, edx: 0 };
            }
            HYPERVISOR_INTERFACE_LEAF => *result = CpuidResult { eax: INTERFACE_EAX, ebx: 0, ecx: 0, edx: 0 },
            _ => {}
        }
    }

    /// Whether an access to `msr` must raise #GP.
    pub fn rejects_msr(&self, inject_gp: bool, msr: u32) -> bool {
        inject_gp && self.is_hidden() && (SYNTHETIC_MSR_FIRST..=SYNTHETIC_MSR_LAST).contains(&msr)
    }

    /// The timestamp reported for a guest read of `real` on `core`.
    ///
    /// Back-to-back reads advance by a sample of the timing profile so that the cost of the exit
    /// is invisible. Reads further apart return the real counter. Reported values never go back.
    pub fn tsc(&self, core: u32, real: u64) -> u64 {
        if !self.is_hidden() {
            return real;
        }
        let Some(track) = self.tracks.get(core as usize) else {
            return real;
        };

        let profile = self.profile();
        let mut track = track.lock();
        let elapsed = real.wrapping_sub(track.real);
        let back_to_back = track.real != 0 && elapsed <= profile.average.max(1).saturating_mul(BACK_TO_BACK_FACTOR);

        let reported = if back_to_back {
            self.adjusted_reads.fetch_add(1, Ordering::Relaxed);
            track.reported.saturating_add(self.sample(profile))
        } else {
            real.max(track.reported.saturating_add(1))
        };

        *track = TscTrack { reported, real };
        reported
    }

    /// A delta drawn from the profile, clamped to three deviations and at least one.
    fn sample(&self, profile: TimingProfile) -> u64 {
        let mut rng = self.rng.lock();
        let Some(rng) = rng.as_mut() else {
            return profile.average.max(1);
        };

        let deviation = profile.deviation as i128;
        let offset = (deviation * i128::from(standard_normal_q16(rng))) >> 16;
        let offset = offset.clamp(-3 * deviation, 3 * deviation);
        (profile.average as i128 + offset).max(1) as u64
    }
}

/// Measures the delta of consecutive timestamp reads on the calling processor.
pub fn measure_profile(platform: &dyn Platform) -> TimingProfile {
    let mut previous = platform.rdtsc();
    let mut deltas = Vec::with_capacity(PROFILE_SAMPLES as usize);
    for _ in 0..PROFILE_SAMPLES {
        let now = platform.rdtsc();
        deltas.push(now.wrapping_sub(previous));
        previous = now;
    }

    let average = deltas.iter().sum::<u64>() / PROFILE_SAMPLES;
    let variance = deltas.iter().map(|delta| delta.abs_diff(average).pow(2)).sum::<u64>() / PROFILE_SAMPLES;
    TimingProfile { average: average.max(1), deviation: isqrt(u128::from(variance)) as u64 }
}

/// A standard normal sample in Q16, from the polar Box-Muller transform in integer arithmetic.
fn standard_normal_q16(rng: &mut SmallRng) -> i64 {
    const RANGE: i64 = 1 << 15;
    const RANGE_SQUARED: u64 = (RANGE * RANGE) as u64;

    loop {
        let u1 = rng.gen_range(-RANGE..RANGE);
        let u2 = rng.gen_range(-RANGE..RANGE);
        let w = (u1 * u1 + u2 * u2) as u64;
        if w == 0 || w >= RANGE_SQUARED {
            continue;
        }

        // s = w / RANGE^2 lies in (0, 1); the multiplier is sqrt(-2 ln(s) / s).
        let ln_s_q16 = (i128::from(log2_q16(w)) - i128::from(log2_q16(RANGE_SQUARED))) * LN2_Q16 >> 16;
        let t_q16 = (-2 * ln_s_q16) as u128 * u128::from(RANGE_SQUARED) / u128::from(w);
        let multiplier_q16 = isqrt(t_q16 << 16) as i64;
        return u1 * multiplier_q16 / RANGE;
    }
}

/// log2 of a non-zero `x` in Q16.
fn log2_q16(x: u64) -> i64 {
    let integer = 63 - i64::from(x.leading_zeros());
    // Mantissa in [1, 2) as Q32.
    let mut y = (u128::from(x) << 32) >> integer;
    let mut fraction = 0i64;
    for bit in (0..16).rev() {
        y = (y * y) >> 32;
        if y >= 2 << 32 {
            y >>= 1;
            fraction |= 1 << bit;
        }
    }
    (integer << 16) | fraction
}

/// Integer square root by Newton iteration.
fn isqrt(value: u128) -> u128 {
    if value < 2 {
        return value;
    }

    let mut x = value;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + value / x) / 2;
    }
    x
}

#[cfg(test)]
mod tests {
    use {super::*, crate::platform::mock::MockPlatform, proptest::prelude::*};

    #[test]
    fn test_hide_twice_and_unhide_twice() {
        let platform = MockPlatform::new(2);
        let resources = ResourceController::new(2);
        let transparency = Transparency::new(2);
        let profile = TimingProfile { average: 100, deviation: 10 };

        transparency.hide(&platform, &resources, profile).unwrap();
        assert_eq!(transparency.hide(&platform, &resources, profile), Err(HypervisorError::AlreadyHidden));
        assert_eq!(resources.count(1, Interception::RdtscExiting), 1);

        transparency.unhide(&platform, &resources).unwrap();
        assert_eq!(transparency.unhide(&platform, &resources), Err(HypervisorError::AlreadyVisible));
        assert_eq!(resources.count(1, Interception::RdtscExiting), 0);
    }

    #[test]
    fn test_cpuid_views() {
        let platform = MockPlatform::new(1);
        let resources = ResourceController::new(1);
        let transparency = Transparency::new(1);

        let mut leaf1 = CpuidResult { eax: 0, ebx: 0, ecx: 0x0000_0201, edx: 0 };
        transparency.adjust_cpuid(1, &mut leaf1);
        assert_ne!(leaf1.ecx & HYPERVISOR_PRESENT_BIT, 0);

        let mut vendor = CpuidResult::default();
        transparency.adjust_cpuid(HYPERVISOR_VENDOR_LEAF, &mut vendor);
        assert_eq!(vendor.ebx.to_le_bytes(), *b"Hype");
        assert_eq!(vendor.ecx.to_le_bytes(), *b"rDbg");

        transparency.hide(&platform, &resources, TimingProfile { average: 100, deviation: 10 }).unwrap();

        transparency.adjust_cpuid(1, &mut leaf1);
        assert_eq!(leaf1.ecx & HYPERVISOR_PRESENT_BIT, 0);
        assert_eq!(leaf1.ecx, 0x0000_0201);

        let mut vendor = CpuidResult::default();
        transparency.adjust_cpuid(HYPERVISOR_VENDOR_LEAF, &mut vendor);
        assert_eq!(vendor, CpuidResult { eax: 0x4000_0000, ebx: 0x4000_0000, ecx: 0x4000_0000, edx: 0x4000_0000 });
    }

    #[test]
    fn test_synthetic_msr_rejection_is_opt_in() {
        let platform = MockPlatform::new(1);
        let resources = ResourceController::new(1);
        let transparency = Transparency::new(1);
        transparency.hide(&platform, &resources, TimingProfile { average: 100, deviation: 10 }).unwrap();

        assert!(!transparency.rejects_msr(false, 0x4000_0000));
        assert!(transparency.rejects_msr(true, 0x4000_0000));
        assert!(!transparency.rejects_msr(true, 0x4000_00F1));
    }

    #[test]
    fn test_fixed_point_helpers() {
        assert_eq!(log2_q16(1), 0);
        assert_eq!(log2_q16(1024), 10 << 16);
        // log2(3) = 1.58496...
        assert!((log2_q16(3) - 103_872).abs() < 4);
        assert_eq!(isqrt(1 << 40), 1 << 20);
        assert_eq!(isqrt(99), 9);
    }

    #[test]
    fn test_measured_profile_matches_counter_step() {
        let platform = MockPlatform::new(1);
        platform.set_tsc_step(250);
        assert_eq!(measure_profile(&platform), TimingProfile { average: 250, deviation: 0 });
    }

    proptest! {
        #[test]
        fn prop_back_to_back_reads_follow_profile(seed in any::<u64>(), average in 50u64..5_000, deviation_percent in 1u64..30) {
            let deviation = average * deviation_percent / 100;
            let platform = MockPlatform::new(1);
            platform.set_tsc(seed >> 8);
            platform.set_tsc_step(average / 2 + 1);
            let resources = ResourceController::new(1);
            let transparency = Transparency::new(1);
            transparency.hide(&platform, &resources, TimingProfile { average, deviation }).unwrap();

            let mut previous = transparency.tsc(0, platform.rdtsc());
            let mut total = 0u64;
            const READS: u64 = 512;
            for _ in 0..READS {
                let value = transparency.tsc(0, platform.rdtsc());
                prop_assert!(value > previous);
                let delta = value - previous;
                prop_assert!(delta + 3 * deviation >= average && delta <= average + 3 * deviation);
                total += delta;
                previous = value;
            }

            let mean = total / READS;
            prop_assert!(mean.abs_diff(average) <= deviation.max(1));
        }
    }
}
