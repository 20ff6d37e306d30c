//! Device slot naming and allocation.
//!
//! A slot pairs the name the control plane uses for an attachment point with
//! the path the guest kernel exposes for it. Allocation only reads the local
//! device namespace; no remote state is touched here.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Number of single-letter suffixes (`a` to `z`).
const ALPHABET_LEN: usize = 26;

/// Default prefix for the platform-facing device name.
pub const DEFAULT_PLATFORM_DEVICE_PREFIX: &str = "/dev/sd";

/// Default prefix for the OS-visible device path.
pub const DEFAULT_OS_DEVICE_PREFIX: &str = "/dev/vd";

/// Default size of the slot space.
pub const DEFAULT_MAX_DEVICE_SLOTS: usize = ALPHABET_LEN;

/// One attachment point, named both ways.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceSlot {
    /// Zero-based position in the slot space (`a` is 0).
    pub index: usize,
    /// Name the control plane addresses (for example `/dev/sdf`).
    pub platform_name: String,
    /// Path the guest OS exposes (for example `/dev/vdf`).
    pub os_path: Utf8PathBuf,
}

/// Naming convention used to derive slots from suffix letters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceNaming {
    /// Prefix for the platform-facing name.
    pub platform_prefix: String,
    /// Prefix for the OS-visible path.
    pub os_prefix: String,
    /// Number of candidate slots. Values above 26 continue with two-letter
    /// suffixes (`aa`, `ab`, ...).
    pub max_slots: usize,
}

impl Default for DeviceNaming {
    fn default() -> Self {
        Self {
            platform_prefix: DEFAULT_PLATFORM_DEVICE_PREFIX.to_owned(),
            os_prefix: DEFAULT_OS_DEVICE_PREFIX.to_owned(),
            max_slots: DEFAULT_MAX_DEVICE_SLOTS,
        }
    }
}

impl DeviceNaming {
    /// Returns the disk-style suffix for `index`: `a`..`z`, then `aa`, `ab`.
    #[must_use]
    pub fn suffix(index: usize) -> String {
        let mut letters = Vec::new();
        let mut remaining = index + 1;
        while remaining > 0 {
            let zero_based = remaining - 1;
            letters.push(letter_at(zero_based.rem_euclid(ALPHABET_LEN)));
            remaining = zero_based.div_euclid(ALPHABET_LEN);
        }
        letters.iter().rev().collect()
    }

    /// Builds the slot at `index`.
    #[must_use]
    pub fn slot(&self, index: usize) -> DeviceSlot {
        let suffix = Self::suffix(index);
        DeviceSlot {
            index,
            platform_name: format!("{}{suffix}", self.platform_prefix),
            os_path: Utf8PathBuf::from(format!("{}{suffix}", self.os_prefix)),
        }
    }

    /// Iterates every candidate slot in allocation order.
    pub fn candidates(&self) -> impl Iterator<Item = DeviceSlot> + '_ {
        (0..self.max_slots).map(|index| self.slot(index))
    }
}

fn letter_at(offset: usize) -> char {
    b"abcdefghijklmnopqrstuvwxyz"
        .get(offset)
        .map_or('a', |byte| char::from(*byte))
}

/// Read-only view of the local device namespace.
pub trait DeviceProbe {
    /// Reports whether `path` exists.
    ///
    /// # Errors
    ///
    /// Returns the OS error for anything other than "does not exist".
    fn exists(&self, path: &Utf8Path) -> io::Result<bool>;
}

/// Probe backed by the real filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsDeviceProbe;

impl DeviceProbe for FsDeviceProbe {
    fn exists(&self, path: &Utf8Path) -> io::Result<bool> {
        match path.metadata() {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Errors raised while allocating a slot.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum DeviceError {
    /// Every candidate device path is already present.
    #[error("cannot locate an available device slot (checked {checked} candidates)")]
    NoFreeSlot {
        /// Number of candidates inspected.
        checked: usize,
    },
}

/// Picks the first slot whose OS path is absent.
#[derive(Clone, Debug)]
pub struct DeviceAllocator<P> {
    naming: DeviceNaming,
    probe: P,
}

impl<P: DeviceProbe> DeviceAllocator<P> {
    /// Creates an allocator over `naming` using `probe` for existence checks.
    #[must_use]
    pub const fn new(naming: DeviceNaming, probe: P) -> Self {
        Self { naming, probe }
    }

    /// Returns the first free slot.
    ///
    /// Candidates whose existence check fails with an error other than "not
    /// found" are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NoFreeSlot`] when every candidate is taken.
    pub fn allocate(&self) -> Result<DeviceSlot, DeviceError> {
        for slot in self.naming.candidates() {
            match self.probe.exists(&slot.os_path) {
                Ok(false) => {
                    tracing::info!(device = %slot.os_path, "found free device slot");
                    return Ok(slot);
                }
                Ok(true) => {}
                Err(err) => {
                    tracing::debug!(device = %slot.os_path, error = %err, "skipping device slot");
                }
            }
        }
        Err(DeviceError::NoFreeSlot {
            checked: self.naming.max_slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedDeviceProbe;
    use rstest::{fixture, rstest};

    #[fixture]
    fn xvd_naming() -> DeviceNaming {
        DeviceNaming {
            platform_prefix: String::from("/dev/sd"),
            os_prefix: String::from("/dev/xvd"),
            max_slots: 26,
        }
    }

    fn occupy_all_but(probe: &ScriptedDeviceProbe, naming: &DeviceNaming, free: &str) {
        for slot in naming.candidates() {
            if slot.os_path.as_str() != free {
                probe.add_device(slot.os_path.as_str());
            }
        }
    }

    #[rstest]
    #[case(0, "a")]
    #[case(5, "f")]
    #[case(25, "z")]
    #[case(26, "aa")]
    #[case(27, "ab")]
    #[case(51, "az")]
    #[case(52, "ba")]
    fn suffix_follows_disk_naming(#[case] index: usize, #[case] expected: &str) {
        assert_eq!(DeviceNaming::suffix(index), expected);
    }

    #[rstest]
    fn allocate_picks_only_absent_slot(xvd_naming: DeviceNaming) {
        let probe = ScriptedDeviceProbe::new();
        occupy_all_but(&probe, &xvd_naming, "/dev/xvdf");
        let allocator = DeviceAllocator::new(xvd_naming, probe);

        let slot = allocator.allocate().expect("slot f is free");

        assert_eq!(slot.index, 5);
        assert_eq!(slot.platform_name, "/dev/sdf");
        assert_eq!(slot.os_path, Utf8PathBuf::from("/dev/xvdf"));
    }

    #[rstest]
    fn allocate_fails_when_every_slot_exists(xvd_naming: DeviceNaming) {
        let probe = ScriptedDeviceProbe::new();
        occupy_all_but(&probe, &xvd_naming, "");
        let allocator = DeviceAllocator::new(xvd_naming, probe);

        assert_eq!(
            allocator.allocate(),
            Err(DeviceError::NoFreeSlot { checked: 26 })
        );
    }

    #[rstest]
    fn allocate_skips_slots_with_probe_errors(xvd_naming: DeviceNaming) {
        let probe = ScriptedDeviceProbe::new();
        probe.add_device("/dev/xvda");
        probe.fail_with_permission_denied("/dev/xvdb");
        let allocator = DeviceAllocator::new(xvd_naming, probe);

        let slot = allocator.allocate().expect("slot c is free");

        assert_eq!(slot.os_path, Utf8PathBuf::from("/dev/xvdc"));
    }

    #[test]
    fn allocate_continues_past_twenty_six_slots() {
        let naming = DeviceNaming {
            platform_prefix: String::from("/dev/sd"),
            os_prefix: String::from("/dev/xvd"),
            max_slots: 28,
        };
        let probe = ScriptedDeviceProbe::new();
        for slot in naming.candidates().take(26) {
            probe.add_device(slot.os_path.as_str());
        }
        let allocator = DeviceAllocator::new(naming, probe);

        let slot = allocator.allocate().expect("two-letter slot");

        assert_eq!(slot.os_path, Utf8PathBuf::from("/dev/xvdaa"));
    }

    #[test]
    fn fs_probe_distinguishes_absent_paths() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let present = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
        let absent = present.join("missing-device");

        assert!(FsDeviceProbe.exists(&present).expect("stat present"));
        assert!(!FsDeviceProbe.exists(&absent).expect("stat absent"));
    }
}
