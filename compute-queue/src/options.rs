//! Allocation options for buffers.
//!
//! The packed layout follows the native resource option word: CPU cache mode
//! in bits 0..4, storage mode in bits 4..8 and hazard tracking in bits 8..12.

use bitflags::bitflags;

use crate::error::ValidationFailure;

const RESOURCE_CPU_CACHE_MODE_SHIFT: u16 = 0;
const RESOURCE_STORAGE_MODE_SHIFT: u16 = 4;
const RESOURCE_HAZARD_TRACKING_MODE_SHIFT: u16 = 8;
const MODE_MASK: u16 = 0xf;

/// Where a resource lives and who may touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum StorageMode {
    /// System memory visible to both host and device.
    #[default]
    Shared = 0,
    /// A host copy and a device copy kept in sync by the runtime.
    Managed = 1,
    /// Device memory with no host view.
    Private = 2,
    /// Tile memory for transient render targets. Never valid for buffers.
    Memoryless = 3,
}

impl StorageMode {
    /// Whether the host can read and write the contents.
    pub fn is_host_visible(self) -> bool {
        matches!(self, Self::Shared | Self::Managed)
    }
}

/// How the host maps a resource into its caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CpuCacheMode {
    /// Reads and writes observe program order.
    #[default]
    DefaultCache = 0,
    /// Optimized for resources the host writes but never reads.
    WriteCombined = 1,
}

/// Whether the runtime tracks hazards between passes for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum HazardTrackingMode {
    /// Dependencies are tracked automatically.
    #[default]
    Tracked = 0,
    /// The caller orders access manually.
    Untracked = 1,
}

bitflags! {
    /// Packed allocation options, see the module docs for the layout.
    ///
    /// The empty value selects shared storage with the default cache mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceOptions: u16 {
        /// Write-combined host mapping.
        const CPU_CACHE_MODE_WRITE_COMBINED =
            (CpuCacheMode::WriteCombined as u16) << RESOURCE_CPU_CACHE_MODE_SHIFT;
        /// Managed storage.
        const STORAGE_MODE_MANAGED =
            (StorageMode::Managed as u16) << RESOURCE_STORAGE_MODE_SHIFT;
        /// Device-private storage.
        const STORAGE_MODE_PRIVATE =
            (StorageMode::Private as u16) << RESOURCE_STORAGE_MODE_SHIFT;
        /// Memoryless storage.
        const STORAGE_MODE_MEMORYLESS =
            (StorageMode::Memoryless as u16) << RESOURCE_STORAGE_MODE_SHIFT;
        /// Untracked hazards.
        const HAZARD_TRACKING_MODE_UNTRACKED =
            (HazardTrackingMode::Untracked as u16) << RESOURCE_HAZARD_TRACKING_MODE_SHIFT;
    }
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self::STORAGE_MODE_SHARED
    }
}

impl ResourceOptions {
    /// Shared storage (the zero value).
    pub const STORAGE_MODE_SHARED: Self = Self::empty();
    /// Default cache mode (the zero value).
    pub const CPU_CACHE_MODE_DEFAULT_CACHE: Self = Self::empty();

    /// Builds options from modes.
    pub fn new(storage: StorageMode, cache: CpuCacheMode, hazard: HazardTrackingMode) -> Self {
        Self::from_bits_retain(
            ((storage as u16) << RESOURCE_STORAGE_MODE_SHIFT)
                | ((cache as u16) << RESOURCE_CPU_CACHE_MODE_SHIFT)
                | ((hazard as u16) << RESOURCE_HAZARD_TRACKING_MODE_SHIFT),
        )
    }

    /// Parses a raw option word, rejecting bits outside the known layout.
    pub fn from_raw(bits: u16) -> Result<Self, ValidationFailure> {
        Self::from_bits(bits).ok_or(ValidationFailure::UnknownResourceOptions {
            bits: bits & !Self::all().bits(),
        })
    }

    /// Rejects values built with unknown bits retained.
    pub(crate) fn validate(self) -> Result<Self, ValidationFailure> {
        Self::from_raw(self.bits())
    }

    /// The storage mode field.
    pub fn storage_mode(self) -> StorageMode {
        match (self.bits() >> RESOURCE_STORAGE_MODE_SHIFT) & MODE_MASK {
            1 => StorageMode::Managed,
            2 => StorageMode::Private,
            3 => StorageMode::Memoryless,
            _ => StorageMode::Shared,
        }
    }

    /// The CPU cache mode field.
    pub fn cpu_cache_mode(self) -> CpuCacheMode {
        match (self.bits() >> RESOURCE_CPU_CACHE_MODE_SHIFT) & MODE_MASK {
            1 => CpuCacheMode::WriteCombined,
            _ => CpuCacheMode::DefaultCache,
        }
    }

    /// The hazard tracking field.
    pub fn hazard_tracking_mode(self) -> HazardTrackingMode {
        match (self.bits() >> RESOURCE_HAZARD_TRACKING_MODE_SHIFT) & MODE_MASK {
            1 => HazardTrackingMode::Untracked,
            _ => HazardTrackingMode::Tracked,
        }
    }
}

impl From<StorageMode> for ResourceOptions {
    fn from(storage: StorageMode) -> Self {
        Self::new(
            storage,
            CpuCacheMode::default(),
            HazardTrackingMode::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_fields_round_trip() {
        let options = ResourceOptions::new(
            StorageMode::Private,
            CpuCacheMode::WriteCombined,
            HazardTrackingMode::Untracked,
        );
        assert_eq!(options.bits(), 0x0121);
        assert_eq!(options.storage_mode(), StorageMode::Private);
        assert_eq!(options.cpu_cache_mode(), CpuCacheMode::WriteCombined);
        assert_eq!(
            options.hazard_tracking_mode(),
            HazardTrackingMode::Untracked
        );
    }

    #[test]
    fn default_is_shared() {
        let options = ResourceOptions::default();
        assert_eq!(options.bits(), 0);
        assert_eq!(options.storage_mode(), StorageMode::Shared);
        assert!(options.storage_mode().is_host_visible());
        assert!(!StorageMode::Private.is_host_visible());
    }

    #[test]
    fn unknown_bits_are_rejected() {
        assert_eq!(
            ResourceOptions::from_raw(0x8040),
            Err(ValidationFailure::UnknownResourceOptions { bits: 0x8040 })
        );
        assert_eq!(
            ResourceOptions::from_bits_retain(0x0200).validate(),
            Err(ValidationFailure::UnknownResourceOptions { bits: 0x0200 })
        );
        assert!(ResourceOptions::from_raw(0x0020).is_ok());
    }
}
