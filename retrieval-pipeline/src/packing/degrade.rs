use super::Tier;

/// Progressive reduction ladder. The packed bundle reports the highest
/// level any emitted item was forced to; Emergency means even must-have
/// content survives only as signature capsules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DegradeLevel {
    None = 0,
    /// Capsules on optional items.
    Mild = 1,
    /// Capsules on supplementary items.
    Moderate = 2,
    /// Capsules on important items.
    Heavy = 3,
    /// Optional and supplementary dropped outright.
    Severe = 4,
    /// Only must-have signatures.
    Emergency = 5,
}

impl DegradeLevel {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Level implied when an item of `tier` could only be emitted as a
    /// capsule.
    pub const fn for_forced_capsule(tier: Tier) -> Self {
        match tier {
            Tier::Optional => Self::Mild,
            Tier::Supplementary => Self::Moderate,
            Tier::Important => Self::Heavy,
            // A must-have that fits only as a capsule is still a routine
            // reduction; signature-only capsules report Emergency.
            Tier::MustHave => Self::Heavy,
        }
    }

    /// Level implied when an item of `tier` was dropped for space.
    pub const fn for_drop(tier: Tier) -> Self {
        match tier {
            Tier::Optional | Tier::Supplementary => Self::Severe,
            Tier::Important | Tier::MustHave => Self::Emergency,
        }
    }

    /// Upper bound on the token reduction a capsule at this level should
    /// apply; reductions beyond it escalate.
    pub const fn max_reduction(self) -> f32 {
        match self {
            Self::None => 0.0,
            Self::Mild => 0.5,
            Self::Moderate => 0.7,
            Self::Heavy => 0.85,
            Self::Severe => 0.95,
            Self::Emergency => 1.0,
        }
    }
}

/// Capsules must retain at least this share of the original's anchor
/// tokens (identifiers from signature, name, and leading doc).
pub const SIMILARITY_FLOOR: f32 = 0.9;
