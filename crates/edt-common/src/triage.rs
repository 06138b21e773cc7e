//! Manchester-style triage levels and their static attributes.

use serde::{Deserialize, Serialize};

/// Five-level triage classification. Lower ordinal = higher urgency, which
/// doubles as the queueing priority for consult rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriageLevel {
    Red,
    Orange,
    Yellow,
    Green,
    Blue,
}

impl TriageLevel {
    pub const ALL: [TriageLevel; 5] = [
        TriageLevel::Red,
        TriageLevel::Orange,
        TriageLevel::Yellow,
        TriageLevel::Green,
        TriageLevel::Blue,
    ];

    /// Queue priority: 0 (most urgent) to 4.
    pub fn priority(self) -> u8 {
        match self {
            TriageLevel::Red => 0,
            TriageLevel::Orange => 1,
            TriageLevel::Yellow => 2,
            TriageLevel::Green => 3,
            TriageLevel::Blue => 4,
        }
    }

    /// Maximum clinically acceptable wait before consultation.
    pub fn max_wait_minutes(self) -> u32 {
        match self {
            TriageLevel::Red => 0,
            TriageLevel::Orange => 10,
            TriageLevel::Yellow => 60,
            TriageLevel::Green => 120,
            TriageLevel::Blue => 240,
        }
    }

    /// Base consultation duration with a single doctor.
    pub fn base_consult_minutes(self) -> f64 {
        match self {
            TriageLevel::Red => 30.0,
            TriageLevel::Orange => 25.0,
            TriageLevel::Yellow => 15.0,
            TriageLevel::Green => 10.0,
            TriageLevel::Blue => 5.0,
        }
    }

    /// Probability of routing to observation instead of discharge after
    /// consultation.
    pub fn observation_probability(self) -> f64 {
        match self {
            TriageLevel::Red => 0.40,
            TriageLevel::Orange => 0.25,
            TriageLevel::Yellow => 0.15,
            TriageLevel::Green => 0.05,
            TriageLevel::Blue => 0.01,
        }
    }

    /// Levels that must be treated at the reference center.
    pub fn requires_reference(self) -> bool {
        matches!(self, TriageLevel::Red | TriageLevel::Orange)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriageLevel::Red => "RED",
            TriageLevel::Orange => "ORANGE",
            TriageLevel::Yellow => "YELLOW",
            TriageLevel::Green => "GREEN",
            TriageLevel::Blue => "BLUE",
        }
    }
}

impl std::fmt::Display for TriageLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
