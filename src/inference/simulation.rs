//! Trajectory rollout types.
//!
//! Rolling the dynamics forward is a diagnostic, not a validated forecast:
//! the model is only trained on one-step transitions between snapshots.

use serde::{Deserialize, Serialize};

use super::engine::EntityScore;

/// What the dynamics model is fed as its observation at each rollout step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ObservationSource {
    /// The current state is its own observation. This looks for fixed
    /// points; it does not model any external input.
    #[default]
    #[serde(rename = "self")]
    SelfState,
    /// Seeded Gaussian noise
    #[serde(rename = "random")]
    Random,
}

impl std::fmt::Display for ObservationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfState => write!(f, "self"),
            Self::Random => write!(f, "random"),
        }
    }
}

impl std::str::FromStr for ObservationSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "self" => Ok(Self::SelfState),
            "random" | "noise" => Ok(Self::Random),
            other => anyhow::bail!(
                "Unknown observation source '{}': expected self or random",
                other
            ),
        }
    }
}

/// One step of a simulated trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub step: usize,
    /// Latent state after this step
    pub latent: Vec<f32>,
    /// L2 distance from the previous state
    pub state_change: f32,
    pub top_entities: Vec<EntityScore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_source_parsing() {
        assert_eq!("self".parse::<ObservationSource>().unwrap(), ObservationSource::SelfState);
        assert_eq!("Random".parse::<ObservationSource>().unwrap(), ObservationSource::Random);
        assert!("oracle".parse::<ObservationSource>().is_err());

        let yaml: ObservationSource = serde_yaml::from_str("self").unwrap();
        assert_eq!(yaml, ObservationSource::SelfState);
        assert_eq!(ObservationSource::Random.to_string(), "random");
    }
}
