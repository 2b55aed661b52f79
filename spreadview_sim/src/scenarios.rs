//! Simulation scenarios for the estimation engine.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: One drifting Wiener process observed directly
    SingleWiener,

    /// SIM-002: Two legs, one observed directly and one only through the spread
    SpreadPair,

    /// SIM-003: Mean-reverting (Ornstein-Uhlenbeck) spread
    MeanReverting,

    /// SIM-004: Gross outliers injected, gate must reject them
    Outliers,

    /// SIM-005: Irregular arrival times across three observables
    Async,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SingleWiener,
            ScenarioId::SpreadPair,
            ScenarioId::MeanReverting,
            ScenarioId::Outliers,
            ScenarioId::Async,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SingleWiener => "single_wiener",
            ScenarioId::SpreadPair => "spread_pair",
            ScenarioId::MeanReverting => "mean_reverting",
            ScenarioId::Outliers => "outliers",
            ScenarioId::Async => "async",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SingleWiener => "Wiener process (3/day drift, 25/day variance), hourly direct quotes",
            ScenarioId::SpreadPair => "Two independent legs, leg A quoted directly, leg B only via A-B spread",
            ScenarioId::MeanReverting => "OU spread reverting to 1.0, hourly quotes",
            ScenarioId::Outliers => "Every 10th quote is a 50-sigma outlier, chi-squared gate enabled",
            ScenarioId::Async => "Exponential inter-arrival times, quotes on leg A, leg B and the spread",
        }
    }

    /// Returns true if the scenario enables an acceptance gate.
    pub fn is_gated(&self) -> bool {
        matches!(self, ScenarioId::Outliers)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single_wiener" | "singlewiener" | "sim-001" => Ok(ScenarioId::SingleWiener),
            "spread_pair" | "spreadpair" | "sim-002" => Ok(ScenarioId::SpreadPair),
            "mean_reverting" | "meanreverting" | "ou" | "sim-003" => Ok(ScenarioId::MeanReverting),
            "outliers" | "sim-004" => Ok(ScenarioId::Outliers),
            "async" | "sim-005" => Ok(ScenarioId::Async),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_from_str() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>().unwrap(), id);
        }
        assert_eq!("SIM-003".parse::<ScenarioId>().unwrap(), ScenarioId::MeanReverting);
        assert!("nope".parse::<ScenarioId>().is_err());
    }
}
