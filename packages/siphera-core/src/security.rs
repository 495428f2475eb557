//! # Security Scoring
//!
//! Every backend, storage tier and strategy reports a [`SecurityAssessment`].
//! The factory folds them into one overall assessment:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  level   │ score │ bucket for the average of three scores              │
//! ├──────────┼───────┼──────────────────────────────────────────────────────┤
//! │  maximum │   4   │  avg ≥ 3.5                                           │
//! │  high    │   3   │  avg ≥ 2.5                                           │
//! │  medium  │   2   │  avg ≥ 1.5                                           │
//! │  low     │   1   │  otherwise                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

/// Coarse security level, ordered `Low < Medium < High < Maximum`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// No meaningful protection
    Low,
    /// Protected, with known weaknesses
    Medium,
    /// Well protected
    High,
    /// Nothing persisted, strongest primitives
    Maximum,
}

impl SecurityLevel {
    /// Numeric score, 1 (low) to 4 (maximum)
    pub fn score(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Maximum => 4,
        }
    }

    /// Bucket an averaged score back into a level
    pub fn from_average(average: f64) -> Self {
        if average >= 3.5 {
            Self::Maximum
        } else if average >= 2.5 {
            Self::High
        } else if average >= 1.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Maximum => "maximum",
        }
    }
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A level plus the reasons it is not higher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAssessment {
    /// Overall level
    pub level: SecurityLevel,
    /// Missing guarantees
    pub risks: Vec<String>,
    /// What would raise the level
    pub recommendations: Vec<String>,
}

impl SecurityAssessment {
    /// An assessment with no risks
    pub fn new(level: SecurityLevel) -> Self {
        Self {
            level,
            risks: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    /// Add a risk
    pub fn with_risk(mut self, risk: impl Into<String>) -> Self {
        self.risks.push(risk.into());
        self
    }

    /// Add a recommendation
    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendations.push(recommendation.into());
        self
    }

    /// Average the scores of several assessments and concatenate their lists
    pub fn combine(parts: &[&SecurityAssessment]) -> Self {
        if parts.is_empty() {
            return Self::new(SecurityLevel::Low)
                .with_risk("No components to assess");
        }

        let total: u32 = parts.iter().map(|p| u32::from(p.level.score())).sum();
        let average = f64::from(total) / parts.len() as f64;

        Self {
            level: SecurityLevel::from_average(average),
            risks: parts.iter().flat_map(|p| p.risks.iter().cloned()).collect(),
            recommendations: parts
                .iter()
                .flat_map(|p| p.recommendations.iter().cloned())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scores_and_ordering() {
        assert_eq!(SecurityLevel::Low.score(), 1);
        assert_eq!(SecurityLevel::Maximum.score(), 4);
        assert!(SecurityLevel::Maximum > SecurityLevel::High);
        assert!(SecurityLevel::High > SecurityLevel::Medium);
        assert!(SecurityLevel::Medium > SecurityLevel::Low);
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(SecurityLevel::from_average(3.5), SecurityLevel::Maximum);
        assert_eq!(SecurityLevel::from_average(3.49), SecurityLevel::High);
        assert_eq!(SecurityLevel::from_average(2.5), SecurityLevel::High);
        assert_eq!(SecurityLevel::from_average(1.5), SecurityLevel::Medium);
        assert_eq!(SecurityLevel::from_average(1.49), SecurityLevel::Low);
    }

    #[test]
    fn test_combine_averages_and_concatenates() {
        let a = SecurityAssessment::new(SecurityLevel::Maximum);
        let b = SecurityAssessment::new(SecurityLevel::High).with_risk("r1");
        let c = SecurityAssessment::new(SecurityLevel::Medium)
            .with_risk("r2")
            .with_recommendation("fix it");

        // (4 + 3 + 2) / 3 = 3.0
        let combined = SecurityAssessment::combine(&[&a, &b, &c]);
        assert_eq!(combined.level, SecurityLevel::High);
        assert_eq!(combined.risks, vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(combined.recommendations, vec!["fix it".to_string()]);
    }

    #[test]
    fn test_serializes_lowercase() {
        let json = serde_json::to_string(&SecurityLevel::Maximum).unwrap();
        assert_eq!(json, "\"maximum\"");
    }
}
