use serde::{Deserialize, Serialize};
use strum::Display;

/// Which scanner(s) an environment runs before approving an update.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScannerKind {
  #[default]
  None,
  Grype,
  Trivy,
  Both,
}

impl ScannerKind {
  pub fn enabled(&self) -> bool {
    !matches!(self, ScannerKind::None)
  }

  /// The concrete scanners to run.
  pub fn scanners(&self) -> &'static [Scanner] {
    match self {
      ScannerKind::None => &[],
      ScannerKind::Grype => &[Scanner::Grype],
      ScannerKind::Trivy => &[Scanner::Trivy],
      ScannerKind::Both => &[Scanner::Grype, Scanner::Trivy],
    }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Scanner {
  Grype,
  Trivy,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
pub struct SeverityCounts {
  #[serde(default)]
  pub critical: u64,
  #[serde(default)]
  pub high: u64,
  #[serde(default)]
  pub medium: u64,
  #[serde(default)]
  pub low: u64,
  #[serde(default)]
  pub negligible: u64,
  #[serde(default)]
  pub unknown: u64,
}

impl SeverityCounts {
  pub fn total(&self) -> u64 {
    self.critical
      + self.high
      + self.medium
      + self.low
      + self.negligible
      + self.unknown
  }

  /// Combine results from multiple scanners by taking the
  /// per-severity maximum.
  pub fn merge_max(&self, other: &SeverityCounts) -> SeverityCounts {
    SeverityCounts {
      critical: self.critical.max(other.critical),
      high: self.high.max(other.high),
      medium: self.medium.max(other.medium),
      low: self.low.max(other.low),
      negligible: self.negligible.max(other.negligible),
      unknown: self.unknown.max(other.unknown),
    }
  }

  pub fn highest(&self) -> Option<&'static str> {
    if self.critical > 0 {
      Some("critical")
    } else if self.high > 0 {
      Some("high")
    } else if self.medium > 0 {
      Some("medium")
    } else if self.low > 0 {
      Some("low")
    } else if self.negligible > 0 {
      Some("negligible")
    } else if self.unknown > 0 {
      Some("unknown")
    } else {
      None
    }
  }
}

/// Policy deciding whether findings block an auto update.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanCriteria {
  Never,
  Any,
  #[default]
  CriticalHigh,
  Critical,
  /// Block only when the new image has strictly more findings
  /// than the currently running one.
  MoreThanCurrent,
}

impl ScanCriteria {
  /// `current_total` is the total finding count of the running
  /// image, when known.
  pub fn blocks(
    &self,
    new: &SeverityCounts,
    current_total: Option<u64>,
  ) -> bool {
    match self {
      ScanCriteria::Never => false,
      ScanCriteria::Any => new.total() > 0,
      ScanCriteria::CriticalHigh => new.critical + new.high > 0,
      ScanCriteria::Critical => new.critical > 0,
      ScanCriteria::MoreThanCurrent => match current_total {
        Some(current) => new.total() > current,
        // Without a baseline there is nothing to compare against.
        None => false,
      },
    }
  }
}

/// A completed scanner run against one image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VulnerabilityScan {
  pub id: String,
  #[serde(default)]
  pub environment_id: Option<String>,
  pub image_id: String,
  pub image_name: String,
  pub scanner: String,
  pub scanned_at: i64,
  pub duration_ms: i64,
  pub counts: SeverityCounts,
  #[serde(default)]
  pub vulnerabilities: serde_json::Value,
  #[serde(default)]
  pub error: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn counts(critical: u64, high: u64, low: u64) -> SeverityCounts {
    SeverityCounts {
      critical,
      high,
      low,
      ..Default::default()
    }
  }

  #[test]
  fn criteria_never_allows_everything() {
    assert!(!ScanCriteria::Never.blocks(&counts(10, 10, 10), None));
  }

  #[test]
  fn criteria_any_blocks_on_single_low() {
    assert!(ScanCriteria::Any.blocks(&counts(0, 0, 1), None));
    assert!(!ScanCriteria::Any.blocks(&counts(0, 0, 0), None));
  }

  #[test]
  fn criteria_critical_high() {
    assert!(ScanCriteria::CriticalHigh.blocks(&counts(0, 1, 0), None));
    assert!(
      !ScanCriteria::CriticalHigh.blocks(&counts(0, 0, 5), None)
    );
  }

  #[test]
  fn criteria_critical_only() {
    assert!(ScanCriteria::Critical.blocks(&counts(2, 0, 0), None));
    assert!(!ScanCriteria::Critical.blocks(&counts(0, 9, 9), None));
  }

  #[test]
  fn criteria_more_than_current() {
    let new = counts(1, 1, 1);
    assert!(ScanCriteria::MoreThanCurrent.blocks(&new, Some(2)));
    assert!(!ScanCriteria::MoreThanCurrent.blocks(&new, Some(3)));
    assert!(!ScanCriteria::MoreThanCurrent.blocks(&new, None));
  }

  #[test]
  fn merge_takes_per_severity_max() {
    let a = SeverityCounts {
      critical: 2,
      medium: 1,
      ..Default::default()
    };
    let b = SeverityCounts {
      critical: 1,
      high: 4,
      ..Default::default()
    };
    let merged = a.merge_max(&b);
    assert_eq!(merged.critical, 2);
    assert_eq!(merged.high, 4);
    assert_eq!(merged.medium, 1);
  }

  #[test]
  fn highest_severity_name() {
    assert_eq!(counts(1, 0, 0).highest(), Some("critical"));
    assert_eq!(counts(0, 0, 3).highest(), Some("low"));
    assert_eq!(counts(0, 0, 0).highest(), None);
  }
}
