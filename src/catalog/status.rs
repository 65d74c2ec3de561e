use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Untested,
    Passing,
    Failing,
}

impl Status {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Untested => "untested",
            Self::Passing => "passing",
            Self::Failing => "failing",
        }
    }

    /// Folds descendant facet statuses into the status of their ancestor.
    ///
    /// A single failing facet makes the ancestor fail. Passing needs at least
    /// one facet and every facet passing. Anything else is untested.
    pub fn aggregate<I>(facet_statuses: I) -> Self
    where
        I: IntoIterator<Item = Status>,
    {
        let mut seen_any = false;
        let mut all_passing = true;
        for status in facet_statuses {
            seen_any = true;
            match status {
                Self::Failing => return Self::Failing,
                Self::Untested => all_passing = false,
                Self::Passing => {}
            }
        }
        if seen_any && all_passing {
            Self::Passing
        } else {
            Self::Untested
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visibility filter for catalog tree views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    Unsatisfied,
    Passing,
    Failing,
    Untested,
}

impl StatusFilter {
    pub fn matches(self, status: Status) -> bool {
        match self {
            Self::Unsatisfied => status != Status::Passing,
            Self::Passing => status == Status::Passing,
            Self::Failing => status == Status::Failing,
            Self::Untested => status == Status::Untested,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "unsatisfied" => Ok(Self::Unsatisfied),
            "passing" => Ok(Self::Passing),
            "failing" => Ok(Self::Failing),
            "untested" => Ok(Self::Untested),
            other => Err(format!(
                "unknown status filter `{other}` (expected unsatisfied, passing, failing or untested)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Status, StatusFilter};

    #[test]
    fn aggregate_of_nothing_is_untested() {
        assert_eq!(Status::aggregate([]), Status::Untested);
    }

    #[test]
    fn one_failure_dominates() {
        assert_eq!(
            Status::aggregate([Status::Passing, Status::Untested, Status::Failing]),
            Status::Failing
        );
    }

    #[test]
    fn passing_requires_every_facet_passing() {
        assert_eq!(
            Status::aggregate([Status::Passing, Status::Passing]),
            Status::Passing
        );
        assert_eq!(
            Status::aggregate([Status::Passing, Status::Untested]),
            Status::Untested
        );
    }

    #[test]
    fn unsatisfied_filter_keeps_everything_but_passing() {
        assert!(StatusFilter::Unsatisfied.matches(Status::Failing));
        assert!(StatusFilter::Unsatisfied.matches(Status::Untested));
        assert!(!StatusFilter::Unsatisfied.matches(Status::Passing));
        assert!("FAILING".parse::<StatusFilter>().is_ok());
        assert!("green".parse::<StatusFilter>().is_err());
    }
}
