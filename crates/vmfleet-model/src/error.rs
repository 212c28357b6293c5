use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown instance status: {0}")]
    UnknownStatus(String),

    #[error("unknown provider state: {0}")]
    UnknownProviderState(String),

    #[error("unknown os type: {0}")]
    UnknownOsType(String),
}

pub type ModelResult<T> = Result<T, ModelError>;

/// Every configuration defect found in an image descriptor.
///
/// Validation never stops at the first problem, so callers see all of them at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("invalid image descriptor: {}", .problems.join("; "))]
pub struct ValidationErrors {
    problems: Vec<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more problem.
    pub fn push(&mut self, problem: impl Into<String>) {
        self.problems.push(problem.into());
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn problems(&self) -> &[String] {
        &self.problems
    }

    /// `Ok(())` when nothing was recorded, the accumulated list otherwise.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_is_ok() {
        assert!(ValidationErrors::new().into_result().is_ok());
    }

    #[test]
    fn display_joins_every_problem() {
        let mut errs = ValidationErrors::new();
        errs.push("region is missing");
        errs.push("network id is missing");

        assert_eq!(errs.len(), 2);
        assert_eq!(
            errs.to_string(),
            "invalid image descriptor: region is missing; network id is missing"
        );
        assert!(errs.into_result().is_err());
    }
}
