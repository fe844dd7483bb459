use thiserror::Error;

/// Service-level failures.
///
/// Everything a submission can do wrong is reported through the evaluation
/// envelope instead; these are the conditions the caller has to handle as
/// "could not evaluate".
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("All sandboxes busy: no slot freed up within {waited_ms}ms")]
    PoolSaturated { waited_ms: u64 },

    #[error("Source code is {size} bytes, limit is {limit} bytes")]
    SourceTooLarge { size: usize, limit: usize },

    #[error("Sandbox failure: {0:#}")]
    Sandbox(#[from] anyhow::Error),
}

impl EvalError {
    /// Stable machine-readable name used in worker responses
    pub fn kind(&self) -> &'static str {
        match self {
            EvalError::PoolSaturated { .. } => "pool_saturated",
            EvalError::SourceTooLarge { .. } => "source_too_large",
            EvalError::Sandbox(_) => "sandbox_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_and_kinds() {
        let saturated = EvalError::PoolSaturated { waited_ms: 250 };
        assert_eq!(saturated.kind(), "pool_saturated");
        assert!(saturated.to_string().contains("250ms"));

        let too_large = EvalError::SourceTooLarge { size: 10, limit: 5 };
        assert_eq!(too_large.kind(), "source_too_large");

        let sandbox: EvalError = anyhow::anyhow!("spawn failed").context("Failed to launch").into();
        assert_eq!(sandbox.kind(), "sandbox_failure");
        assert!(sandbox.to_string().contains("spawn failed"));
    }
}
