//! Per-coroutine run context
//!
//! Carries request-scoped identifiers (message id, target method) so an
//! RPC layer can correlate log lines and replies with the request a
//! coroutine is serving. The owning coroutine resets it each time it is
//! re-armed with a new body.

/// Request-scoped bookkeeping attached to a coroutine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunContext {
    /// Message sequence id of the request being served
    pub msg_id: String,
    /// Fully qualified method name being dispatched
    pub method: String,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset both fields; called when a pooled coroutine is re-armed.
    pub fn clear(&mut self) {
        self.msg_id.clear();
        self.method.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.msg_id.is_empty() && self.method.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_context_clear() {
        let mut ctx = RunContext::new();
        assert!(ctx.is_empty());

        ctx.msg_id = "99000021".to_string();
        ctx.method = "QueryService.get_user".to_string();
        assert!(!ctx.is_empty());

        ctx.clear();
        assert!(ctx.is_empty());
        assert_eq!(ctx, RunContext::default());
    }
}
