/// What happens when an element asks to join a queue whose stage is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReentrancyPolicy {
    /// Park the request and merge it at the start of the next update.
    #[default]
    Defer,
    /// Refuse the request and log it as a protocol violation.
    Reject,
}

/// Configuration for a [`UiSystem`](crate::UiSystem).
#[derive(Debug, Clone, PartialEq)]
pub struct UiConfig {
    /// Stencil depth at which masking is skipped (hardware stencil bits).
    pub max_stencil_depth: u8,
    pub reentrancy: ReentrancyPolicy,
    /// Log each failing rebuild callback at error level.
    pub log_rebuild_failures: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            max_stencil_depth: 8,
            reentrancy: ReentrancyPolicy::Defer,
            log_rebuild_failures: true,
        }
    }
}

impl UiConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_stencil_depth(mut self, depth: u8) -> Self {
        self.max_stencil_depth = depth;
        self
    }

    pub fn reentrancy(mut self, policy: ReentrancyPolicy) -> Self {
        self.reentrancy = policy;
        self
    }

    pub fn log_rebuild_failures(mut self, enabled: bool) -> Self {
        self.log_rebuild_failures = enabled;
        self
    }
}
