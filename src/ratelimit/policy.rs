//! Rate limit policies and their per-identity resolution.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::{PolicyConfig, PolicyRule};
use crate::error::{GateError, Result};

/// Longest window or block duration a policy may carry.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Limit, counting window and block duration applied to one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    limit: u64,
    window: Duration,
    block_duration: Duration,
}

impl Policy {
    /// Create a policy. `limit` is inclusive: the `limit`-th request in a
    /// window passes, the next one blocks the key.
    pub fn new(limit: u64, window: Duration, block_duration: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(GateError::InvalidPolicy("limit must be at least 1".to_string()));
        }
        check_duration("window", window)?;
        check_duration("block duration", block_duration)?;

        Ok(Self {
            limit,
            window,
            block_duration,
        })
    }

    /// Maximum requests allowed per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Length of the counting window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// How long a key stays denied after exceeding its limit.
    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }
}

fn check_duration(what: &str, d: Duration) -> Result<()> {
    if d < Duration::from_secs(1) || d > MAX_DURATION {
        return Err(GateError::InvalidPolicy(format!(
            "{} must be between 1s and {}s, got {:?}",
            what,
            MAX_DURATION.as_secs(),
            d
        )));
    }
    Ok(())
}

impl TryFrom<&PolicyRule> for Policy {
    type Error = GateError;

    fn try_from(rule: &PolicyRule) -> Result<Self> {
        Policy::new(
            rule.limit,
            Duration::from_secs(rule.window_secs),
            Duration::from_secs(rule.block_secs),
        )
    }
}

/// Resolved policies for every identity type.
///
/// Built once at startup; every override is resolved and validated up front
/// so a bad entry fails the process instead of a request.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    ip: Policy,
    token: Policy,
    overrides: HashMap<String, Policy>,
}

impl PolicyTable {
    /// Resolve a policy table from configuration.
    ///
    /// Each override field falls back to the token default on its own.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let ip = Policy::try_from(&config.ip)?;
        let token = Policy::try_from(&config.token)?;

        let mut overrides = HashMap::with_capacity(config.overrides.len());
        for entry in &config.overrides {
            if entry.token.is_empty() {
                return Err(GateError::InvalidPolicy(
                    "override with an empty token".to_string(),
                ));
            }
            let rule = PolicyRule {
                limit: entry.limit.unwrap_or(config.token.limit),
                window_secs: entry.window_secs.unwrap_or(config.token.window_secs),
                block_secs: entry.block_secs.unwrap_or(config.token.block_secs),
            };
            let policy = Policy::try_from(&rule).map_err(|e| {
                GateError::InvalidPolicy(format!("override for token {:?}: {}", entry.token, e))
            })?;
            overrides.insert(entry.token.clone(), policy);
        }

        Ok(Self {
            ip,
            token,
            overrides,
        })
    }

    /// Policy for address-based keys.
    pub fn for_ip(&self) -> Policy {
        self.ip
    }

    /// Policy for a credential, honouring its override if any.
    pub fn for_token(&self, credential: &str) -> Policy {
        self.overrides.get(credential).copied().unwrap_or(self.token)
    }

    /// Number of per-credential overrides.
    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}
