//! Idle detection.
//!
//! An environment is idle when it is not persistent, not stopped, and has
//! seen no activity for longer than the container timeout. The VM is idle
//! when it is absent or stopped, or when every environment is stopped and
//! the VM itself has been quiet for longer than the VM timeout.

use crate::state::{EnvironmentRecord, StateDocument, Status};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Time since `last_active`, clamped at zero.
pub fn idle_duration(last_active: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - last_active).to_std().unwrap_or(Duration::ZERO)
}

/// Idle duration rounded to whole seconds for display, e.g. `12m 5s`.
pub fn format_idle(idle: Duration) -> String {
    humantime::format_duration(Duration::from_secs(idle.as_secs())).to_string()
}

/// Thresholds for the two idle tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    pub container_timeout: Duration,
    pub vm_timeout: Duration,
}

impl IdlePolicy {
    /// Whether `env` should be stopped.
    pub fn environment_is_idle(&self, env: &EnvironmentRecord, now: DateTime<Utc>) -> bool {
        !env.persistent
            && env.status != Status::Stopped
            && idle_duration(env.last_active, now) > self.container_timeout
    }

    /// Names of environments that should be stopped, in name order.
    pub fn idle_environments(&self, doc: &StateDocument, now: DateTime<Utc>) -> Vec<String> {
        doc.environments()
            .filter(|env| self.environment_is_idle(env, now))
            .map(|env| env.name.clone())
            .collect()
    }

    /// Whether the VM counts as idle.
    pub fn vm_is_idle(&self, doc: &StateDocument, now: DateTime<Utc>) -> bool {
        let Some(vm) = doc.vm() else {
            return true;
        };
        if vm.status == Status::Stopped {
            return true;
        }
        !doc.any_environment_running() && idle_duration(vm.last_active, now) > self.vm_timeout
    }
}
