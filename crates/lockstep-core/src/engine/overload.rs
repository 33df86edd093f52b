//! Overload detection and the degradation ladder
//!
//! Every block's processing cost is compared with a fraction of the callback
//! period. Runs of overruns escalate one step at a time:
//!
//! ```text
//! Full ──► EffectsBypassed ──► Mono ──► Silent
//!  ◄──────────── one step per cooldown of clean blocks
//! ```
//!
//! Degradation is sticky: stepping back down needs `cooldown_blocks`
//! consecutive overrun-free blocks per step.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Degradation level, in escalation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum DegradeLevel {
    #[default]
    Full = 0,
    /// Effect auditioning skipped
    EffectsBypassed = 1,
    /// Conversion and stretching on a mono fold, duplicated to both channels
    Mono = 2,
    /// Pull chain skipped, block is silence
    Silent = 3,
}

impl DegradeLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DegradeLevel::EffectsBypassed,
            2 => DegradeLevel::Mono,
            3 => DegradeLevel::Silent,
            _ => DegradeLevel::Full,
        }
    }

    fn escalated(self) -> Self {
        Self::from_u8((self as u8 + 1).min(3))
    }

    fn relaxed(self) -> Self {
        Self::from_u8((self as u8).saturating_sub(1))
    }

    pub fn effects_disabled(self) -> bool {
        self >= DegradeLevel::EffectsBypassed
    }

    pub fn mono(self) -> bool {
        self >= DegradeLevel::Mono
    }
}

/// Level transition reported by [`OverloadGovernor::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelChange {
    Escalated(DegradeLevel),
    Recovered(DegradeLevel),
}

/// Governor tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverloadPolicy {
    /// Fraction of the callback period a block may use
    pub budget_fraction: f64,
    /// Consecutive overruns tolerated before escalating
    pub overrun_threshold: u32,
    /// Clean blocks required per recovery step
    pub cooldown_blocks: u32,
    /// When false, cost is never evaluated
    pub enabled: bool,
}

impl Default for OverloadPolicy {
    fn default() -> Self {
        Self {
            budget_fraction: 0.8,
            overrun_threshold: 4,
            cooldown_blocks: 64,
            enabled: true,
        }
    }
}

/// Decides the degradation level from per-block cost
pub struct OverloadGovernor {
    policy: OverloadPolicy,
    level: DegradeLevel,
    consecutive_overruns: u32,
    clean_blocks: u32,
    last_overrun: bool,
}

impl OverloadGovernor {
    pub fn new(policy: OverloadPolicy) -> Self {
        Self {
            policy,
            level: DegradeLevel::Full,
            consecutive_overruns: 0,
            clean_blocks: 0,
            last_overrun: false,
        }
    }

    pub fn policy(&self) -> &OverloadPolicy {
        &self.policy
    }

    pub fn level(&self) -> DegradeLevel {
        self.level
    }

    pub fn consecutive_overruns(&self) -> u32 {
        self.consecutive_overruns
    }

    /// Whether the last observed block overran its budget
    pub fn last_overrun(&self) -> bool {
        self.last_overrun
    }

    /// Feed one block's cost. Returns the level change it caused, if any.
    pub fn observe(&mut self, cost: Duration, period: Duration) -> Option<LevelChange> {
        if !self.policy.enabled {
            return None;
        }

        let overrun = cost.as_secs_f64() > period.as_secs_f64() * self.policy.budget_fraction;
        self.last_overrun = overrun;
        if overrun {
            self.clean_blocks = 0;
            self.consecutive_overruns += 1;
            if self.consecutive_overruns > self.policy.overrun_threshold
                && self.level < DegradeLevel::Silent
            {
                self.consecutive_overruns = 0;
                self.level = self.level.escalated();
                return Some(LevelChange::Escalated(self.level));
            }
        } else {
            self.consecutive_overruns = 0;
            if self.level > DegradeLevel::Full {
                self.clean_blocks += 1;
                if self.clean_blocks >= self.policy.cooldown_blocks {
                    self.clean_blocks = 0;
                    self.level = self.level.relaxed();
                    return Some(LevelChange::Recovered(self.level));
                }
            }
        }
        None
    }

    /// Back to full quality (stream start)
    pub fn reset(&mut self) {
        self.level = DegradeLevel::Full;
        self.consecutive_overruns = 0;
        self.clean_blocks = 0;
        self.last_overrun = false;
    }
}

/// Snapshot of the overload state, read by the control side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverloadStatus {
    pub consecutive_overruns: u32,
    pub effects_disabled: bool,
    pub degraded_to_mono: bool,
    pub level: DegradeLevel,
    pub total_overruns: u64,
    pub silenced_blocks: u64,
}

/// Lock-free overload state shared with the UI
///
/// Written only by the audio thread, reset at stream start.
#[derive(Debug, Default)]
pub struct OverloadAtomics {
    consecutive_overruns: AtomicU32,
    effects_disabled: AtomicBool,
    degraded_to_mono: AtomicBool,
    level: AtomicU8,
    total_overruns: AtomicU64,
    silenced_blocks: AtomicU64,
}

impl OverloadAtomics {
    pub fn snapshot(&self) -> OverloadStatus {
        OverloadStatus {
            consecutive_overruns: self.consecutive_overruns.load(Ordering::Relaxed),
            effects_disabled: self.effects_disabled.load(Ordering::Relaxed),
            degraded_to_mono: self.degraded_to_mono.load(Ordering::Relaxed),
            level: DegradeLevel::from_u8(self.level.load(Ordering::Relaxed)),
            total_overruns: self.total_overruns.load(Ordering::Relaxed),
            silenced_blocks: self.silenced_blocks.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn publish(&self, governor: &OverloadGovernor, effects_disabled: bool) {
        let level = governor.level();
        let overrun = governor.last_overrun();
        self.consecutive_overruns
            .store(governor.consecutive_overruns(), Ordering::Relaxed);
        self.effects_disabled.store(effects_disabled, Ordering::Relaxed);
        self.degraded_to_mono.store(level.mono(), Ordering::Relaxed);
        self.level.store(level as u8, Ordering::Relaxed);
        if overrun {
            self.total_overruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn count_silenced(&self) {
        self.silenced_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.consecutive_overruns.store(0, Ordering::Relaxed);
        self.effects_disabled.store(false, Ordering::Relaxed);
        self.degraded_to_mono.store(false, Ordering::Relaxed);
        self.level.store(0, Ordering::Relaxed);
        self.total_overruns.store(0, Ordering::Relaxed);
        self.silenced_blocks.store(0, Ordering::Relaxed);
    }
}

/// Measures the cost of one block
///
/// The engine calls `begin` before the pull chain and `end` after it.
pub trait CostMeter: Send {
    fn begin(&mut self);
    fn end(&mut self) -> Duration;
}

/// Wall-clock cost measurement
#[derive(Debug, Default)]
pub struct WallClockMeter {
    started: Option<Instant>,
}

impl CostMeter for WallClockMeter {
    fn begin(&mut self) {
        self.started = Some(Instant::now());
    }

    fn end(&mut self) -> Duration {
        self.started
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}
