//! Transform pipeline.
//!
//! An ordered list of [`Stage`]s built once from the `[[rules]]` config. Each
//! stage pairs a [`Rule`] with a direction and an optional action filter;
//! responses are matched by the action of the request they answer.
//!
//! - `rules`: field fixes, unit conversions, schedule standardization
//! - `block`: blocking predicates

pub mod block;
pub mod rules;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{RuleEntry, RuleKind};
use crate::ocpp::{Action, Direction, Frame};

/// What a rule sees besides the frame.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub direction: Direction,
    /// For responses, the action of the originating request, if known.
    pub request_action: Option<&'a Action>,
    pub now: DateTime<Utc>,
}

/// Result of one rule.
#[derive(Debug)]
pub enum RuleOutcome {
    Applied(Frame),
    /// Rule did not match or could not apply; the frame continues unchanged.
    Skipped,
    /// Drop the frame. `reply` goes back to the sender.
    Blocked { reply: Option<Frame> },
}

/// A single transform.
pub trait Rule: Send + Sync {
    fn kind(&self) -> &'static str;
    fn apply(&self, frame: &Frame, ctx: &RuleContext<'_>) -> RuleOutcome;
}

/// Result of running the whole pipeline over one frame.
#[derive(Debug)]
pub enum PipelineResult {
    Passed {
        frame: Frame,
        /// Names of the rules that changed the frame, in order.
        fired: Vec<String>,
    },
    Blocked {
        rule: String,
        reply: Option<Frame>,
        fired: Vec<String>,
    },
}

/// A configured rule slot.
pub struct Stage {
    name: String,
    enabled: bool,
    direction: Direction,
    actions: Option<Vec<Action>>,
    rule: Box<dyn Rule>,
}

/// Summary of a stage for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    pub name: String,
    pub kind: &'static str,
    pub enabled: bool,
    pub direction: Direction,
    pub actions: Option<Vec<Action>>,
}

impl Stage {
    fn matches(&self, frame: &Frame, ctx: &RuleContext<'_>) -> bool {
        if !self.enabled || self.direction != ctx.direction {
            return false;
        }
        let Some(actions) = &self.actions else {
            return true;
        };
        frame
            .action()
            .or(ctx.request_action)
            .is_some_and(|action| actions.contains(action))
    }
}

/// Default direction and action filter for each rule kind.
fn defaults_for(kind: &RuleKind) -> (Direction, Option<Vec<Action>>) {
    match kind {
        RuleKind::TimestampFix | RuleKind::IdTagTruncate { .. } => {
            (Direction::DeviceToBackend, None)
        }
        RuleKind::MeasurandScale { .. } => (
            Direction::DeviceToBackend,
            Some(vec![Action::MeterValues, Action::StopTransaction]),
        ),
        RuleKind::RateUnitConversion { .. } | RuleKind::ScheduleStandardize { .. } => (
            Direction::BackendToDevice,
            Some(vec![Action::SetChargingProfile]),
        ),
        RuleKind::ConfigurationAllowList { .. } => (
            Direction::BackendToDevice,
            Some(vec![Action::ChangeConfiguration]),
        ),
        RuleKind::BlockAction { .. } => (Direction::DeviceToBackend, None),
    }
}

fn build_rule(kind: &RuleKind) -> Box<dyn Rule> {
    match kind.clone() {
        RuleKind::TimestampFix => Box::new(rules::TimestampFix),
        RuleKind::IdTagTruncate { max_len } => Box::new(rules::IdTagTruncate { max_len }),
        RuleKind::MeasurandScale {
            factor,
            unit,
            measurand,
        } => Box::new(rules::MeasurandScale {
            factor,
            unit,
            measurand,
        }),
        RuleKind::RateUnitConversion {
            from_unit,
            to_unit,
            factor,
            unit_field,
            limit_field,
        } => Box::new(rules::RateUnitConversion {
            from_unit,
            to_unit,
            factor,
            unit_field,
            limit_field,
        }),
        RuleKind::ScheduleStandardize {
            profile_id,
            stack_level,
            purpose,
            profile_kind,
            connector_id,
            number_phases,
            unit_field,
            limit_field,
        } => Box::new(rules::ScheduleStandardize {
            profile_id,
            stack_level,
            purpose,
            profile_kind,
            connector_id,
            number_phases,
            unit_field,
            limit_field,
        }),
        RuleKind::ConfigurationAllowList {
            keys,
            reply,
            reply_status,
        } => Box::new(block::ConfigurationAllowList {
            keys,
            reply_status: reply.then_some(reply_status),
        }),
        RuleKind::BlockAction { reply, reply_error } => {
            Box::new(block::BlockAction { reply, reply_error })
        }
    }
}

/// Ordered rule list shared by all sessions.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn from_config(entries: &[RuleEntry]) -> Self {
        let stages = entries
            .iter()
            .map(|entry| {
                let (direction, actions) = defaults_for(&entry.kind);
                Stage {
                    name: entry.display_name(),
                    enabled: entry.enabled,
                    direction: entry.direction.unwrap_or(direction),
                    actions: entry.actions.clone().or(actions),
                    rule: build_rule(&entry.kind),
                }
            })
            .collect();
        Self { stages }
    }

    /// Run every matching stage in order. A block short-circuits the rest.
    pub fn apply(&self, frame: Frame, ctx: &RuleContext<'_>) -> PipelineResult {
        let mut frame = frame;
        let mut fired = Vec::new();
        for stage in &self.stages {
            if !stage.matches(&frame, ctx) {
                continue;
            }
            match stage.rule.apply(&frame, ctx) {
                RuleOutcome::Applied(next) => {
                    if next != frame {
                        fired.push(stage.name.clone());
                        frame = next;
                    }
                }
                RuleOutcome::Skipped => {}
                RuleOutcome::Blocked { reply } => {
                    return PipelineResult::Blocked {
                        rule: stage.name.clone(),
                        reply,
                        fired,
                    };
                }
            }
        }
        PipelineResult::Passed { frame, fired }
    }

    pub fn describe(&self) -> Vec<StageInfo> {
        self.stages
            .iter()
            .map(|s| StageInfo {
                name: s.name.clone(),
                kind: s.rule.kind(),
                enabled: s.enabled,
                direction: s.direction,
                actions: s.actions.clone(),
            })
            .collect()
    }
}
