//! Blocking predicates. A blocked Call is never forwarded; the optional
//! reply goes back to whoever sent it.

use serde_json::{json, Map, Value};

use super::{Rule, RuleContext, RuleOutcome};
use crate::ocpp::{CallError, Frame};

/// Blocks `ChangeConfiguration` requests for keys outside an allow list.
pub struct ConfigurationAllowList {
    pub keys: Vec<String>,
    /// Status placed in the CallResult sent back; `None` sends nothing.
    pub reply_status: Option<String>,
}

impl Rule for ConfigurationAllowList {
    fn kind(&self) -> &'static str {
        "configuration_allow_list"
    }

    fn apply(&self, frame: &Frame, _ctx: &RuleContext<'_>) -> RuleOutcome {
        let Frame::Call(call) = frame else {
            return RuleOutcome::Skipped;
        };
        let Some(key) = call.payload.get("key").and_then(Value::as_str) else {
            return RuleOutcome::Skipped;
        };
        if self.keys.iter().any(|allowed| allowed == key) {
            return RuleOutcome::Skipped;
        }
        RuleOutcome::Blocked {
            reply: self
                .reply_status
                .as_ref()
                .map(|status| Frame::result(call.id.clone(), json!({ "status": status }))),
        }
    }
}

/// Blocks every Call it is matched against.
pub struct BlockAction {
    pub reply: Option<Value>,
    pub reply_error: Option<String>,
}

impl Rule for BlockAction {
    fn kind(&self) -> &'static str {
        "block_action"
    }

    fn apply(&self, frame: &Frame, _ctx: &RuleContext<'_>) -> RuleOutcome {
        let Frame::Call(call) = frame else {
            return RuleOutcome::Skipped;
        };
        let reply = match (&self.reply, &self.reply_error) {
            (Some(payload), _) => Some(Frame::result(call.id.clone(), payload.clone())),
            (None, Some(code)) => Some(Frame::CallError(CallError {
                id: call.id.clone(),
                code: code.clone(),
                description: format!("{} is not forwarded", call.action),
                details: Value::Object(Map::new()),
            })),
            (None, None) => None,
        };
        RuleOutcome::Blocked { reply }
    }
}
