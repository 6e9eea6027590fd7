//! 动作错误的处置策略
//!
//! 根据 ActionError 类型与动作是否 gated 返回 Disposition，供驱动循环决定继续还是终止。
//! 不做任何静默重试：继续意味着错误已写入历史，由 Planner 决定下一步。

use serde_json::{Map, Value};

use crate::actions::ActionError;
use crate::core::state::FailureReason;

/// 处置结果
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// 错误已记录，驱动循环继续
    Continue,
    /// 运行以该原因失败
    Fail(FailureReason),
    /// 错误已记录；若已没有后续规划轮次，运行以该原因失败
    FailIfFinal(FailureReason),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryPolicy;

impl RecoveryPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn on_action_error(
        &self,
        err: &ActionError,
        gated: bool,
        arguments: &Map<String, Value>,
    ) -> Disposition {
        match err {
            ActionError::Unknown(name) => {
                Disposition::Fail(FailureReason::UnknownAction { name: name.clone() })
            }
            ActionError::InvalidArguments { action, message } => {
                Disposition::Fail(FailureReason::ValidationError {
                    action: action.clone(),
                    arguments: arguments.clone(),
                    message: message.clone(),
                })
            }
            // gated 动作失败后 Planner 仍可再走一轮；轮次用尽才算运行失败
            ActionError::Failed { action, message } if gated => {
                Disposition::FailIfFinal(FailureReason::ActionFailed {
                    action: action.clone(),
                    message: message.clone(),
                })
            }
            ActionError::DeadlineExceeded { action, secs } if gated => {
                Disposition::FailIfFinal(FailureReason::ActionFailed {
                    action: action.clone(),
                    message: format!("deadline of {secs}s exceeded"),
                })
            }
            ActionError::Failed { .. } | ActionError::DeadlineExceeded { .. } => {
                Disposition::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> ActionError {
        ActionError::Failed {
            action: "check_weather".into(),
            message: "upstream 503".into(),
        }
    }

    #[test]
    fn test_ungated_business_failure_continues() {
        let policy = RecoveryPolicy::new();
        assert_eq!(policy.on_action_error(&failed(), false, &Map::new()), Disposition::Continue);

        let timeout = ActionError::DeadlineExceeded {
            action: "check_weather".into(),
            secs: 5,
        };
        assert_eq!(policy.on_action_error(&timeout, false, &Map::new()), Disposition::Continue);
    }

    #[test]
    fn test_gated_failure_defers_to_planner() {
        let policy = RecoveryPolicy::new();
        match policy.on_action_error(&failed(), true, &Map::new()) {
            Disposition::FailIfFinal(FailureReason::ActionFailed { action, message }) => {
                assert_eq!(action, "check_weather");
                assert!(message.contains("upstream 503"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_invalid_arguments_fail_with_arguments() {
        let policy = RecoveryPolicy::new();
        let mut args = Map::new();
        args.insert("units".into(), Value::String("many".into()));
        let err = ActionError::InvalidArguments {
            action: "quote".into(),
            message: "units must be integer".into(),
        };
        match policy.on_action_error(&err, false, &args) {
            Disposition::Fail(FailureReason::ValidationError { arguments, .. }) => {
                assert_eq!(arguments, args)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_action_fails() {
        let policy = RecoveryPolicy::new();
        assert_eq!(
            policy.on_action_error(&ActionError::Unknown("teleport".into()), false, &Map::new()),
            Disposition::Fail(FailureReason::UnknownAction {
                name: "teleport".into()
            })
        );
    }
}
