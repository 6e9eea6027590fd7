//! 原始回复归一化
//!
//! 支持的形状：
//! - `{"type": "finish", "summary": "..."}` / `{"type": "propose_action", "name": "...", "arguments": {...}}`
//! - `{"tool": "...", "args": {...}}`
//! - `{"tool_calls": [...]}`，元素为结构化 `{"name", "args"}` 或嵌套 `{"function": {"name", "arguments"}}`，
//!   后者的 arguments 可能是 JSON 字符串
//! - 以上任一包在 ```json 代码块中
//!
//! 没有 JSON 对象的纯文本视为 Finish；有 JSON 但形状不认识则是 Malformed，不会被当作完成。

use serde_json::{Map, Value};

use crate::planner::{Decision, PlannerError};

/// 解析 LLM 输出为 Decision
pub fn parse_decision(output: &str) -> Result<Decision, PlannerError> {
    let trimmed = output.trim();
    let Some((json_str, prose)) = extract_json(trimmed) else {
        return Ok(Decision::Finish {
            summary: non_empty(trimmed),
        });
    };
    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| PlannerError::Malformed(format!("{e}: {json_str}")))?;
    normalize(value, non_empty(prose))
}

/// 返回 (JSON 片段, JSON 之前的说明文字)
fn extract_json(text: &str) -> Option<(&str, &str)> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        let body = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        return Some((body.trim(), &text[..start]));
    }
    let start = text.find('{')?;
    match text.rfind('}') {
        Some(end) if end > start => Some((&text[start..=end], &text[..start])),
        _ => Some((&text[start..], &text[..start])),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn normalize(value: Value, prose: Option<String>) -> Result<Decision, PlannerError> {
    let obj = match value {
        Value::Object(obj) => obj,
        other => {
            return Err(PlannerError::Malformed(format!(
                "expected a JSON object, got {other}"
            )))
        }
    };
    let rationale = str_field(&obj, "rationale")
        .or_else(|| str_field(&obj, "content"))
        .and_then(non_empty)
        .or(prose);

    if let Some(kind) = str_field(&obj, "type") {
        return match kind {
            "finish" => Ok(Decision::Finish {
                summary: str_field(&obj, "summary").and_then(non_empty).or(rationale),
            }),
            "propose_action" => {
                let name = required_name(str_field(&obj, "name"))?;
                let arguments = coerce_arguments(obj.get("arguments"))?;
                Ok(Decision::ProposeAction {
                    name,
                    arguments,
                    rationale,
                })
            }
            other => Err(PlannerError::Malformed(format!("unknown decision type `{other}`"))),
        };
    }

    if let Some(calls) = obj.get("tool_calls") {
        let calls = calls
            .as_array()
            .ok_or_else(|| PlannerError::Malformed("tool_calls must be an array".to_string()))?;
        return match calls.first() {
            None => Ok(Decision::Finish { summary: rationale }),
            Some(Value::Object(call)) => call_from(call, rationale),
            Some(other) => Err(PlannerError::Malformed(format!(
                "tool call must be an object, got {other}"
            ))),
        };
    }

    if let Some(tool) = obj.get("tool") {
        let name = match tool {
            Value::String(name) => name.trim(),
            Value::Null => "",
            other => {
                return Err(PlannerError::Malformed(format!(
                    "tool must be a string, got {other}"
                )))
            }
        };
        if name.is_empty() {
            return Ok(Decision::Finish { summary: rationale });
        }
        let arguments = coerce_arguments(obj.get("args").or_else(|| obj.get("arguments")))?;
        return Ok(Decision::ProposeAction {
            name: name.to_string(),
            arguments,
            rationale,
        });
    }

    if obj.contains_key("function") || obj.contains_key("name") {
        return call_from(&obj, rationale);
    }

    Err(PlannerError::Malformed(format!(
        "unrecognized response shape: {}",
        Value::Object(obj)
    )))
}

/// 单个工具调用：嵌套 function 形式或结构化 name/args 形式
fn call_from(call: &Map<String, Value>, rationale: Option<String>) -> Result<Decision, PlannerError> {
    let (name, raw_args) = match call.get("function") {
        Some(Value::Object(function)) => (
            str_field(function, "name"),
            function.get("arguments").or_else(|| function.get("args")),
        ),
        Some(other) => {
            return Err(PlannerError::Malformed(format!(
                "function must be an object, got {other}"
            )))
        }
        None => (
            str_field(call, "name"),
            call.get("args").or_else(|| call.get("arguments")),
        ),
    };
    Ok(Decision::ProposeAction {
        name: required_name(name)?,
        arguments: coerce_arguments(raw_args)?,
        rationale,
    })
}

fn required_name(name: Option<&str>) -> Result<String, PlannerError> {
    match name.map(str::trim) {
        Some(n) if !n.is_empty() => Ok(n.to_string()),
        _ => Err(PlannerError::Malformed("tool call without a name".to_string())),
    }
}

/// 参数必须是对象；JSON 字符串形式先解码
fn coerce_arguments(raw: Option<&Value>) -> Result<Map<String, Value>, PlannerError> {
    match raw {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(Map::new()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(PlannerError::Malformed(format!(
                "arguments must decode to an object, got {other}"
            ))),
            Err(e) => Err(PlannerError::Malformed(format!("arguments are not JSON: {e}"))),
        },
        Some(other) => Err(PlannerError::Malformed(format!(
            "arguments must be an object, got {other}"
        ))),
    }
}
