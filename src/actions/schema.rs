//! 强类型动作：用 schemars 从参数类型自动生成 Schema
//!
//! FnAction 把一个接收强类型参数的异步闭包包装成 Action；参数校验即反序列化到该类型，
//! 形状不符时在执行前报错，不做任何隐式转换。

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::actions::{Action, ActionOutput};

/// 由闭包构造的动作，参数类型 A 决定 Schema 与校验规则
pub struct FnAction<A, F> {
    name: String,
    description: String,
    schema: Value,
    handler: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F, Fut> FnAction<A, F>
where
    A: DeserializeOwned + JsonSchema,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<ActionOutput, String>>,
{
    pub fn new(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self {
        let schema = serde_json::to_value(schema_for!(A))
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler,
            _args: PhantomData,
        }
    }
}

fn decode<A: DeserializeOwned>(arguments: &Map<String, Value>) -> Result<A, String> {
    serde_json::from_value(Value::Object(arguments.clone())).map_err(|e| e.to_string())
}

#[async_trait]
impl<A, F, Fut> Action for FnAction<A, F>
where
    A: DeserializeOwned + JsonSchema + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionOutput, String>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn validate(&self, arguments: &Map<String, Value>) -> Result<(), String> {
        decode::<A>(arguments).map(|_| ())
    }

    async fn execute(&self, arguments: Map<String, Value>) -> Result<ActionOutput, String> {
        let args: A = decode(&arguments)?;
        (self.handler)(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionRegistry;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct Quote {
        units: u32,
        destination_zip: String,
    }

    fn quote_action() -> impl Action {
        FnAction::new("quote", "Quote shipping cost", |q: Quote| async move {
            Ok(ActionOutput::from(format!(
                "{} units to {} cost {}",
                q.units,
                q.destination_zip,
                q.units * 2
            )))
        })
    }

    #[test]
    fn test_schema_lists_typed_fields() {
        let action = quote_action();
        let schema = action.parameters_schema();
        let props = schema["properties"].as_object().unwrap();
        assert!(props.contains_key("units"));
        assert!(props.contains_key("destination_zip"));
    }

    #[tokio::test]
    async fn test_typed_arguments_are_not_coerced() {
        let mut registry = ActionRegistry::new();
        registry.register(quote_action(), false);

        let ok = registry
            .invoke(
                "quote",
                json!({"units": 10, "destination_zip": "07001"}).as_object().cloned().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.to_string(), "10 units to 07001 cost 20");

        let bad = registry
            .validate(
                "quote",
                json!({"units": "10", "destination_zip": "07001"}).as_object().unwrap(),
            )
            .unwrap_err();
        assert!(matches!(bad, crate::actions::ActionError::InvalidArguments { .. }));
    }
}
