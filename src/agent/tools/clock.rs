use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::{Value, json};

use super::{ParamKind, ParamSpec, Tool, ToolContext, ToolOutput, ToolSpec};

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "current_time".into(),
            description: "Current date and time, useful for scheduling questions.".into(),
            parameters: vec![ParamSpec::optional(
                "timezone_offset_minutes",
                ParamKind::Integer,
                "Offset from UTC in minutes, e.g. 120 for UTC+2",
                Some(json!(0)),
            )],
        }
    }

    async fn run(&self, _ctx: ToolContext<'_>, args: Value) -> anyhow::Result<ToolOutput> {
        let minutes = args.get("timezone_offset_minutes").and_then(|v| v.as_i64()).unwrap_or(0);
        let offset = i32::try_from(minutes.saturating_mul(60))
            .ok()
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| anyhow::anyhow!("offset out of range: {} minutes", minutes))?;
        let now = Utc::now().with_timezone(&offset);
        Ok(ToolOutput {
            summary: now.to_rfc3339(),
            data: Some(json!({ "rfc3339": now.to_rfc3339(), "weekday": now.format("%A").to_string() })),
        })
    }
}
