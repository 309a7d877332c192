use async_trait::async_trait;
use serde_json::{Value, json};

use super::{ParamKind, ParamSpec, Tool, ToolContext, ToolOutput, ToolSpec};

pub struct MemorySearchTool;

const MAX_K: u64 = 20;

#[async_trait]
impl Tool for MemorySearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "memory_search".into(),
            description: "Search earlier messages of this conversation for related content.".into(),
            parameters: vec![
                ParamSpec::required("query", ParamKind::String, "What to look for"),
                ParamSpec::optional("k", ParamKind::Integer, "Maximum number of matches", Some(json!(5))),
            ],
        }
    }

    async fn run(&self, ctx: ToolContext<'_>, args: Value) -> anyhow::Result<ToolOutput> {
        let query = args.get("query").and_then(|v| v.as_str()).ok_or_else(|| anyhow::anyhow!("missing query"))?;
        let k = args.get("k").and_then(|v| v.as_u64()).unwrap_or(5).min(MAX_K) as usize;
        let embedding = ctx.embedder.embed(query);
        let turns = ctx.memory.search(ctx.session_id, &embedding, k).await?;
        let items: Vec<Value> = turns
            .iter()
            .map(|t| json!({ "role": t.role.as_str(), "content": t.text(), "timestamp": t.timestamp.to_rfc3339() }))
            .collect();
        Ok(ToolOutput { summary: format!("{} matches", items.len()), data: Some(Value::Array(items)) })
    }
}
