use serde_json::{Value, json};

struct ToolDef {
    name: &'static str,
    description: &'static str,
    schema: fn() -> Value,
}

fn user_context_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "user_id": {"type": "string"},
            "session_id": {"type": "string"}
        },
        "required": ["user_id", "session_id"]
    })
}

fn criteria_properties() -> Value {
    json!({
        "category": {"type": "string", "enum": ["high", "medium", "low"]},
        "year": {"type": "integer"},
        "year_range": {
            "type": "object",
            "properties": {"from": {"type": "integer"}, "to": {"type": "integer"}}
        },
        "size_range": {
            "type": "object",
            "properties": {"min": {"type": "integer"}, "max": {"type": "integer"}}
        },
        "sender": {"type": "string"},
        "labels": {"type": "array", "items": {"type": "string"}},
        "has_attachments": {"type": "boolean"},
        "archived": {"type": "boolean"}
    })
}

static TOOLS: &[ToolDef] = &[
    ToolDef {
        name: "authenticate",
        description: "Open a session. The only tool exempt from user_context.",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "user_id": {"type": "string"},
                    "scopes": {"type": "array", "items": {"type": "string"}}
                }
            })
        },
    },
    ToolDef {
        name: "list_emails",
        description: "List indexed emails with optional category/year/size/archived filters.",
        schema: || {
            let mut properties = criteria_properties();
            properties["limit"] = json!({"type": "integer"});
            properties["offset"] = json!({"type": "integer"});
            properties["user_context"] = user_context_schema();
            json!({"type": "object", "properties": properties, "required": ["user_context"]})
        },
    },
    ToolDef {
        name: "search_emails",
        description: "Search the email index by text and structured criteria.",
        schema: || {
            let mut properties = criteria_properties();
            properties["query"] = json!({"type": "string"});
            properties["limit"] = json!({"type": "integer"});
            properties["user_context"] = user_context_schema();
            json!({"type": "object", "properties": properties, "required": ["user_context"]})
        },
    },
    ToolDef {
        name: "categorize_emails",
        description: "Submit an asynchronous categorization job; returns a job id.",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "force_refresh": {"type": "boolean"},
                    "year": {"type": "integer"},
                    "user_context": user_context_schema()
                },
                "required": ["user_context"]
            })
        },
    },
    ToolDef {
        name: "get_email_stats",
        description: "Aggregate counts grouped by category, year, size, or archived state.",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "group_by": {"type": "string", "enum": ["category", "year", "size", "archived", "all"]},
                    "include_archived": {"type": "boolean"},
                    "user_context": user_context_schema()
                },
                "required": ["user_context"]
            })
        },
    },
    ToolDef {
        name: "archive_emails",
        description: "Archive matching emails via the vendor or an export location.",
        schema: || {
            let mut properties = criteria_properties();
            properties["method"] = json!({"type": "string", "enum": ["gmail", "export"]});
            properties["export_format"] = json!({"type": "string"});
            properties["dry_run"] = json!({"type": "boolean"});
            properties["user_context"] = user_context_schema();
            json!({"type": "object", "properties": properties, "required": ["user_context"]})
        },
    },
    ToolDef {
        name: "delete_emails",
        description: "Delete matching emails. Requires confirm=true or dry_run=true.",
        schema: || {
            let mut properties = criteria_properties();
            properties["confirm"] = json!({"type": "boolean"});
            properties["dry_run"] = json!({"type": "boolean"});
            properties["user_context"] = user_context_schema();
            json!({"type": "object", "properties": properties, "required": ["user_context"]})
        },
    },
    ToolDef {
        name: "get_job_status",
        description: "Fetch one job's status, progress, results, and errors.",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "user_context": user_context_schema()
                },
                "required": ["id", "user_context"]
            })
        },
    },
    ToolDef {
        name: "list_jobs",
        description: "List submitted jobs with optional type/status filters and paging.",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "job_type": {"type": "string"},
                    "status": {"type": "string", "enum": ["pending", "in_progress", "completed", "failed"]},
                    "limit": {"type": "integer"},
                    "offset": {"type": "integer"},
                    "user_context": user_context_schema()
                },
                "required": ["user_context"]
            })
        },
    },
    ToolDef {
        name: "create_cleanup_policy",
        description: "Create a retention policy. The safety block is mandatory.",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "policy": {"type": "object"},
                    "user_context": user_context_schema()
                },
                "required": ["policy", "user_context"]
            })
        },
    },
    ToolDef {
        name: "update_cleanup_policy",
        description: "Merge updates into an existing cleanup policy.",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "policy_id": {"type": "string"},
                    "updates": {"type": "object"},
                    "user_context": user_context_schema()
                },
                "required": ["policy_id", "updates", "user_context"]
            })
        },
    },
    ToolDef {
        name: "list_cleanup_policies",
        description: "List the caller's cleanup policies.",
        schema: || {
            json!({
                "type": "object",
                "properties": {"user_context": user_context_schema()},
                "required": ["user_context"]
            })
        },
    },
    ToolDef {
        name: "delete_cleanup_policy",
        description: "Delete a cleanup policy and its schedules.",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "policy_id": {"type": "string"},
                    "user_context": user_context_schema()
                },
                "required": ["policy_id", "user_context"]
            })
        },
    },
    ToolDef {
        name: "trigger_cleanup",
        description: "Preview (dry_run) or submit a cleanup run for a policy.",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "policy_id": {"type": "string"},
                    "dry_run": {"type": "boolean"},
                    "max_emails": {"type": "integer"},
                    "force": {"type": "boolean"},
                    "user_context": user_context_schema()
                },
                "required": ["policy_id", "user_context"]
            })
        },
    },
    ToolDef {
        name: "create_cleanup_schedule",
        description: "Attach a daily/weekly/monthly/interval/cron firing rule to a policy.",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "type": {"type": "string", "enum": ["daily", "weekly", "monthly", "interval", "cron"]},
                    "expression": {"type": "string"},
                    "policy_id": {"type": "string"},
                    "enabled": {"type": "boolean"},
                    "user_context": user_context_schema()
                },
                "required": ["type", "expression", "policy_id", "user_context"]
            })
        },
    },
    ToolDef {
        name: "update_cleanup_schedule",
        description: "Enable or disable an existing cleanup schedule.",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "schedule_id": {"type": "string"},
                    "enabled": {"type": "boolean"},
                    "user_context": user_context_schema()
                },
                "required": ["schedule_id", "enabled", "user_context"]
            })
        },
    },
    ToolDef {
        name: "list_cleanup_schedules",
        description: "List the caller's cleanup schedules.",
        schema: || {
            json!({
                "type": "object",
                "properties": {"user_context": user_context_schema()},
                "required": ["user_context"]
            })
        },
    },
    ToolDef {
        name: "get_cleanup_recommendations",
        description: "Propose policy templates from the current email distribution.",
        schema: || {
            json!({
                "type": "object",
                "properties": {"user_context": user_context_schema()},
                "required": ["user_context"]
            })
        },
    },
    ToolDef {
        name: "save_search",
        description: "Save a named search; re-running it equals searching with its criteria.",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "criteria": {"type": "object"},
                    "user_context": user_context_schema()
                },
                "required": ["name", "criteria", "user_context"]
            })
        },
    },
    ToolDef {
        name: "list_saved_searches",
        description: "List the caller's saved searches.",
        schema: || {
            json!({
                "type": "object",
                "properties": {"user_context": user_context_schema()},
                "required": ["user_context"]
            })
        },
    },
];

/// Payload for `tools/list`.
pub fn definitions() -> Value {
    let tools: Vec<Value> = TOOLS
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": (tool.schema)(),
            })
        })
        .collect();
    json!({"tools": tools})
}

pub fn is_known_tool(name: &str) -> bool {
    TOOLS.iter().any(|tool| tool.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_lists_every_tool_once() {
        let listed = definitions();
        let tools = listed["tools"].as_array().expect("array");
        assert_eq!(tools.len(), TOOLS.len());

        let mut names: Vec<&str> = tools
            .iter()
            .map(|tool| tool["name"].as_str().expect("name"))
            .collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(names.len(), before, "no duplicate tool names");

        assert!(is_known_tool("delete_emails"));
        assert!(!is_known_tool("format_disk"));
    }

    #[test]
    fn non_exempt_tools_require_user_context() {
        let listed = definitions();
        for tool in listed["tools"].as_array().expect("array") {
            let name = tool["name"].as_str().expect("name");
            if name == "authenticate" {
                continue;
            }
            let required = tool["inputSchema"]["required"].as_array().expect("required");
            assert!(
                required.iter().any(|v| v == "user_context"),
                "{name} must require user_context"
            );
        }
    }
}
