//! Redmine operations and their scope requirements.
//!
//! Responses are the upstream JSON documents, passed through unchanged.

use std::future::Future;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::RedmineClient;
use crate::operation::{Capability, Operation, OperationCatalog, UpstreamToken, operation_fn};
use crate::scope::{
    SEARCH_PROJECT, ScopeSet, VIEW_ISSUES, VIEW_PROJECT, VIEW_TIME_ENTRIES, scope_set,
};
use crate::{Error, Result};

/// Redmine caps page sizes at 100.
const MAX_LIMIT: u32 = 100;

fn default_limit() -> u32 {
    25
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IssueArgs {
    issue_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchIssuesArgs {
    query: String,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default = "default_true")]
    open_issues_only: bool,
    #[serde(default)]
    offset: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListIssuesArgs {
    #[serde(default)]
    project_id: Option<String>,
    /// User id, or `me`
    #[serde(default)]
    assigned_to_id: Option<String>,
    /// Status id, `open`, `closed` or `*`
    #[serde(default)]
    status_id: Option<String>,
    #[serde(default)]
    tracker_id: Option<u64>,
    /// e.g. `updated_on:desc`
    #[serde(default)]
    sort: Option<String>,
    #[serde(default)]
    offset: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectArgs {
    project_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeEntriesArgs {
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    /// YYYY-MM-DD
    #[serde(default)]
    from_date: Option<String>,
    /// YYYY-MM-DD
    #[serde(default)]
    to_date: Option<String>,
    #[serde(default)]
    offset: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

/// Decode operation arguments; `null` counts as no arguments.
fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T> {
    let args = if args.is_null() {
        Value::Object(Map::new())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| Error::InvalidArguments(e.to_string()))
}

fn page(query: &mut Vec<(&'static str, String)>, offset: u32, limit: u32) {
    query.push(("offset", offset.to_string()));
    query.push(("limit", limit.clamp(1, MAX_LIMIT).to_string()));
}

fn push_opt(query: &mut Vec<(&'static str, String)>, key: &'static str, value: Option<String>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        query.push((key, value));
    }
}

/// Replace the generic 403/404 messages with operation-specific ones.
fn describe(err: Error, forbidden: impl FnOnce() -> String, not_found: impl FnOnce() -> String) -> Error {
    match err {
        Error::UpstreamApi { status: 403, .. } => Error::UpstreamApi {
            status: 403,
            message: forbidden(),
        },
        Error::UpstreamApi { status: 404, .. } => Error::UpstreamApi {
            status: 404,
            message: not_found(),
        },
        other => other,
    }
}

// ── Tools ──

async fn get_issue_details(client: RedmineClient, token: UpstreamToken, args: Value) -> Result<Value> {
    let IssueArgs { issue_id } = parse_args(args)?;
    client
        .get(
            &["issues", format!("{issue_id}.json").as_str()],
            &token,
            &[("include", "journals".to_string())],
        )
        .await
        .map_err(|e| {
            describe(
                e,
                || format!("You do not have permission to view issue #{issue_id}."),
                || format!("Issue #{issue_id} not found in Redmine."),
            )
        })
}

async fn search_issues(client: RedmineClient, token: UpstreamToken, args: Value) -> Result<Value> {
    let args: SearchIssuesArgs = parse_args(args)?;
    if args.query.trim().is_empty() {
        return Err(Error::InvalidArguments("query must not be empty".to_string()));
    }

    let mut query = vec![("q", args.query), ("issues", "1".to_string())];
    if args.open_issues_only {
        query.push(("open_issues", "1".to_string()));
    }
    page(&mut query, args.offset, args.limit);

    let project_id = args.project_id.filter(|p| !p.is_empty());
    let result = match &project_id {
        Some(project) => {
            client
                .get(&["projects", project.as_str(), "search.json"], &token, &query)
                .await
        }
        None => client.get(&["search.json"], &token, &query).await,
    };
    result.map_err(|e| {
        describe(
            e,
            || "You do not have permission to search in this project.".to_string(),
            || format!("Project '{}' not found in Redmine.", project_id.unwrap_or_default()),
        )
    })
}

async fn list_issues(client: RedmineClient, token: UpstreamToken, args: Value) -> Result<Value> {
    let args: ListIssuesArgs = parse_args(args)?;

    let mut query = Vec::new();
    push_opt(&mut query, "project_id", args.project_id);
    push_opt(&mut query, "assigned_to_id", args.assigned_to_id);
    push_opt(&mut query, "status_id", args.status_id);
    push_opt(&mut query, "tracker_id", args.tracker_id.map(|t| t.to_string()));
    push_opt(&mut query, "sort", args.sort);
    page(&mut query, args.offset, args.limit);

    client
        .get(&["issues.json"], &token, &query)
        .await
        .map_err(|e| {
            describe(
                e,
                || "You do not have permission to list issues.".to_string(),
                || "Project not found in Redmine.".to_string(),
            )
        })
}

async fn get_issue_relations(client: RedmineClient, token: UpstreamToken, args: Value) -> Result<Value> {
    let IssueArgs { issue_id } = parse_args(args)?;
    client
        .get(&["issues", issue_id.to_string().as_str(), "relations.json"], &token, &[])
        .await
        .map_err(|e| {
            describe(
                e,
                || format!("You do not have permission to view issue #{issue_id} relations."),
                || format!("Issue #{issue_id} not found in Redmine."),
            )
        })
}

async fn get_project_details(client: RedmineClient, token: UpstreamToken, args: Value) -> Result<Value> {
    let ProjectArgs { project_id } = parse_args(args)?;
    client
        .get(
            &["projects", format!("{project_id}.json").as_str()],
            &token,
            &[("include", "trackers,issue_categories,enabled_modules".to_string())],
        )
        .await
        .map_err(|e| {
            describe(
                e,
                || format!("You do not have permission to view project '{project_id}'."),
                || format!("Project '{project_id}' not found in Redmine."),
            )
        })
}

async fn get_project_versions(client: RedmineClient, token: UpstreamToken, args: Value) -> Result<Value> {
    let ProjectArgs { project_id } = parse_args(args)?;
    client
        .get(&["projects", project_id.as_str(), "versions.json"], &token, &[])
        .await
        .map_err(|e| {
            describe(
                e,
                || format!("You do not have permission to view project '{project_id}' versions."),
                || format!("Project '{project_id}' not found in Redmine."),
            )
        })
}

async fn list_time_entries(client: RedmineClient, token: UpstreamToken, args: Value) -> Result<Value> {
    let args: TimeEntriesArgs = parse_args(args)?;

    let mut query = Vec::new();
    push_opt(&mut query, "project_id", args.project_id);
    push_opt(&mut query, "user_id", args.user_id);
    push_opt(&mut query, "from", args.from_date);
    push_opt(&mut query, "to", args.to_date);
    page(&mut query, args.offset, args.limit);

    client
        .get(&["time_entries.json"], &token, &query)
        .await
        .map_err(|e| {
            describe(
                e,
                || "You do not have permission to view time entries.".to_string(),
                || "Project not found in Redmine.".to_string(),
            )
        })
}

// ── Resources ──

async fn active_projects(client: RedmineClient, token: UpstreamToken, args: Value) -> Result<Value> {
    let _: Map<String, Value> = parse_args(args)?;
    client
        .get(&["projects.json"], &token, &[("status", "1".to_string())])
        .await
}

async fn trackers(client: RedmineClient, token: UpstreamToken, args: Value) -> Result<Value> {
    let _: Map<String, Value> = parse_args(args)?;
    client.get(&["trackers.json"], &token, &[]).await
}

async fn current_user(client: RedmineClient, token: UpstreamToken, args: Value) -> Result<Value> {
    let _: Map<String, Value> = parse_args(args)?;
    client.get(&["users", "current.json"], &token, &[]).await
}

async fn issue_statuses(client: RedmineClient, token: UpstreamToken, args: Value) -> Result<Value> {
    let _: Map<String, Value> = parse_args(args)?;
    client.get(&["issue_statuses.json"], &token, &[]).await
}

async fn issue_priorities(client: RedmineClient, token: UpstreamToken, args: Value) -> Result<Value> {
    let _: Map<String, Value> = parse_args(args)?;
    client
        .get(&["enumerations", "issue_priorities.json"], &token, &[])
        .await
}

fn handler<F, Fut>(client: &RedmineClient, f: F) -> Arc<dyn Operation>
where
    F: Fn(RedmineClient, UpstreamToken, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    let client = client.clone();
    operation_fn(move |token, args| f(client.clone(), token, args))
}

/// Register every Redmine operation on `catalog`.
pub fn register_operations(catalog: &mut OperationCatalog, client: &RedmineClient) -> Result<()> {
    let tools = [
        Capability::tool(
            "get_issue_details",
            "Fetch a Redmine issue including description, custom fields and journal history.",
            scope_set([VIEW_ISSUES]),
            handler(client, get_issue_details),
        ),
        Capability::tool(
            "search_issues",
            "Full-text search over issue titles and descriptions, optionally within one project.",
            scope_set([VIEW_ISSUES, SEARCH_PROJECT]),
            handler(client, search_issues),
        ),
        Capability::tool(
            "list_issues",
            "List issues filtered by project, assignee, status or tracker.",
            scope_set([VIEW_ISSUES]),
            handler(client, list_issues),
        ),
        Capability::tool(
            "get_issue_relations",
            "Relations of an issue (blocks, blocked by, related, ...).",
            scope_set([VIEW_ISSUES]),
            handler(client, get_issue_relations),
        ),
        Capability::tool(
            "get_project_details",
            "Project details including trackers, issue categories and enabled modules.",
            scope_set([VIEW_PROJECT]),
            handler(client, get_project_details),
        ),
        Capability::tool(
            "get_project_versions",
            "Versions (milestones, releases) of a project.",
            scope_set([VIEW_PROJECT]),
            handler(client, get_project_versions),
        ),
        Capability::tool(
            "list_time_entries",
            "List time entries filtered by project, user and date range.",
            scope_set([VIEW_TIME_ENTRIES]),
            handler(client, list_time_entries),
        ),
    ];

    let resources = [
        Capability::resource(
            "active_projects",
            "Active projects visible to the user.",
            scope_set([VIEW_PROJECT]),
            handler(client, active_projects),
        ),
        Capability::resource(
            "trackers",
            "Issue trackers.",
            scope_set([VIEW_PROJECT]),
            handler(client, trackers),
        ),
        Capability::resource(
            "current_user",
            "The authenticated Redmine user.",
            ScopeSet::new(),
            handler(client, current_user),
        ),
        Capability::resource(
            "issue_statuses",
            "Issue statuses.",
            scope_set([VIEW_ISSUES]),
            handler(client, issue_statuses),
        ),
        Capability::resource(
            "issue_priorities",
            "Issue priorities.",
            scope_set([VIEW_ISSUES]),
            handler(client, issue_priorities),
        ),
    ];

    for capability in tools.into_iter().chain(resources) {
        catalog.register(capability)?;
    }
    Ok(())
}
