//! MCP JSON-RPC protocol bridge over the warehouse.
//!
//! Exposes the database to MCP clients through a fixed surface:
//!
//! * **Tools**: `list_tables` and `read_query`.
//! * **Resources**: `schema://staging/tables`, the staging schema reference.
//! * **Prompts**: `setup-rust-crates-analytics`, a canned context prompt.
//!
//! Every query runs on a read-only pool, so the server can stay up while
//! `cwh backfill` holds the writer connection.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use futures::TryStreamExt;
use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Sqlite, SqlitePool, TypeInfo, ValueRef};

use crate::db::{self, Namespace};

pub const SCHEMA_RESOURCE_URI: &str = "schema://staging/tables";
pub const SETUP_PROMPT: &str = "setup-rust-crates-analytics";

/// Rows returned by one `read_query` call before the result is cut off.
pub const MAX_RESULT_ROWS: usize = 1_000;

const SETUP_PROMPT_TEXT: &str = "\
You are exploring a data warehouse of the Rust package registry, crates.io.

**Data**
- The staging tables hold the latest crates.io dump plus the daily download archives.
- Find the covered date range yourself with read_query (MIN/MAX of stg_version_downloads.date).
- Expect roughly 200k crates, close to 2M versions and billions of download records.

**Key tables**
- stg_crates: packages
- stg_versions: published releases of each crate
- stg_version_downloads: daily downloads per version (the fact table)
- stg_dependencies: dependencies declared by each version
- stg_categories, stg_keywords: metadata

**Tools**
- list_tables: every table in the raw, staging and marts namespaces
- read_query: run a single SELECT (or WITH ... SELECT) statement

**Resources**
- schema://staging/tables: column definitions for the staging tables

Read the schema resource first so you know the columns and relationships before
writing queries. Only read-only queries are accepted; anything else is rejected.

Help analyze the Rust ecosystem: suggest interesting questions, write efficient
SQLite queries and explain what the results mean.";

/// Serves the warehouse over MCP.
///
/// Cloned per session; the pool is shared.
#[derive(Clone)]
pub struct McpBridge {
    pool: SqlitePool,
    schema_dir: Option<Arc<PathBuf>>,
}

impl McpBridge {
    pub fn new(pool: SqlitePool, schema_dir: Option<PathBuf>) -> Self {
        Self {
            pool,
            schema_dir: schema_dir.map(Arc::new),
        }
    }

    fn tools() -> Vec<Tool> {
        vec![
            Self::tool(
                "list_tables",
                "List all tables in the raw, staging and marts namespaces",
                serde_json::json!({ "type": "object", "properties": {} }),
            ),
            Self::tool(
                "read_query",
                "Execute a read-only SQL query against the crates.io warehouse",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "sql": {
                            "type": "string",
                            "description": "SELECT query to execute"
                        }
                    },
                    "required": ["sql"]
                }),
            ),
        ]
    }

    fn tool(name: &'static str, description: &'static str, schema: serde_json::Value) -> Tool {
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> = match schema {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };

        Tool {
            name: Cow::Borrowed(name),
            title: None,
            description: Some(Cow::Borrowed(description)),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(true)),
            execution: None,
            icons: None,
            meta: None,
        }
    }

    /// Markdown listing of every namespaced table.
    pub async fn list_tables(&self) -> Result<String, sqlx::Error> {
        let tables = db::warehouse_tables(&self.pool).await?;
        let rows: Vec<Vec<String>> = tables
            .into_iter()
            .map(|(ns, name)| vec![ns.name().to_string(), name])
            .collect();
        Ok(format!(
            "Available tables:\n\n{}",
            markdown_table(&["table_schema", "table_name"], &rows)
        ))
    }

    /// Run `sql` after the read-only check and render the result as markdown.
    pub async fn read_query(&self, sql: &str) -> Result<String, String> {
        check_read_only(sql)?;

        let mut stream = sqlx::query(sql).fetch(&self.pool);
        let mut rows = Vec::new();
        let mut truncated = false;
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| format!("Error: {}", e))?
        {
            if rows.len() == MAX_RESULT_ROWS {
                truncated = true;
                break;
            }
            rows.push(row);
        }
        drop(stream);

        let Some(first) = rows.first() else {
            return Ok("(no rows)".to_string());
        };
        let headers: Vec<String> = first
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();

        let mut cells = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = (0..headers.len())
                .map(|i| cell_text(row, i))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("Error: {}", e))?;
            cells.push(values);
        }

        let mut out = markdown_table(&header_refs, &cells);
        if truncated {
            out.push_str(&format!(
                "\n(first {} rows shown; more rows available)\n",
                MAX_RESULT_ROWS
            ));
        }
        Ok(out)
    }

    /// The staging schema reference served as a resource.
    ///
    /// Uses the `*.yml` files in the configured schema directory when there
    /// is one, otherwise describes each `stg_` table from the database.
    pub async fn schema_text(&self) -> anyhow::Result<String> {
        if let Some(dir) = &self.schema_dir {
            let mut files: Vec<PathBuf> = std::fs::read_dir(dir.as_path())?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "yml"))
                .collect();
            files.sort();

            let mut parts = Vec::with_capacity(files.len());
            for file in files {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let body = std::fs::read_to_string(&file)?;
                parts.push(format!("# {}\n{}\n", name, body));
            }
            return Ok(parts.join("\n"));
        }

        let mut out = String::new();
        for (ns, table) in db::warehouse_tables(&self.pool).await? {
            if ns != Namespace::Staging {
                continue;
            }
            let columns: Vec<(String, String, i64)> = sqlx::query_as(
                "SELECT name, type, \"notnull\" FROM pragma_table_info(?) ORDER BY cid",
            )
            .bind(&table)
            .fetch_all(&self.pool)
            .await?;

            out.push_str(&format!("# {}\n", table));
            for (name, ty, not_null) in columns {
                let ty = if ty.is_empty() { "ANY".to_string() } else { ty };
                let null = if not_null != 0 { " NOT NULL" } else { "" };
                out.push_str(&format!("  - {}: {}{}\n", name, ty, null));
            }
            out.push('\n');
        }
        Ok(out)
    }
}

/// Accept only statements whose first keyword is `SELECT` or `WITH`.
pub fn check_read_only(sql: &str) -> Result<(), String> {
    let keyword: String = sql
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    match keyword.as_str() {
        "SELECT" | "WITH" => Ok(()),
        _ => Err("Error: Only SELECT queries are allowed".to_string()),
    }
}

fn cell_text(row: &SqliteRow, idx: usize) -> Result<String, sqlx::Error> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok("NULL".to_string());
    }
    let type_name = raw.type_info().name().to_string();
    let text = match type_name.as_str() {
        "INTEGER" => <i64 as Decode<Sqlite>>::decode(raw).map(|v| v.to_string()),
        "REAL" => <f64 as Decode<Sqlite>>::decode(raw).map(|v| v.to_string()),
        "BLOB" => <Vec<u8> as Decode<Sqlite>>::decode(raw).map(|b| format!("<{} bytes>", b.len())),
        _ => <String as Decode<Sqlite>>::decode(raw),
    };
    text.map_err(sqlx::Error::Decode)
}

/// GitHub-style markdown table.
pub fn markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let escape = |s: &str| s.replace('|', "\\|").replace('\n', " ");
    let mut out = String::new();
    out.push_str("| ");
    out.push_str(
        &headers
            .iter()
            .map(|h| escape(h))
            .collect::<Vec<_>>()
            .join(" | "),
    );
    out.push_str(" |\n|");
    out.push_str(&vec!["---|"; headers.len()].concat());
    out.push('\n');
    for row in rows {
        out.push_str("| ");
        out.push_str(&row.iter().map(|c| escape(c)).collect::<Vec<_>>().join(" | "));
        out.push_str(" |\n");
    }
    out
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .enable_prompts()
                .build(),
            server_info: Implementation {
                name: "crates-warehouse".to_string(),
                title: Some("Crates Warehouse".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Read-only SQL access to a crates.io data warehouse. \
                 Use list_tables to see what is loaded, read the schema://staging/tables \
                 resource for column definitions, then run SELECT statements with read_query."
                    .to_string(),
            ),
        }
    }

    // ── Tools ────────────────────────────────────────────────────────────

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult::with_all_items(Self::tools())))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        Self::tools().into_iter().find(|t| t.name == name)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match &*request.name {
            "list_tables" => match self.list_tables().await {
                Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
                Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                    "Error: {}",
                    e
                ))])),
            },
            "read_query" => {
                let sql = request
                    .arguments
                    .as_ref()
                    .and_then(|args| args.get("sql"))
                    .and_then(|v| v.as_str());
                let Some(sql) = sql else {
                    return Ok(CallToolResult::error(vec![Content::text(
                        "Error: missing required argument 'sql'",
                    )]));
                };
                match self.read_query(sql).await {
                    Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
                    Err(msg) => Ok(CallToolResult::error(vec![Content::text(msg)])),
                }
            }
            other => Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", other),
                None,
            )),
        }
    }

    // ── Resources ────────────────────────────────────────────────────────

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        let mut resource = RawResource::new(SCHEMA_RESOURCE_URI, "Staging Schema Definition");
        resource.description =
            Some("Column definitions and relationships for all staging tables".to_string());
        resource.mime_type = Some("text/plain".to_string());
        std::future::ready(Ok(ListResourcesResult::with_all_items(vec![
            resource.no_annotation(),
        ])))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        if request.uri != SCHEMA_RESOURCE_URI {
            return Err(McpError::resource_not_found(
                format!("unknown resource: {}", request.uri),
                None,
            ));
        }

        let text = self.schema_text().await.map_err(|e| {
            McpError::new(
                ErrorCode::INTERNAL_ERROR,
                format!("failed to build schema: {}", e),
                None,
            )
        })?;

        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(text, SCHEMA_RESOURCE_URI)],
        })
    }

    // ── Prompts ──────────────────────────────────────────────────────────

    fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListPromptsResult, McpError>> + Send + '_ {
        let prompt = Prompt {
            name: SETUP_PROMPT.to_string(),
            title: None,
            description: Some("Load context about the Rust crates analytics warehouse".to_string()),
            arguments: None,
            icons: None,
            meta: None,
        };
        std::future::ready(Ok(ListPromptsResult::with_all_items(vec![prompt])))
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        if request.name != SETUP_PROMPT {
            return Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no prompt registered with name: {}", request.name),
                None,
            ));
        }

        Ok(GetPromptResult {
            description: Some("Rust crates analytics context".to_string()),
            messages: vec![PromptMessage::new_text(
                PromptMessageRole::User,
                SETUP_PROMPT_TEXT,
            )],
        })
    }
}
