use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use trellis_core::error::{Result, TrellisError};
use trellis_core::graph::{EdgeSpec, Graph, GraphWarning, NodeSpec, NodeType};
use trellis_core::traits::WorkflowStore;
use trellis_core::types::{
    ApprovalRequest, LedgerEntry, Run, RunId, RunStatus, ToolSpec, WorkflowRecord,
};

/// SQLite-backed store for workflows, runs, the ledger, approvals, and tools.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TrellisError::Store(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(|e| TrellisError::Store(e.to_string()))?;

        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| TrellisError::Store(e.to_string()))?;

        Self::init_schema(&conn)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| TrellisError::Store(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS workflow_nodes (
                workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                config TEXT NOT NULL,
                position TEXT,
                PRIMARY KEY (workflow_id, id)
            );

            CREATE TABLE IF NOT EXISTS workflow_edges (
                workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                id TEXT NOT NULL,
                source_node TEXT NOT NULL,
                target_node TEXT NOT NULL,
                source_handle TEXT,
                target_handle TEXT,
                PRIMARY KEY (workflow_id, id)
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                initial_input TEXT NOT NULL,
                created_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_runs_workflow
                ON runs(workflow_id, created_at);

            CREATE TABLE IF NOT EXISTS ledger (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                input TEXT NOT NULL,
                output TEXT,
                tool_calls TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                duration_ms INTEGER,
                error TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_run_seq
                ON ledger(run_id, sequence);

            CREATE TABLE IF NOT EXISTS approvals (
                run_id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                message TEXT NOT NULL,
                pending_input TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tools (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                parameters TEXT NOT NULL,
                api_url TEXT NOT NULL,
                method TEXT NOT NULL,
                headers TEXT NOT NULL
            );",
        )
        .map_err(|e| TrellisError::Store(e.to_string()))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TrellisError::Store(e.to_string()))
    }
}

fn store_err(e: rusqlite::Error) -> TrellisError {
    TrellisError::Store(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TrellisError::Store(format!("bad timestamp {}: {}", s, e)))
}

fn parse_json(s: &str) -> Result<Value> {
    serde_json::from_str(s).map_err(|e| TrellisError::Store(format!("bad json column: {}", e)))
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, String, Option<String>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn build_run(
    (id, workflow_id, status, input, created_at, finished_at): (
        String,
        String,
        String,
        String,
        String,
        Option<String>,
    ),
) -> Result<Run> {
    Ok(Run {
        id: RunId::from_string(id),
        workflow_id,
        status: RunStatus::parse(&status)
            .ok_or_else(|| TrellisError::Store(format!("bad run status: {}", status)))?,
        initial_input: parse_json(&input)?,
        created_at: parse_ts(&created_at)?,
        finished_at: finished_at.as_deref().map(parse_ts).transpose()?,
    })
}

impl WorkflowStore for SqliteStore {
    fn save_workflow(&self, record: &WorkflowRecord, graph: &Graph) -> Result<Vec<GraphWarning>> {
        let warnings = graph.validate()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_err)?;

        tx.execute(
            "INSERT INTO workflows (id, owner, name, description) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET owner = ?2, name = ?3, description = ?4",
            params![record.id, record.owner, record.name, record.description],
        )
        .map_err(store_err)?;

        tx.execute("DELETE FROM workflow_nodes WHERE workflow_id = ?1", params![record.id])
            .map_err(store_err)?;
        tx.execute("DELETE FROM workflow_edges WHERE workflow_id = ?1", params![record.id])
            .map_err(store_err)?;

        for node in &graph.nodes {
            let position = node
                .position
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO workflow_nodes (workflow_id, id, node_type, config, position)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id,
                    node.id,
                    node.node_type.as_str(),
                    serde_json::to_string(&node.config)?,
                    position,
                ],
            )
            .map_err(store_err)?;
        }
        for edge in &graph.edges {
            let edge_id = if edge.id.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                edge.id.clone()
            };
            tx.execute(
                "INSERT INTO workflow_edges
                 (workflow_id, id, source_node, target_node, source_handle, target_handle)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    edge_id,
                    edge.source,
                    edge.target,
                    edge.source_handle,
                    edge.target_handle,
                ],
            )
            .map_err(store_err)?;
        }

        tx.commit().map_err(store_err)?;
        debug!(workflow_id = %record.id, nodes = graph.nodes.len(), "Workflow saved");
        Ok(warnings)
    }

    fn workflow(&self, id: &str) -> Result<Option<WorkflowRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, owner, name, description FROM workflows WHERE id = ?1",
            params![id],
            |row| {
                Ok(WorkflowRecord {
                    id: row.get(0)?,
                    owner: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(store_err)
    }

    fn graph(&self, workflow_id: &str) -> Result<Graph> {
        let conn = self.lock()?;

        let exists: Option<String> = conn
            .query_row(
                "SELECT id FROM workflows WHERE id = ?1",
                params![workflow_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        if exists.is_none() {
            return Err(TrellisError::WorkflowNotFound(workflow_id.to_string()));
        }

        let mut stmt = conn
            .prepare("SELECT id, node_type, config, position FROM workflow_nodes WHERE workflow_id = ?1")
            .map_err(store_err)?;
        let node_rows = stmt
            .query_map(params![workflow_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .map_err(store_err)?;

        let mut nodes = Vec::new();
        for row in node_rows {
            let (id, node_type, config, position) = row.map_err(store_err)?;
            let node_type = NodeType::parse(&node_type)
                .ok_or_else(|| TrellisError::UnknownNodeType(node_type.clone()))?;
            nodes.push(NodeSpec {
                id,
                node_type,
                config: parse_json(&config)?,
                position: position
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?,
            });
        }

        let mut stmt = conn
            .prepare(
                "SELECT id, source_node, target_node, source_handle, target_handle
                 FROM workflow_edges WHERE workflow_id = ?1",
            )
            .map_err(store_err)?;
        let edge_rows = stmt
            .query_map(params![workflow_id], |row| {
                Ok(EdgeSpec {
                    id: row.get(0)?,
                    source: row.get(1)?,
                    target: row.get(2)?,
                    source_handle: row.get(3)?,
                    target_handle: row.get(4)?,
                })
            })
            .map_err(store_err)?;

        let mut edges = Vec::new();
        for row in edge_rows {
            edges.push(row.map_err(store_err)?);
        }

        Ok(Graph::new(nodes, edges))
    }

    fn create_run(&self, workflow_id: &str, initial_input: &Value) -> Result<Run> {
        let run = Run {
            id: RunId::new(),
            workflow_id: workflow_id.to_string(),
            status: RunStatus::Running,
            initial_input: initial_input.clone(),
            created_at: Utc::now(),
            finished_at: None,
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (id, workflow_id, status, initial_input, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![
                run.id.0,
                run.workflow_id,
                run.status.as_str(),
                serde_json::to_string(&run.initial_input)?,
                run.created_at.to_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(run)
    }

    fn run(&self, id: &RunId) -> Result<Option<Run>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, workflow_id, status, initial_input, created_at, finished_at
                 FROM runs WHERE id = ?1",
                params![id.0],
                row_to_run,
            )
            .optional()
            .map_err(store_err)?;
        row.map(build_run).transpose()
    }

    fn set_run_status(&self, id: &RunId, status: RunStatus) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE runs SET status = ?2 WHERE id = ?1",
                params![id.0, status.as_str()],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(TrellisError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    fn finish_run(&self, id: &RunId, status: RunStatus) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE runs SET status = ?2, finished_at = ?3 WHERE id = ?1",
                params![id.0, status.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(TrellisError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    fn list_runs(&self, workflow_id: &str) -> Result<Vec<Run>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, workflow_id, status, initial_input, created_at, finished_at
                 FROM runs WHERE workflow_id = ?1 ORDER BY created_at DESC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![workflow_id], row_to_run)
            .map_err(store_err)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(build_run(row.map_err(store_err)?)?);
        }
        Ok(runs)
    }

    fn ledger_start(
        &self,
        run_id: &RunId,
        node_id: &str,
        node_type: NodeType,
        input: &Value,
    ) -> Result<LedgerEntry> {
        let conn = self.lock()?;
        // Next sequence under the connection lock keeps it atomic per run.
        let sequence: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM ledger WHERE run_id = ?1",
                params![run_id.0],
                |row| row.get(0),
            )
            .map_err(store_err)?;

        let entry = LedgerEntry {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.clone(),
            node_id: node_id.to_string(),
            node_type,
            sequence,
            input: input.clone(),
            output: None,
            tool_calls: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            error: None,
        };

        conn.execute(
            "INSERT INTO ledger (id, run_id, node_id, node_type, sequence, input, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.run_id.0,
                entry.node_id,
                entry.node_type.as_str(),
                entry.sequence,
                serde_json::to_string(&entry.input)?,
                entry.started_at.to_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(entry)
    }

    fn ledger_finish(
        &self,
        entry_id: &str,
        output: &Value,
        tool_calls: Option<&Value>,
    ) -> Result<i64> {
        let conn = self.lock()?;
        let started_at: String = conn
            .query_row(
                "SELECT started_at FROM ledger WHERE id = ?1",
                params![entry_id],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        let finished = Utc::now();
        let duration_ms = (finished - parse_ts(&started_at)?).num_milliseconds();

        let tool_calls_json = tool_calls.map(serde_json::to_string).transpose()?;
        conn.execute(
            "UPDATE ledger SET output = ?2, tool_calls = ?3, finished_at = ?4, duration_ms = ?5
             WHERE id = ?1",
            params![
                entry_id,
                serde_json::to_string(output)?,
                tool_calls_json,
                finished.to_rfc3339(),
                duration_ms,
            ],
        )
        .map_err(store_err)?;
        Ok(duration_ms)
    }

    fn ledger_fail(&self, entry_id: &str, error: &str) -> Result<()> {
        let conn = self.lock()?;
        let started_at: String = conn
            .query_row(
                "SELECT started_at FROM ledger WHERE id = ?1",
                params![entry_id],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        let finished = Utc::now();
        let duration_ms = (finished - parse_ts(&started_at)?).num_milliseconds();

        conn.execute(
            "UPDATE ledger SET error = ?2, finished_at = ?3, duration_ms = ?4 WHERE id = ?1",
            params![entry_id, error, finished.to_rfc3339(), duration_ms],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn ledger(&self, run_id: &RunId) -> Result<Vec<LedgerEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, node_id, node_type, sequence, input, output, tool_calls,
                        started_at, finished_at, duration_ms, error
                 FROM ledger WHERE run_id = ?1 ORDER BY sequence",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![run_id.0], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<i64>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            })
            .map_err(store_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, node_id, node_type, sequence, input, output, tool_calls, started, finished, duration_ms, error) =
                row.map_err(store_err)?;
            entries.push(LedgerEntry {
                id,
                run_id: run_id.clone(),
                node_id,
                node_type: NodeType::parse(&node_type)
                    .ok_or_else(|| TrellisError::UnknownNodeType(node_type.clone()))?,
                sequence,
                input: parse_json(&input)?,
                output: output.as_deref().map(parse_json).transpose()?,
                tool_calls: tool_calls.as_deref().map(parse_json).transpose()?,
                started_at: parse_ts(&started)?,
                finished_at: finished.as_deref().map(parse_ts).transpose()?,
                duration_ms,
                error,
            });
        }
        Ok(entries)
    }

    fn create_approval(&self, approval: &ApprovalRequest) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO approvals (run_id, node_id, message, pending_input, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                approval.run_id.0,
                approval.node_id,
                approval.message,
                serde_json::to_string(&approval.pending_input)?,
                approval.created_at.to_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn take_approval(&self, run_id: &RunId, node_id: &str) -> Result<Option<ApprovalRequest>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT node_id, message, pending_input, created_at
                 FROM approvals WHERE run_id = ?1 AND node_id = ?2",
                params![run_id.0, node_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(store_err)?;

        let Some((node_id, message, pending_input, created_at)) = row else {
            return Ok(None);
        };

        conn.execute("DELETE FROM approvals WHERE run_id = ?1", params![run_id.0])
            .map_err(store_err)?;

        Ok(Some(ApprovalRequest {
            run_id: run_id.clone(),
            node_id,
            message,
            pending_input: parse_json(&pending_input)?,
            created_at: parse_ts(&created_at)?,
        }))
    }

    fn pending_approval(&self, run_id: &RunId) -> Result<Option<ApprovalRequest>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT node_id, message, pending_input, created_at
                 FROM approvals WHERE run_id = ?1",
                params![run_id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(store_err)?;

        row.map(|(node_id, message, pending_input, created_at)| {
            Ok(ApprovalRequest {
                run_id: run_id.clone(),
                node_id,
                message,
                pending_input: parse_json(&pending_input)?,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    fn save_tool(&self, tool: &ToolSpec) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tools (id, name, description, parameters, api_url, method, headers)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                name = ?2, description = ?3, parameters = ?4, api_url = ?5, method = ?6, headers = ?7",
            params![
                tool.id,
                tool.name,
                tool.description,
                serde_json::to_string(&tool.parameters)?,
                tool.api_url,
                tool.method,
                serde_json::to_string(&tool.headers)?,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn tool(&self, id: &str) -> Result<Option<ToolSpec>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, name, description, parameters, api_url, method, headers
                 FROM tools WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(store_err)?;

        row.map(|(id, name, description, parameters, api_url, method, headers)| {
            Ok(ToolSpec {
                id,
                name,
                description,
                parameters: serde_json::from_str(&parameters)
                    .map_err(|e| TrellisError::Store(format!("bad tool parameters: {}", e)))?,
                api_url,
                method,
                headers: serde_json::from_str(&headers)
                    .map_err(|e| TrellisError::Store(format!("bad tool headers: {}", e)))?,
            })
        })
        .transpose()
    }
}
