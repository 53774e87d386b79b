//! The per-node swarm database: tasks, agents, and node state.

use crate::{Result, StorageError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::debug;
use voidlux_core::{
    Agent, AgentId, AgentStatus, Lamport, NodeId, Task, TaskId, TaskStatus, Timestamp,
};

/// Store backing `swarm-<p2p_port>.db`.
///
/// One connection behind a mutex: every mutation is a single statement
/// or an explicit transaction, which is what makes claims atomic.
pub struct SwarmStore {
    conn: Mutex<Connection>,
}

impl SwarmStore {
    /// Opens (creating if needed) the swarm database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens an in-memory store, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .optional()?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                work_instructions TEXT NOT NULL DEFAULT '',
                acceptance_criteria TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                required_capabilities TEXT NOT NULL DEFAULT '[]',
                created_by TEXT NOT NULL,
                assigned_to TEXT,
                assigned_node TEXT,
                result TEXT,
                error TEXT,
                progress TEXT,
                project_path TEXT,
                context TEXT,
                lamport_ts INTEGER NOT NULL DEFAULT 0,
                claimed_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                git_branch TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_lamport ON tasks(lamport_ts);

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                name TEXT NOT NULL,
                tool TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL DEFAULT '',
                capabilities TEXT NOT NULL DEFAULT '[]',
                project_path TEXT,
                max_concurrent_tasks INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL,
                current_task_id TEXT,
                last_heartbeat TEXT NOT NULL,
                lamport_ts INTEGER NOT NULL DEFAULT 0,
                registered_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agents_node ON agents(node_id);
            CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);

            CREATE TABLE IF NOT EXISTS swarm_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- swarm_state ----

    /// Reads a state value.
    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM swarm_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Writes a state value.
    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO swarm_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Loads the node id, generating and persisting one on first start.
    pub fn node_id(&self) -> Result<NodeId> {
        if let Some(hex) = self.get_state("node_id")? {
            return NodeId::from_hex(&hex)
                .map_err(|e| StorageError::corrupt("swarm_state", e.to_string()));
        }
        let id = NodeId::generate();
        self.set_state("node_id", &id.to_hex())?;
        Ok(id)
    }

    /// Loads the persisted Lamport clock value (zero on first start).
    pub fn lamport_clock(&self) -> Result<Lamport> {
        match self.get_state("lamport_clock")? {
            Some(v) => v
                .parse::<u64>()
                .map(Lamport)
                .map_err(|e| StorageError::corrupt("swarm_state", e.to_string())),
            None => Ok(Lamport::ZERO),
        }
    }

    /// Persists the Lamport clock value.
    pub fn save_lamport_clock(&self, clock: Lamport) -> Result<()> {
        self.set_state("lamport_clock", &clock.value().to_string())
    }

    // ---- tasks ----

    /// Inserts a task, ignoring the write when the id already exists.
    /// Returns true when the row was actually inserted.
    pub fn insert_task(&self, task: &Task) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = execute_task_write(
            &conn,
            "INSERT OR IGNORE INTO tasks (
                id, parent_id, title, description, work_instructions,
                acceptance_criteria, status, priority, required_capabilities,
                created_by, assigned_to, assigned_node, result, error, progress,
                project_path, context, lamport_ts, claimed_at, completed_at,
                created_at, updated_at, git_branch
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                       ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            task,
        )?;
        Ok(changed == 1)
    }

    /// Fetches a task by id.
    pub fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            params![id.to_string()],
            task_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Lists every task.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at")?;
        let rows = stmt.query_map([], task_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Pending tasks in dispatch order: priority descending, oldest first.
    pub fn pending_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks WHERE status = 'pending'
             ORDER BY priority DESC, created_at ASC",
        )?;
        let rows = stmt.query_map([], task_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// The largest task Lamport timestamp stored locally (the
    /// anti-entropy watermark).
    pub fn max_task_lamport(&self) -> Result<Lamport> {
        let conn = self.conn.lock();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(lamport_ts) FROM tasks", [], |row| row.get(0))?;
        Ok(Lamport(max.unwrap_or(0) as u64))
    }

    /// Tasks mutated after the given Lamport watermark (anti-entropy).
    pub fn tasks_since(&self, since: Lamport, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks WHERE lamport_ts > ?1
             ORDER BY lamport_ts ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since.value() as i64, limit as i64], task_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// The atomic local claim: one conditional UPDATE. Returns true when
    /// this call won the task (affected-row-count was 1).
    pub fn claim_task(
        &self,
        task_id: &TaskId,
        agent_id: &AgentId,
        node_id: &NodeId,
        lamport: Lamport,
    ) -> Result<bool> {
        let now = Timestamp::now().to_rfc3339();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET status = 'claimed', assigned_to = ?1,
                 assigned_node = ?2, lamport_ts = ?3, claimed_at = ?4,
                 updated_at = ?4
             WHERE id = ?5 AND status = 'pending'",
            params![
                agent_id.to_string(),
                node_id.to_hex(),
                lamport.value() as i64,
                now,
                task_id.to_string()
            ],
        )?;
        Ok(changed == 1)
    }

    /// Writes claim fields without the pending guard (used by the claim
    /// resolver after it has decided a remote claim wins). Terminal rows
    /// are never touched.
    pub fn write_claim(
        &self,
        task_id: &TaskId,
        agent_id: &AgentId,
        node_id: &NodeId,
        lamport: Lamport,
        claimed_at: Timestamp,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET status = 'claimed', assigned_to = ?1,
                 assigned_node = ?2, lamport_ts = ?3, claimed_at = ?4,
                 updated_at = ?5
             WHERE id = ?6
               AND status NOT IN ('completed', 'failed', 'cancelled')",
            params![
                agent_id.to_string(),
                node_id.to_hex(),
                lamport.value() as i64,
                claimed_at.to_rfc3339(),
                Timestamp::now().to_rfc3339(),
                task_id.to_string()
            ],
        )?;
        Ok(changed == 1)
    }

    /// Transitions a non-terminal task to a new status. `result` and
    /// `error` are written when the transition is terminal; terminal rows
    /// never mutate again.
    pub fn transition_task(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
        lamport: Lamport,
    ) -> Result<bool> {
        let now = Timestamp::now().to_rfc3339();
        let completed_at = status.is_terminal().then(|| now.clone());
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, result = COALESCE(?2, result),
                 error = COALESCE(?3, error), lamport_ts = ?4,
                 completed_at = COALESCE(?5, completed_at), updated_at = ?6
             WHERE id = ?7
               AND status NOT IN ('completed', 'failed', 'cancelled')",
            params![
                status.as_str(),
                result,
                error,
                lamport.value() as i64,
                completed_at,
                now,
                task_id.to_string()
            ],
        )?;
        Ok(changed == 1)
    }

    /// Resets a non-terminal task to pending, clearing the assignment.
    pub fn requeue_task(&self, task_id: &TaskId, lamport: Lamport) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET status = 'pending', assigned_to = NULL,
                 assigned_node = NULL, claimed_at = NULL, progress = NULL,
                 lamport_ts = ?1, updated_at = ?2
             WHERE id = ?3
               AND status NOT IN ('completed', 'failed', 'cancelled')",
            params![
                lamport.value() as i64,
                Timestamp::now().to_rfc3339(),
                task_id.to_string()
            ],
        )?;
        Ok(changed == 1)
    }

    /// Records a progress note on a running task.
    pub fn record_progress(
        &self,
        task_id: &TaskId,
        progress: &str,
        lamport: Lamport,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET progress = ?1, lamport_ts = ?2, updated_at = ?3
             WHERE id = ?4
               AND status NOT IN ('completed', 'failed', 'cancelled')",
            params![
                progress,
                lamport.value() as i64,
                Timestamp::now().to_rfc3339(),
                task_id.to_string()
            ],
        )?;
        Ok(changed == 1)
    }

    /// Full-row last-writer-wins merge for a gossiped task.
    ///
    /// The row with the larger `(lamport_ts, authority)` pair wins, where
    /// authority is the assigned node falling back to the creator — a
    /// deterministic tiebreak every node computes identically. Terminal
    /// local rows are never overwritten. Returns true when the incoming
    /// row was applied.
    pub fn merge_task(&self, incoming: &Task) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let local: Option<Task> = tx
            .query_row(
                "SELECT * FROM tasks WHERE id = ?1",
                params![incoming.id.to_string()],
                task_from_row,
            )
            .optional()?;

        let apply = match &local {
            None => true,
            Some(local) => {
                if local.status.is_terminal() {
                    false
                } else {
                    let inc_auth = incoming.assigned_node.unwrap_or(incoming.created_by);
                    let loc_auth = local.assigned_node.unwrap_or(local.created_by);
                    voidlux_core::wins(
                        (incoming.lamport_ts, &inc_auth),
                        (local.lamport_ts, &loc_auth),
                    )
                }
            }
        };

        if apply {
            execute_task_write(
                &tx,
                "INSERT INTO tasks (
                    id, parent_id, title, description, work_instructions,
                    acceptance_criteria, status, priority, required_capabilities,
                    created_by, assigned_to, assigned_node, result, error,
                    progress, project_path, context, lamport_ts, claimed_at,
                    completed_at, created_at, updated_at, git_branch
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                           ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
                 ON CONFLICT(id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    title = excluded.title,
                    description = excluded.description,
                    work_instructions = excluded.work_instructions,
                    acceptance_criteria = excluded.acceptance_criteria,
                    status = excluded.status,
                    priority = excluded.priority,
                    required_capabilities = excluded.required_capabilities,
                    assigned_to = excluded.assigned_to,
                    assigned_node = excluded.assigned_node,
                    result = excluded.result,
                    error = excluded.error,
                    progress = excluded.progress,
                    project_path = excluded.project_path,
                    context = excluded.context,
                    lamport_ts = excluded.lamport_ts,
                    claimed_at = excluded.claimed_at,
                    completed_at = excluded.completed_at,
                    updated_at = excluded.updated_at,
                    git_branch = excluded.git_branch",
                incoming,
            )?;
            debug!(task_id = %incoming.id, lamport = %incoming.lamport_ts, "merged task row");
        }

        tx.commit()?;
        Ok(apply)
    }

    /// Non-terminal tasks assigned to the given node (orphan recovery).
    pub fn orphaned_tasks(&self, node_id: &NodeId) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks
             WHERE assigned_node = ?1
               AND status NOT IN ('completed', 'failed', 'cancelled')",
        )?;
        let rows = stmt.query_map(params![node_id.to_hex()], task_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ---- agents ----

    /// Inserts or replaces an agent row.
    pub fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents (
                id, node_id, name, tool, model, capabilities, project_path,
                max_concurrent_tasks, status, current_task_id, last_heartbeat,
                lamport_ts, registered_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                node_id = excluded.node_id,
                name = excluded.name,
                tool = excluded.tool,
                model = excluded.model,
                capabilities = excluded.capabilities,
                project_path = excluded.project_path,
                max_concurrent_tasks = excluded.max_concurrent_tasks,
                status = excluded.status,
                current_task_id = excluded.current_task_id,
                last_heartbeat = excluded.last_heartbeat,
                lamport_ts = excluded.lamport_ts",
            params![
                agent.id.to_string(),
                agent.node_id.to_hex(),
                agent.name,
                agent.tool,
                agent.model,
                serde_json::to_string(&agent.capabilities).unwrap_or_else(|_| "[]".into()),
                agent.project_path,
                agent.max_concurrent_tasks,
                agent.status.as_str(),
                agent.current_task_id.map(|t| t.to_string()),
                agent.last_heartbeat.to_rfc3339(),
                agent.lamport_ts.value() as i64,
                agent.registered_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetches an agent by id.
    pub fn get_agent(&self, id: &AgentId) -> Result<Option<Agent>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM agents WHERE id = ?1",
            params![id.to_string()],
            agent_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Lists every known agent across all nodes.
    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM agents ORDER BY registered_at")?;
        let rows = stmt.query_map([], agent_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Agents owned by a specific node.
    pub fn agents_on_node(&self, node_id: &NodeId) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM agents WHERE node_id = ?1")?;
        let rows = stmt.query_map(params![node_id.to_hex()], agent_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Idle agents across all known nodes (the dispatcher's candidates).
    pub fn idle_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM agents WHERE status = 'idle' ORDER BY registered_at")?;
        let rows = stmt.query_map([], agent_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Updates an agent's status and current task, bumping the heartbeat.
    pub fn set_agent_status(
        &self,
        id: &AgentId,
        status: AgentStatus,
        current_task_id: Option<&TaskId>,
        lamport: Lamport,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE agents SET status = ?1, current_task_id = ?2,
                 last_heartbeat = ?3, lamport_ts = ?4
             WHERE id = ?5",
            params![
                status.as_str(),
                current_task_id.map(|t| t.to_string()),
                Timestamp::now().to_rfc3339(),
                lamport.value() as i64,
                id.to_string()
            ],
        )?;
        Ok(changed == 1)
    }

    /// Deletes an agent row. Returns true when a row existed.
    pub fn delete_agent(&self, id: &AgentId) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM agents WHERE id = ?1", params![id.to_string()])?;
        Ok(changed == 1)
    }

    /// Drops remote agents whose last heartbeat is older than the
    /// threshold. The local node's own agents are never pruned here;
    /// only their owner may delete them.
    pub fn prune_stale_agents(&self, own_node: &NodeId, stale_secs: u64) -> Result<usize> {
        let agents = self.list_agents()?;
        let mut pruned = 0;
        for agent in agents {
            if agent.node_id != *own_node && agent.last_heartbeat.elapsed_secs() > stale_secs {
                if self.delete_agent(&agent.id)? {
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }
}

fn execute_task_write(conn: &Connection, sql: &str, task: &Task) -> rusqlite::Result<usize> {
    conn.execute(
        sql,
        params![
            task.id.to_string(),
            task.parent_id.map(|p| p.to_string()),
            task.title,
            task.description,
            task.work_instructions,
            task.acceptance_criteria,
            task.status.as_str(),
            task.priority,
            serde_json::to_string(&task.required_capabilities).unwrap_or_else(|_| "[]".into()),
            task.created_by.to_hex(),
            task.assigned_to.map(|a| a.to_string()),
            task.assigned_node.map(|n| n.to_hex()),
            task.result,
            task.error,
            task.progress,
            task.project_path,
            task.context,
            task.lamport_ts.value() as i64,
            task.claimed_at.map(|t| t.to_rfc3339()),
            task.completed_at.map(|t| t.to_rfc3339()),
            task.created_at.to_rfc3339(),
            task.updated_at.to_rfc3339(),
            task.git_branch,
        ],
    )
}

fn parse_err(table: &'static str) -> impl Fn(voidlux_core::Error) -> rusqlite::Error {
    move |e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(StorageError::corrupt(table, e.to_string())),
        )
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let err = parse_err("tasks");

    let status: String = row.get("status")?;
    let caps: String = row.get("required_capabilities")?;
    let created_by: String = row.get("created_by")?;
    let assigned_node: Option<String> = row.get("assigned_node")?;
    let assigned_to: Option<String> = row.get("assigned_to")?;
    let parent_id: Option<String> = row.get("parent_id")?;
    let id: String = row.get("id")?;
    let claimed_at: Option<String> = row.get("claimed_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Task {
        id: id.parse().map_err(&err)?,
        parent_id: parent_id.map(|p| p.parse()).transpose().map_err(&err)?,
        title: row.get("title")?,
        description: row.get("description")?,
        work_instructions: row.get("work_instructions")?,
        acceptance_criteria: row.get("acceptance_criteria")?,
        status: status.parse().map_err(&err)?,
        priority: row.get("priority")?,
        required_capabilities: serde_json::from_str(&caps).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(StorageError::corrupt("tasks", e.to_string())),
            )
        })?,
        created_by: NodeId::from_hex(&created_by).map_err(&err)?,
        assigned_to: assigned_to.map(|a| a.parse()).transpose().map_err(&err)?,
        assigned_node: assigned_node
            .map(|n| NodeId::from_hex(&n))
            .transpose()
            .map_err(&err)?,
        result: row.get("result")?,
        error: row.get("error")?,
        progress: row.get("progress")?,
        project_path: row.get("project_path")?,
        context: row.get("context")?,
        lamport_ts: Lamport(row.get::<_, i64>("lamport_ts")? as u64),
        claimed_at: claimed_at
            .map(|t| Timestamp::parse(&t))
            .transpose()
            .map_err(&err)?,
        completed_at: completed_at
            .map(|t| Timestamp::parse(&t))
            .transpose()
            .map_err(&err)?,
        created_at: Timestamp::parse(&created_at).map_err(&err)?,
        updated_at: Timestamp::parse(&updated_at).map_err(&err)?,
        git_branch: row.get("git_branch")?,
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let err = parse_err("agents");

    let id: String = row.get("id")?;
    let node_id: String = row.get("node_id")?;
    let status: String = row.get("status")?;
    let caps: String = row.get("capabilities")?;
    let current_task_id: Option<String> = row.get("current_task_id")?;
    let last_heartbeat: String = row.get("last_heartbeat")?;
    let registered_at: String = row.get("registered_at")?;

    Ok(Agent {
        id: id.parse().map_err(&err)?,
        node_id: NodeId::from_hex(&node_id).map_err(&err)?,
        name: row.get("name")?,
        tool: row.get("tool")?,
        model: row.get("model")?,
        capabilities: serde_json::from_str(&caps).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(StorageError::corrupt("agents", e.to_string())),
            )
        })?,
        project_path: row.get("project_path")?,
        max_concurrent_tasks: row.get("max_concurrent_tasks")?,
        status: status.parse().map_err(&err)?,
        current_task_id: current_task_id
            .map(|t| t.parse())
            .transpose()
            .map_err(&err)?,
        last_heartbeat: Timestamp::parse(&last_heartbeat).map_err(&err)?,
        lamport_ts: Lamport(row.get::<_, i64>("lamport_ts")? as u64),
        registered_at: Timestamp::parse(&registered_at).map_err(&err)?,
    })
}
