//! Seam to the external terminal-session bridge.

use voidlux_core::{Agent, Task};

/// The registry's view of the process actually running a coding tool.
/// The real implementation lives outside the core; the node wires it
/// in at construction.
pub trait AgentBridge: Send + Sync + 'static {
    /// Hands a claimed task to the agent's session. An `Err` fails the
    /// task with the returned reason so the dispatcher can retry
    /// elsewhere.
    fn start_task(&self, agent: &Agent, task: &Task) -> Result<(), String>;

    /// Liveness probe for a locally-hosted session.
    fn is_alive(&self, agent: &Agent) -> bool;
}

/// Bridge stub for headless nodes and tests: accepts every task and
/// reports every session alive.
pub struct NullBridge;

impl AgentBridge for NullBridge {
    fn start_task(&self, _agent: &Agent, _task: &Task) -> Result<(), String> {
        Ok(())
    }

    fn is_alive(&self, _agent: &Agent) -> bool {
        true
    }
}
