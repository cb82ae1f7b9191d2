use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::agents::Agent;
use crate::models::{CoreError, CoreErrorKind, TaskKind};

/// Explicit mapping from task kind to the agent that executes it. Built once, then shared.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<HashMap<TaskKind, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn new(agents: impl IntoIterator<Item = Arc<dyn Agent>>) -> Result<Self, CoreError> {
        let mut mapped = HashMap::new();
        for agent in agents {
            let kind = agent.descriptor().kind;
            if mapped.insert(kind, agent).is_some() {
                return Err(CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("duplicate agent registration for task kind '{kind:?}'"),
                )
                .for_task(kind));
            }
        }
        Ok(Self {
            agents: Arc::new(mapped),
        })
    }

    pub fn has_kind(&self, kind: TaskKind) -> bool {
        self.agents.contains_key(&kind)
    }

    pub fn agent(&self, kind: TaskKind) -> Result<Arc<dyn Agent>, CoreError> {
        self.agents.get(&kind).cloned().ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("no agent is registered for task kind '{kind:?}'"),
            )
            .for_task(kind)
        })
    }

    /// Registered agents in `TaskKind::ALL` order.
    pub fn agents(&self) -> Vec<Arc<dyn Agent>> {
        TaskKind::ALL
            .iter()
            .filter_map(|kind| self.agents.get(kind).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<(TaskKind, &str)> = self
            .agents()
            .iter()
            .map(|agent| (agent.descriptor().kind, agent.descriptor().name))
            .collect();
        f.debug_struct("AgentRegistry")
            .field("agents", &registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::AgentRegistry;
    use crate::agents::{Agent, AgentDescriptor, AgentRequest, AgentResult};
    use crate::models::{CoreErrorKind, TaskKind};

    struct StubAgent(AgentDescriptor);

    impl Agent for StubAgent {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.0
        }

        fn execute(&self, _request: &AgentRequest) -> AgentResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        fn test_connection(&self) -> AgentResult<()> {
            Ok(())
        }
    }

    fn stub(kind: TaskKind) -> Arc<dyn Agent> {
        Arc::new(StubAgent(AgentDescriptor { kind, name: "stub" }))
    }

    #[test]
    fn rejects_duplicate_kinds() {
        let error = AgentRegistry::new([
            stub(TaskKind::RelevanceScoring),
            stub(TaskKind::RelevanceScoring),
        ])
        .err()
        .unwrap();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
        assert_eq!(error.task, Some(TaskKind::RelevanceScoring));
    }

    #[test]
    fn missing_kind_is_reported() {
        let registry = AgentRegistry::new([stub(TaskKind::QueryGeneration)]).unwrap();
        assert!(registry.has_kind(TaskKind::QueryGeneration));
        assert!(registry.agent(TaskKind::ReportSynthesis).is_err());
        assert_eq!(registry.agents().len(), 1);
    }

    #[test]
    fn debug_lists_registered_agents_in_kind_order() {
        let registry = AgentRegistry::new([
            stub(TaskKind::ReportSynthesis),
            stub(TaskKind::QueryGeneration),
        ])
        .unwrap();
        assert_eq!(
            format!("{registry:?}"),
            r#"AgentRegistry { agents: [(QueryGeneration, "stub"), (ReportSynthesis, "stub")] }"#
        );
    }
}
