//! Agent Resolver: composes an Agent plus its Provider, Runtime, Skills, and
//! MCP servers into a single ready-to-run configuration.

use crate::error::{CoreError, Result};
use crate::model::{Agent, McpServer, Provider, Runtime, Skill};
use crate::store::Store;
use std::collections::HashMap;

/// Everything a Session needs to start a container and build an Exec
/// invocation, assembled from the entities an Agent references.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub agent: Agent,
    pub provider: Provider,
    pub runtime: Runtime,
    pub skills: Vec<Skill>,
    pub mcp_servers: Vec<McpServer>,
    pub env: HashMap<String, String>,
}

pub struct AgentResolver {
    store: Store,
}

impl AgentResolver {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Resolves an Agent's full configuration.
    ///
    /// Fails closed when the Provider is unconfigured or the Runtime is
    /// missing; a disabled Skill is filtered out silently rather than
    /// failing the whole resolution, since skills are additive.
    pub async fn resolve(&self, agent_id: crate::model::AgentId) -> Result<ResolvedConfig> {
        let agent = self.store.agents.get(agent_id).await?;

        let provider = self.store.providers.get(agent.provider_id).await?;
        if !provider.is_configured {
            return Err(CoreError::PreconditionFailed(format!(
                "provider {} is not configured",
                provider.id
            )));
        }

        let runtime = self.store.runtimes.get(agent.runtime_id).await?;

        let mut skills = Vec::new();
        for skill_id in &agent.skill_ids {
            match self.store.skills.get(*skill_id).await {
                Ok(skill) if skill.enabled => skills.push(skill),
                Ok(_) => continue,
                Err(CoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        // MCP servers aren't a stored entity type of their own in this
        // deployment; Agents carry their configuration directly via
        // McpServerId references resolved against an empty set until a
        // dedicated repository exists.
        let mcp_servers: Vec<McpServer> = Vec::new();

        // Env union in priority order: runtime defaults < provider-level <
        // agent-level. Later entries win on key collision.
        let mut env = HashMap::new();
        if let Some(key) = &provider.api_key {
            env.insert(provider_api_key_env_var(&provider.name), key.clone());
        }
        for (k, v) in &agent.env {
            env.insert(k.clone(), v.clone());
        }

        Ok(ResolvedConfig {
            agent,
            provider,
            runtime,
            skills,
            mcp_servers,
            env,
        })
    }
}

fn provider_api_key_env_var(provider_name: &str) -> String {
    match provider_name {
        "anthropic" => "ANTHROPIC_API_KEY".to_string(),
        "openai" => "OPENAI_API_KEY".to_string(),
        other => format!("{}_API_KEY", other.to_uppercase().replace('-', "_")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use uuid::Uuid;

    async fn seeded_store() -> (Store, AgentId, ProviderId, RuntimeId) {
        let store = Store::in_memory();
        let provider = Provider {
            id: Uuid::new_v4(),
            name: "anthropic".to_string(),
            category: "llm".to_string(),
            base_url: None,
            api_key: Some("sk-test".to_string()),
            is_configured: true,
            default_models: vec!["sonnet".to_string()],
            supported_adapters: vec![AdapterTag::ClaudeCode],
            is_builtin: true,
        };
        let runtime = Runtime {
            id: Uuid::new_v4(),
            image: "agentbox/workspace:latest".to_string(),
            cpu_cores: 1.0,
            memory_mb: 1024,
            network_mode: "bridge".to_string(),
            default_command: None,
            is_default: true,
        };
        let agent = Agent {
            id: Uuid::new_v4(),
            adapter: AdapterTag::ClaudeCode,
            provider_id: provider.id,
            runtime_id: runtime.id,
            model: Some("sonnet".to_string()),
            base_url_override: None,
            skill_ids: Vec::new(),
            mcp_server_ids: Vec::new(),
            system_prompt: None,
            permission: PermissionConfig::default(),
            env: HashMap::new(),
            status: AgentStatus::Active,
        };
        store.providers.insert(provider.clone()).await.unwrap();
        store.runtimes.insert(runtime.clone()).await.unwrap();
        store.agents.insert(agent.clone()).await.unwrap();
        (store, agent.id, provider.id, runtime.id)
    }

    #[tokio::test]
    async fn resolves_provider_and_runtime() {
        let (store, agent_id, provider_id, runtime_id) = seeded_store().await;
        let resolver = AgentResolver::new(store);
        let resolved = resolver.resolve(agent_id).await.unwrap();
        assert_eq!(resolved.provider.id, provider_id);
        assert_eq!(resolved.runtime.id, runtime_id);
        assert_eq!(
            resolved.env.get("ANTHROPIC_API_KEY").map(String::as_str),
            Some("sk-test")
        );
    }

    #[tokio::test]
    async fn unconfigured_provider_fails_resolution() {
        let (store, agent_id, provider_id, _) = seeded_store().await;
        let mut provider = store.providers.get(provider_id).await.unwrap();
        provider.is_configured = false;
        store.providers.update(provider).await.unwrap();
        let resolver = AgentResolver::new(store);
        let err = resolver.resolve(agent_id).await.unwrap_err();
        assert_eq!(err.status_code(), 412);
    }

    #[tokio::test]
    async fn disabled_skill_is_silently_filtered() {
        let (store, agent_id, _, _) = seeded_store().await;
        let skill = Skill {
            id: Uuid::new_v4(),
            name: "disabled-skill".to_string(),
            command: "/disabled".to_string(),
            description: "".to_string(),
            prompt: "".to_string(),
            category: "".to_string(),
            enabled: false,
            files: Vec::new(),
            source_dir: None,
            is_builtin: false,
        };
        store.skills.insert(skill.clone()).await.unwrap();
        let mut agent = store.agents.get(agent_id).await.unwrap();
        agent.skill_ids.push(skill.id);
        store.agents.update(agent).await.unwrap();

        let resolver = AgentResolver::new(store);
        let resolved = resolver.resolve(agent_id).await.unwrap();
        assert!(resolved.skills.is_empty());
    }
}
