use std::collections::BTreeMap;

use tracing::debug;

use crate::agent::{Agent, AgentFactory};
use crate::errors::{AgentError, RegistryError};

/// Agent name -> factory.
///
/// Populated by explicit registration or from a mapping produced by an
/// external loader via [`AgentRegistry::extend`].
#[derive(Clone, Default)]
pub struct AgentRegistry {
    factories: BTreeMap<String, AgentFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Result<Box<dyn Agent>, AgentError> + Send + Sync + 'static,
    ) -> Result<(), RegistryError> {
        self.insert(name.into(), std::sync::Arc::new(factory))
    }

    /// Adds every entry of `mapping`. Nothing is added when any name is empty
    /// or already taken.
    pub fn extend<I>(&mut self, mapping: I) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = (String, AgentFactory)>,
    {
        let mapping: Vec<(String, AgentFactory)> = mapping.into_iter().collect();
        let mut seen = std::collections::BTreeSet::new();
        for (name, _) in &mapping {
            Self::check_name(name)?;
            if self.factories.contains_key(name) || !seen.insert(name.as_str()) {
                return Err(RegistryError::Duplicate(name.clone()));
            }
        }
        for (name, factory) in mapping {
            debug!(agent = %name, "agent registered");
            self.factories.insert(name, factory);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&AgentFactory> {
        self.factories.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    fn insert(&mut self, name: String, factory: AgentFactory) -> Result<(), RegistryError> {
        Self::check_name(&name)?;
        if self.factories.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        debug!(agent = %name, "agent registered");
        self.factories.insert(name, factory);
        Ok(())
    }

    fn check_name(name: &str) -> Result<(), RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::agent_factory;
    use serde_json::{Value, json};

    struct Constant(Value);

    #[async_trait::async_trait]
    impl Agent for Constant {
        async fn run(&self, _input: Value) -> Result<Value, AgentError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn registered_factory_builds_agent() {
        let mut registry = AgentRegistry::new();
        registry
            .register("const", || Ok(Box::new(Constant(json!(7))) as Box<dyn Agent>))
            .unwrap();
        let agent = (registry.get("const").unwrap())().unwrap();
        assert_eq!(agent.run(Value::Null).await.unwrap(), json!(7));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn duplicate_and_empty_names_are_rejected() {
        let mut registry = AgentRegistry::new();
        let build = || Ok(Box::new(Constant(Value::Null)) as Box<dyn Agent>);
        registry.register("a", build).unwrap();
        assert_eq!(
            registry.register("a", build),
            Err(RegistryError::Duplicate("a".into()))
        );
        assert_eq!(registry.register("  ", build), Err(RegistryError::EmptyName));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn extend_is_all_or_nothing() {
        let mut registry = AgentRegistry::new();
        let factory = agent_factory(|| Ok(Box::new(Constant(Value::Null)) as Box<dyn Agent>));
        registry.register("taken", || Ok(Box::new(Constant(Value::Null)) as Box<dyn Agent>)).unwrap();

        let clash = vec![
            ("fresh".to_string(), factory.clone()),
            ("taken".to_string(), factory.clone()),
        ];
        assert_eq!(registry.extend(clash), Err(RegistryError::Duplicate("taken".into())));
        assert!(!registry.contains("fresh"));

        let repeated = vec![("x".to_string(), factory.clone()), ("x".to_string(), factory.clone())];
        assert!(registry.extend(repeated).is_err());

        registry
            .extend(vec![("b".to_string(), factory.clone()), ("c".to_string(), factory)])
            .unwrap();
        assert_eq!(registry.names(), vec!["b", "c", "taken"]);
    }
}
