use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert =
        |name: &str, provider: &str, capabilities: &[&str], context_window: Option<u64>| {
            map.insert(
                name.to_string(),
                ModelSpec {
                    name: name.to_string(),
                    provider: provider.to_string(),
                    capabilities: capabilities
                        .iter()
                        .map(|item| (*item).to_string())
                        .collect(),
                    context_window,
                },
            );
        };

    insert("gpt-4o", "openai", &["text", "vision"], Some(128000));
    insert("gpt-4o-mini", "openai", &["text", "vision"], Some(128000));
    insert(
        "gpt-4-vision-preview",
        "openai",
        &["text", "vision"],
        Some(128000),
    );

    map
}

#[cfg(test)]
mod tests {
    use super::ModelRegistry;

    #[test]
    fn default_registry_leads_with_gpt_4o() {
        let registry = ModelRegistry::new(None);
        let first = registry.list().next().map(|model| model.name.clone());
        assert_eq!(first.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn ensure_checks_capability() {
        let registry = ModelRegistry::new(None);
        assert!(registry.ensure("gpt-4o-mini", "vision").is_some());
        assert!(registry.ensure("gpt-4o-mini", "audio").is_none());
        assert!(registry.ensure("no-such-model", "vision").is_none());
    }

    #[test]
    fn by_capability_preserves_insertion_order() {
        let registry = ModelRegistry::new(None);
        let names: Vec<String> = registry
            .by_capability("vision")
            .into_iter()
            .map(|model| model.name)
            .collect();
        assert_eq!(names, vec!["gpt-4o", "gpt-4o-mini", "gpt-4-vision-preview"]);
    }
}
