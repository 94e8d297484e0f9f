use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crewflow_core::error::Result;

/// A named function callable from `function` steps.
///
/// Receives a copy of the flow state and the step's config; returns a partial
/// map that is merged back into the state.
pub trait StepFunction: Send + Sync + 'static {
    fn call(
        &self,
        state: Map<String, Value>,
        config: Map<String, Value>,
    ) -> BoxFuture<'_, Result<Map<String, Value>>>;
}

/// Adapter for plain synchronous closures.
struct FnStepFunction<F>(F);

impl<F> StepFunction for FnStepFunction<F>
where
    F: Fn(&Map<String, Value>, &Map<String, Value>) -> Result<Map<String, Value>>
        + Send
        + Sync
        + 'static,
{
    fn call(
        &self,
        state: Map<String, Value>,
        config: Map<String, Value>,
    ) -> BoxFuture<'_, Result<Map<String, Value>>> {
        let result = (self.0)(&state, &config);
        Box::pin(async move { result })
    }
}

/// Registry of functions available to `function` steps.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn StepFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn StepFunction>) {
        self.functions.insert(name.into(), function);
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Map<String, Value>, &Map<String, Value>) -> Result<Map<String, Value>>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Arc::new(FnStepFunction(f)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
