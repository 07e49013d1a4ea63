//! Catalog of named components with dependency resolution.
//!
//! The registry exclusively owns component records; lifecycle drivers take
//! a snapshot under the lock, release it, then do their work against the
//! snapshot. No registry operation performs I/O or awaits.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::component::{
    ComponentContext, ComponentObject, ComponentStatusInfo, HealthReport, Status,
};
use crate::config::Config;

/// Error type for registry and lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A component with this name is already registered.
    DuplicateName(String),
    /// A declared dependency is unregistered or self-referential.
    InvalidDependency { component: String, dependency: String },
    /// The component is absent, or present but not `Running`.
    NotFound(String),
    /// The dependency graph contains a cycle; the path names it.
    CyclicDependency(Vec<String>),
    /// Restart refused because dependents are still running.
    DependentsRunning { component: String, dependents: Vec<String> },
    /// The state machine does not admit this transition.
    InvalidTransition { component: String, from: Status, to: Status },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateName(name) => {
                write!(f, "component '{name}' is already registered")
            }
            RegistryError::InvalidDependency { component, dependency } => write!(
                f,
                "component '{component}' declares invalid dependency '{dependency}'"
            ),
            RegistryError::NotFound(name) => {
                write!(f, "component '{name}' is not registered or not running")
            }
            RegistryError::CyclicDependency(cycle) => {
                write!(f, "cyclic dependency: {}", cycle.join(" -> "))
            }
            RegistryError::DependentsRunning { component, dependents } => write!(
                f,
                "cannot restart '{component}' while dependents are running: {}",
                dependents.join(", ")
            ),
            RegistryError::InvalidTransition { component, from, to } => write!(
                f,
                "component '{component}': invalid transition {} -> {}",
                from.as_str(),
                to.as_str()
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

struct Entry {
    component: Arc<dyn ComponentObject>,
    status: Status,
    health: HealthReport,
    /// Immutable snapshot taken at the most recent initialization; restarts
    /// re-initialize with this exact snapshot.
    config: Option<Arc<Config>>,
}

/// Thread-safe catalog of named components.
#[derive(Default)]
pub struct ComponentRegistry {
    inner: RwLock<HashMap<String, Entry>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component. Fails with `DuplicateName` when the name is
    /// taken, `InvalidDependency` when a declared dependency is missing or
    /// self-referential.
    pub fn register(&self, component: Arc<dyn ComponentObject>) -> Result<(), RegistryError> {
        let name = component.name().to_string();
        let deps = component.dependencies();
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        for dep in &deps {
            if *dep == name || !inner.contains_key(dep) {
                return Err(RegistryError::InvalidDependency {
                    component: name,
                    dependency: dep.clone(),
                });
            }
        }
        inner.insert(
            name,
            Entry {
                component,
                status: Status::Unknown,
                health: HealthReport::healthy(),
                config: None,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Fetch a running component's handle. `NotFound` covers both absence
    /// and a component that has not reached `Running`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ComponentObject>, RegistryError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        match inner.get(name) {
            Some(entry) if entry.status == Status::Running => Ok(entry.component.clone()),
            _ => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    /// Fetch a handle regardless of lifecycle phase (lifecycle driver use).
    pub fn get_any(&self, name: &str) -> Result<Arc<dyn ComponentObject>, RegistryError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .get(name)
            .map(|e| e.component.clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    pub fn status(&self, name: &str) -> Result<Status, RegistryError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .get(name)
            .map(|e| e.status)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Drive one state-machine transition, enforcing admissibility.
    pub fn transition(&self, name: &str, to: Status) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let entry = inner
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if !entry.status.can_transition(to) {
            return Err(RegistryError::InvalidTransition {
                component: name.to_string(),
                from: entry.status,
                to,
            });
        }
        entry.status = to;
        Ok(())
    }

    /// Mark a component permanently retired. `Destroyed` is terminal; the
    /// record stays visible to the admin surface but admits no further
    /// transitions.
    pub fn destroy(&self, name: &str) -> Result<(), RegistryError> {
        self.transition(name, Status::Destroyed)
    }

    pub fn set_health(&self, name: &str, health: HealthReport) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let entry = inner
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        entry.health = health;
        Ok(())
    }

    pub fn health(&self, name: &str) -> Result<HealthReport, RegistryError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .get(name)
            .map(|e| e.health.clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Record the config snapshot used for the current initialization.
    pub fn set_config_snapshot(&self, name: &str, config: Arc<Config>) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let entry = inner
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        entry.config = Some(config);
        Ok(())
    }

    /// The last-known config snapshot, for restarts.
    pub fn config_snapshot(&self, name: &str) -> Option<Arc<Config>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.get(name).and_then(|e| e.config.clone())
    }

    /// Context for (re-)initializing `name`: the stored snapshot, or
    /// `fallback` on first initialization.
    pub fn init_context(&self, name: &str, fallback: &Arc<Config>) -> ComponentContext {
        let snapshot = self.config_snapshot(name).unwrap_or_else(|| fallback.clone());
        ComponentContext::new(snapshot)
    }

    /// Direct dependents of `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut result: Vec<String> = inner
            .iter()
            .filter(|(_, e)| e.component.dependencies().iter().any(|d| d == name))
            .map(|(n, _)| n.clone())
            .collect();
        result.sort();
        result
    }

    /// All transitive dependents of `name`, in breadth-first order.
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        let mut result = Vec::new();
        while let Some(current) = queue.pop_front() {
            for dep in self.dependents_of(&current) {
                if seen.insert(dep.clone()) {
                    result.push(dep.clone());
                    queue.push_back(dep);
                }
            }
        }
        result
    }

    /// Names currently registered, sorted.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut names: Vec<String> = inner.keys().cloned().collect();
        names.sort();
        names
    }

    /// Admin snapshot of every component.
    pub fn statuses(&self) -> Vec<ComponentStatusInfo> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut result: Vec<ComponentStatusInfo> = inner
            .iter()
            .map(|(name, e)| ComponentStatusInfo {
                name: name.clone(),
                version: e.component.version().to_string(),
                dependencies: e.component.dependencies(),
                status: e.status.as_str().to_string(),
                health: e.health.clone(),
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    /// Compute topological waves over the dependency DAG: wave `k` holds
    /// the components whose dependencies all sit in earlier waves.
    /// Components within a wave are sorted by name, which makes start
    /// order deterministic. Fails with `CyclicDependency` naming the cycle.
    pub fn topo_waves(&self) -> Result<Vec<Vec<String>>, RegistryError> {
        let graph: HashMap<String, Vec<String>> = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .iter()
                .map(|(n, e)| (n.clone(), e.component.dependencies()))
                .collect()
        };

        let mut remaining: HashSet<String> = graph.keys().cloned().collect();
        let mut placed: HashSet<String> = HashSet::new();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let mut wave: Vec<String> = remaining
                .iter()
                .filter(|name| {
                    graph[*name]
                        .iter()
                        // Deps removed by unregister no longer gate waves.
                        .all(|d| placed.contains(d) || !graph.contains_key(d))
                })
                .cloned()
                .collect();
            if wave.is_empty() {
                return Err(RegistryError::CyclicDependency(find_cycle(&graph)));
            }
            wave.sort();
            for name in &wave {
                remaining.remove(name);
                placed.insert(name.clone());
            }
            waves.push(wave);
        }
        Ok(waves)
    }
}

/// Locate one cycle in the graph for the error message.
fn find_cycle(graph: &HashMap<String, Vec<String>>) -> Vec<String> {
    fn visit(
        node: &str,
        graph: &HashMap<String, Vec<String>>,
        stack: &mut Vec<String>,
        on_stack: &mut HashSet<String>,
        done: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        stack.push(node.to_string());
        on_stack.insert(node.to_string());
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                if done.contains(dep) || !graph.contains_key(dep) {
                    continue;
                }
                if on_stack.contains(dep) {
                    let start = stack.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                if let Some(cycle) = visit(dep, graph, stack, on_stack, done) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        on_stack.remove(node);
        done.insert(node.to_string());
        None
    }

    let mut names: Vec<&String> = graph.keys().collect();
    names.sort();
    let mut done = HashSet::new();
    for name in names {
        if done.contains(name) {
            continue;
        }
        let mut stack = Vec::new();
        let mut on_stack = HashSet::new();
        if let Some(cycle) = visit(name, graph, &mut stack, &mut on_stack, &mut done) {
            return cycle;
        }
    }
    Vec::new()
}
