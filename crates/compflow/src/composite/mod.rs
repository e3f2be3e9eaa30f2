//! Composite graphs: one root operation plus the operations it owns.
//!
//! A [`CompositeGraph`] is the unit callers compile, evaluate, differentiate and serialize.
//! It owns the set of operations reachable from its root (the records themselves live in
//! the shared [`GraphArena`]), caches its input list, lazily builds an executable network
//! through the [`PortableBackend`], and keeps that network consistent with the symbolic
//! graph across placeholder substitution.
//!
//! ## Staleness
//!
//! Every rewiring in the arena bumps its structure version. A composite remembers the
//! version it last observed; when the arena has moved on (because this composite or
//! another one sharing the arena substituted placeholders) it re-collects from its root,
//! recomputes its inputs, drops the compiled network and clears its dependency cache
//! before doing anything else.

mod compile;
mod evaluate;
mod serialize;
mod storage;

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use lru::LruCache;
use tracing::debug;

use crate::backend::spec::{Device, PortableBackend};
use crate::env;
use crate::error::{GraphError, Result, StructuralError, UsageError};
use crate::graph::traversal::{leaf_ids, operation_ids_postorder, variables_feeding};
use crate::graph::{collect_ids, GraphArena, Operation, OperationId, Variable, VariableKind};
use crate::profiling;

pub use evaluate::BackpropState;
pub use serialize::{CURRENT_VERSION, DOCUMENT_TYPE};

use compile::ExecutionGraph;
use storage::StorageTracker;

static COMPOSITE_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

const DEFAULT_DEPENDENCY_CACHE_CAPACITY: usize = 64;

/// Per-composite knobs. Defaults come from the `COMPFLOW_*` environment flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeOptions {
    eager_allocation: bool,
    lenient_arguments: bool,
    dependency_cache_capacity: NonZeroUsize,
}

impl Default for CompositeOptions {
    fn default() -> Self {
        CompositeOptions {
            eager_allocation: env::eager_alloc_enabled(),
            lenient_arguments: env::lenient_arguments_enabled(),
            dependency_cache_capacity: NonZeroUsize::new(DEFAULT_DEPENDENCY_CACHE_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl CompositeOptions {
    /// Allocate network storage when [`CompositeGraph::compile`] runs rather than on the
    /// first forward.
    pub fn with_eager_allocation(mut self, enabled: bool) -> Self {
        self.eager_allocation = enabled;
        self
    }

    /// Ignore forward arguments that are not inputs of the graph instead of failing.
    pub fn with_lenient_arguments(mut self, enabled: bool) -> Self {
        self.lenient_arguments = enabled;
        self
    }

    /// Number of outputs whose argument dependencies are remembered.
    pub fn with_dependency_cache_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.dependency_cache_capacity = capacity;
        self
    }

    pub fn eager_allocation(&self) -> bool {
        self.eager_allocation
    }

    pub fn lenient_arguments(&self) -> bool {
        self.lenient_arguments
    }
}

pub struct CompositeGraph<B: PortableBackend> {
    id: usize,
    uid: String,
    name: String,
    root: Operation,
    backend: Arc<B>,
    options: CompositeOptions,
    owned: HashSet<OperationId>,
    inputs: Vec<Variable>,
    observed_structure: u64,
    execution: Option<ExecutionGraph<B::Network>>,
    builds: u64,
    dependencies: LruCache<Variable, Arc<[Variable]>>,
    storage: StorageTracker,
    generation: u64,
    evaluated: HashMap<crate::graph::VariableId, u64>,
}

impl<B: PortableBackend> CompositeGraph<B> {
    /// Wraps `root` and takes ownership of every operation reachable from it.
    pub fn create(root: Operation, backend: Arc<B>) -> Result<Self> {
        Self::create_with_options(root, backend, CompositeOptions::default())
    }

    pub fn create_with_options(
        root: Operation,
        backend: Arc<B>,
        options: CompositeOptions,
    ) -> Result<Self> {
        Self::assemble(root, backend, options, None, String::new())
    }

    pub(crate) fn assemble(
        root: Operation,
        backend: Arc<B>,
        options: CompositeOptions,
        uid: Option<String>,
        name: String,
    ) -> Result<Self> {
        if root.outputs().is_empty() {
            return Err(StructuralError::RootWithoutOutputs {
                operation: root.label(),
            }
            .into());
        }
        let arena = Arc::clone(root.arena());
        let uid = arena.claim_uid(uid, "CompositeGraph");
        let observed_structure = arena.structure_version();
        let owned = collect_ids(&arena, root.id());
        let capacity = options.dependency_cache_capacity;
        let mut graph = CompositeGraph {
            id: COMPOSITE_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed),
            uid,
            name,
            root,
            backend,
            options,
            owned,
            inputs: Vec::new(),
            observed_structure,
            execution: None,
            builds: 0,
            dependencies: LruCache::new(capacity),
            storage: StorageTracker::default(),
            generation: 0,
            evaluated: HashMap::new(),
        };
        graph.inputs = graph.determine_inputs();
        debug!(
            composite = %graph.uid,
            operations = graph.owned.len(),
            inputs = graph.inputs.len(),
            "created composite graph"
        );
        Ok(graph)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn root(&self) -> &Operation {
        &self.root
    }

    pub fn arena(&self) -> &Arc<GraphArena> {
        self.root.arena()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn options(&self) -> &CompositeOptions {
        &self.options
    }

    pub fn outputs(&self) -> Vec<Variable> {
        self.root.outputs()
    }

    /// Every non-output variable the graph reads, deduplicated in first-seen pre-order.
    pub fn inputs(&self) -> Vec<Variable> {
        if self.arena().structure_version() == self.observed_structure {
            self.inputs.clone()
        } else {
            self.determine_inputs()
        }
    }

    /// Inputs a caller supplies per evaluation: inputs and unresolved placeholders.
    pub fn arguments(&self) -> Vec<Variable> {
        self.inputs_of_kind(&[VariableKind::Input, VariableKind::Placeholder])
    }

    pub fn parameters(&self) -> Vec<Variable> {
        self.inputs_of_kind(&[VariableKind::Parameter])
    }

    pub fn constants(&self) -> Vec<Variable> {
        self.inputs_of_kind(&[VariableKind::Constant])
    }

    pub fn placeholders(&self) -> Vec<Variable> {
        self.inputs_of_kind(&[VariableKind::Placeholder])
    }

    fn inputs_of_kind(&self, kinds: &[VariableKind]) -> Vec<Variable> {
        self.inputs()
            .into_iter()
            .filter(|var| kinds.contains(&var.kind()))
            .collect()
    }

    /// The owned operation set.
    pub fn owned_operations(&self) -> HashSet<Operation> {
        self.owned
            .iter()
            .map(|id| Operation::from_parts(Arc::clone(self.arena()), *id))
            .collect()
    }

    pub fn owns(&self, op: &Operation) -> bool {
        Arc::ptr_eq(op.arena(), self.arena()) && self.owned.contains(&op.id())
    }

    /// Whether a network is currently compiled for this graph.
    pub fn is_compiled(&self) -> bool {
        self.execution.is_some() && self.arena().structure_version() == self.observed_structure
    }

    /// Number of times a network has been built for this graph.
    pub fn network_builds(&self) -> u64 {
        self.builds
    }

    fn determine_inputs(&self) -> Vec<Variable> {
        leaf_ids(self.arena(), self.root.id())
            .into_iter()
            .map(|id| Variable::from_parts(Arc::clone(self.arena()), id))
            .collect()
    }

    /// Whether `var` is produced by an operation this graph owns.
    fn produces(&self, var: &Variable) -> bool {
        var.owner().is_some_and(|op| self.owns(&op))
    }

    /// Resynchronizes with the arena after a rewiring anywhere in it.
    fn refresh_structure(&mut self) {
        let current = self.arena().structure_version();
        if current == self.observed_structure {
            return;
        }
        let reachable = collect_ids(self.arena(), self.root.id());
        self.owned.extend(reachable);
        self.observed_structure = current;
        self.inputs = self.determine_inputs();
        self.invalidate("graph structure changed");
    }

    fn invalidate(&mut self, reason: &'static str) {
        self.dependencies.clear();
        self.evaluated.clear();
        if self.execution.take().is_some() {
            profiling::cache_event("network_invalidated");
            debug!(composite = %self.uid, reason, "discarded compiled network");
        }
    }

    /// Substitutes placeholders of this graph.
    ///
    /// Every input slot of an owned operation that references a key is rewired to the
    /// mapped variable in one pass. When a replacement is the output of another operation,
    /// everything reachable from that operation joins the owned set. Any compiled network
    /// is discarded and output shapes are re-inferred.
    pub fn replace_placeholders(&mut self, replacements: &HashMap<Variable, Variable>) -> Result<()> {
        self.refresh_structure();
        if replacements.is_empty() {
            return Ok(());
        }
        let arena = Arc::clone(self.arena());
        let placeholders = self.placeholders();
        let mut mapping = HashMap::with_capacity(replacements.len());
        for (placeholder, replacement) in replacements {
            for var in [placeholder, replacement] {
                if !var.same_arena(&arena) {
                    return Err(StructuralError::ForeignArena {
                        variable: var.label(),
                    }
                    .into());
                }
            }
            if !placeholders.contains(placeholder) {
                return Err(UsageError::NotAPlaceholder {
                    variable: placeholder.label(),
                }
                .into());
            }
            check_replacement(placeholder, replacement)?;
            mapping.insert(placeholder.id(), replacement.id());
        }

        let owned: Vec<OperationId> = self.owned.iter().copied().collect();
        let rewired = arena.rewire(&owned, &mapping);
        let version = arena.bump_structure();
        for replacement in replacements.values() {
            if let Some(owner) = replacement.owner() {
                self.owned.extend(collect_ids(&arena, owner.id()));
            }
        }
        self.observed_structure = version;
        self.inputs = self.determine_inputs();
        self.invalidate("placeholders replaced");
        debug!(
            composite = %self.uid,
            replaced = replacements.len(),
            rewired,
            operations = self.owned.len(),
            "replaced placeholders"
        );
        self.infer_outputs()?;
        Ok(())
    }

    /// Re-runs shape inference over the whole graph and returns the root outputs.
    pub fn infer_outputs(&mut self) -> Result<Vec<Variable>> {
        self.refresh_structure();
        let arena = Arc::clone(self.arena());
        for op in operation_ids_postorder(&arena, self.root.id()) {
            arena.infer_operation(op)?;
        }
        Ok(self.root.outputs())
    }

    /// Builds the network for every root output ahead of the first forward.
    ///
    /// Storage is allocated right away when eager allocation is enabled.
    pub fn compile(&mut self, device: Device) -> Result<()> {
        let outputs = self.root.outputs();
        let excluded = self
            .execution
            .as_ref()
            .map(|execution| execution.excluded.clone())
            .unwrap_or_default();
        let allocate = self.options.eager_allocation;
        let execution = self.checkout_network(device, &outputs, &excluded, allocate)?;
        self.execution = Some(execution);
        Ok(())
    }

    /// Leaf inputs that `output` depends on, memoized per output.
    fn argument_dependencies(&mut self, output: &Variable) -> Arc<[Variable]> {
        if let Some(hit) = self.dependencies.get(output) {
            profiling::cache_event("dependency_cache_hit");
            return Arc::clone(hit);
        }
        profiling::cache_event("dependency_cache_miss");
        let arena = Arc::clone(self.arena());
        let dependencies: Arc<[Variable]> = variables_feeding(&arena, output.id())
            .into_iter()
            .map(|id| Variable::from_parts(Arc::clone(&arena), id))
            .filter(|var| var.kind() == VariableKind::Input)
            .collect();
        self.dependencies
            .put(output.clone(), Arc::clone(&dependencies));
        dependencies
    }
}

fn check_replacement(placeholder: &Variable, replacement: &Variable) -> Result<()> {
    let compatible = placeholder.dtype() == replacement.dtype()
        && match (placeholder.shape(), replacement.shape()) {
            (Some(expected), Some(found)) => expected == found,
            _ => true,
        };
    if compatible {
        return Ok(());
    }
    Err(GraphError::Structural(StructuralError::ShapeMismatch {
        operation: "replace_placeholders".to_string(),
        detail: format!(
            "{} ({:?}, {:?}) cannot replace {} ({:?}, {:?})",
            replacement.label(),
            replacement.shape().map(|s| s.to_string()),
            replacement.dtype(),
            placeholder.label(),
            placeholder.shape().map(|s| s.to_string()),
            placeholder.dtype(),
        ),
    }))
}
