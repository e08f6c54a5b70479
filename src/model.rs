//! Model code itself is out of scope (spec §1): this module only defines
//! the capability-set interface the dispatch core binds to (`ModelClass`),
//! the per-stage input-selection rule (`InputMap`), and the `pack_inputs`
//! helper that orders references the way workers unmarshal them.

use std::sync::Arc;

use crate::store::{ObjectRef, StoredValue};

/// Whether a tenant's model executes natively on a worker or only issues an
/// opaque accelerator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Native,
    Kaas,
}

/// Selects, for one pipeline stage, which references to draw from constants,
/// the original request inputs, and prior-stage outputs, and in what order.
#[derive(Debug, Clone, Default)]
pub struct InputMap {
    pub use_const: bool,
    pub use_inp: bool,
    pub use_pre: bool,
    pub use_run: bool,
}

impl InputMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn const_only() -> Self {
        Self {
            use_const: true,
            ..Self::default()
        }
    }

    pub fn with_inp(mut self) -> Self {
        self.use_inp = true;
        self
    }

    pub fn with_pre(mut self) -> Self {
        self.use_pre = true;
        self
    }

    pub fn with_run(mut self) -> Self {
        self.use_run = true;
        self
    }
}

/// Pack references for one stage in `constants ++ stage-selected references`
/// order, matching how workers split the variadic tail using `n_const`.
pub fn pack_inputs(
    map: &InputMap,
    const_refs: &[ObjectRef],
    inp: &[ObjectRef],
    pre: &[ObjectRef],
    run: &[ObjectRef],
) -> Vec<ObjectRef> {
    let mut out = Vec::new();
    if map.use_const {
        out.extend_from_slice(const_refs);
    }
    if map.use_inp {
        out.extend_from_slice(inp);
    }
    if map.use_pre {
        out.extend_from_slice(pre);
    }
    if map.use_run {
        out.extend_from_slice(run);
    }
    out
}

/// The capability set a tenant's model must provide. Implemented by model
/// code outside this crate; a deterministic test double lives in
/// `model::testing` for unit and integration tests.
pub trait ModelClass: Send + Sync + std::fmt::Debug {
    fn pre(&self, args: Vec<StoredValue>) -> anyhow::Result<Vec<StoredValue>>;
    fn run(&self, args: Vec<StoredValue>, stats: Option<&mut crate::stats::ProfCollection>) -> anyhow::Result<Vec<StoredValue>>;
    fn post(&self, args: Vec<StoredValue>) -> anyhow::Result<Vec<StoredValue>>;

    fn pre_map(&self) -> InputMap;
    fn run_map(&self) -> InputMap;
    fn post_map(&self) -> InputMap;

    fn n_const(&self) -> usize;
    fn n_out_pre(&self) -> usize;
    fn n_out_run(&self) -> usize;
    fn n_out_post(&self) -> usize;
    fn no_post(&self) -> bool;
    fn model_type(&self) -> ModelType;

    /// Build a KaaS request from the packed run-stage inputs. Only called
    /// when `model_type() == ModelType::Kaas`.
    fn build_kaas_request(&self, _run_inputs: Vec<StoredValue>) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("model does not support kaas request construction")
    }
}

/// A factory that instantiates a `ModelClass` for one tenant, given the
/// tenant's model argument (a value for KaaS, a reference for native).
pub type ModelClassFactory = Arc<dyn Fn(StoredValue) -> Arc<dyn ModelClass> + Send + Sync>;

/// Immutable per-tenant model registration, created once and stored by
/// reference in the object store.
#[derive(Clone)]
pub struct ModelSpec {
    pub model_type: ModelType,
    pub model_path: std::path::PathBuf,
    pub data_dir: std::path::PathBuf,
    pub loader: ModelClassFactory,
}

impl std::fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSpec")
            .field("model_type", &self.model_type)
            .field("model_path", &self.model_path)
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

impl ModelSpec {
    pub fn instantiate(&self, arg: StoredValue) -> Arc<dyn ModelClass> {
        (self.loader)(arg)
    }
}

/// A minimal always-available model used by the CLI's demo subcommands.
/// Real deployments supply their own `ModelClass` implementation; model
/// code itself is out of scope for this crate (see crate docs).
pub mod demo {
    use super::*;

    /// Passes its input straight through every stage with no
    /// transformation, skipping the post stage entirely.
    #[derive(Debug, Default)]
    pub struct EchoModel;

    impl ModelClass for EchoModel {
        fn pre(&self, args: Vec<StoredValue>) -> anyhow::Result<Vec<StoredValue>> {
            Ok(args)
        }

        fn run(&self, args: Vec<StoredValue>, stats: Option<&mut crate::stats::ProfCollection>) -> anyhow::Result<Vec<StoredValue>> {
            let _timer = crate::stats::Timer::new("t_model_run", stats);
            Ok(args)
        }

        fn post(&self, args: Vec<StoredValue>) -> anyhow::Result<Vec<StoredValue>> {
            Ok(args)
        }

        fn pre_map(&self) -> InputMap {
            InputMap::new().with_inp()
        }
        fn run_map(&self) -> InputMap {
            InputMap::new().with_pre()
        }
        fn post_map(&self) -> InputMap {
            InputMap::new().with_run()
        }

        fn n_const(&self) -> usize {
            0
        }
        fn n_out_pre(&self) -> usize {
            1
        }
        fn n_out_run(&self) -> usize {
            1
        }
        fn n_out_post(&self) -> usize {
            1
        }
        fn no_post(&self) -> bool {
            true
        }
        fn model_type(&self) -> ModelType {
            ModelType::Native
        }

        fn build_kaas_request(&self, run_inputs: Vec<StoredValue>) -> anyhow::Result<Vec<u8>> {
            match run_inputs.first() {
                Some(StoredValue::Bytes(b)) => Ok((**b).clone()),
                _ => Ok(Vec::new()),
            }
        }
    }

    pub fn echo_model_spec() -> ModelSpec {
        ModelSpec {
            model_type: ModelType::Native,
            model_path: std::path::PathBuf::from("builtin:echo"),
            data_dir: std::path::PathBuf::new(),
            loader: Arc::new(|_arg| Arc::new(EchoModel)),
        }
    }
}

/// Deterministic test doubles used by unit tests and integration tests.
pub mod testing {
    use super::*;
    use crate::stats::ProfCollection;

    /// A model with `pre`/`run`/`post` each taking one input and returning
    /// one output, doubling the byte value at each stage so tests can
    /// assert on the exact transformation applied.
    #[derive(Debug, Default)]
    pub struct DoublingModel {
        pub no_post: bool,
        pub model_type: ModelType2,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub enum ModelType2 {
        #[default]
        Native,
        Kaas,
    }

    fn double(v: &StoredValue) -> StoredValue {
        match v {
            StoredValue::Bytes(b) => {
                let doubled: Vec<u8> = b.iter().map(|x| x.wrapping_mul(2)).collect();
                StoredValue::Bytes(std::sync::Arc::new(doubled))
            }
            other => other.clone(),
        }
    }

    impl ModelClass for DoublingModel {
        fn pre(&self, args: Vec<StoredValue>) -> anyhow::Result<Vec<StoredValue>> {
            Ok(args.iter().map(double).collect())
        }

        fn run(&self, args: Vec<StoredValue>, stats: Option<&mut ProfCollection>) -> anyhow::Result<Vec<StoredValue>> {
            let _timer = crate::stats::Timer::new("t_model_run", stats);
            Ok(args.iter().map(double).collect())
        }

        fn post(&self, args: Vec<StoredValue>) -> anyhow::Result<Vec<StoredValue>> {
            Ok(args.iter().map(double).collect())
        }

        fn pre_map(&self) -> InputMap {
            InputMap::new().with_inp()
        }

        fn run_map(&self) -> InputMap {
            InputMap::new().with_pre()
        }

        fn post_map(&self) -> InputMap {
            InputMap::new().with_run()
        }

        fn n_const(&self) -> usize {
            0
        }
        fn n_out_pre(&self) -> usize {
            1
        }
        fn n_out_run(&self) -> usize {
            1
        }
        fn n_out_post(&self) -> usize {
            1
        }
        fn no_post(&self) -> bool {
            self.no_post
        }
        fn model_type(&self) -> ModelType {
            match self.model_type {
                ModelType2::Native => ModelType::Native,
                ModelType2::Kaas => ModelType::Kaas,
            }
        }

        fn build_kaas_request(&self, run_inputs: Vec<StoredValue>) -> anyhow::Result<Vec<u8>> {
            match run_inputs.first() {
                Some(StoredValue::Bytes(b)) => Ok((**b).clone()),
                _ => Ok(Vec::new()),
            }
        }
    }

    pub fn doubling_model_spec(no_post: bool, kaas: bool) -> ModelSpec {
        ModelSpec {
            model_type: if kaas { ModelType::Kaas } else { ModelType::Native },
            model_path: std::path::PathBuf::from("/test/model"),
            data_dir: std::path::PathBuf::from("/test/data"),
            loader: Arc::new(move |_arg| {
                Arc::new(DoublingModel {
                    no_post,
                    model_type: if kaas { ModelType2::Kaas } else { ModelType2::Native },
                })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_inputs_orders_const_then_stage_selections() {
        let store = crate::store::InMemoryObjectStore::new();
        let c = store.put_bytes(vec![0]);
        let i = store.put_bytes(vec![1]);
        let p = store.put_bytes(vec![2]);
        let map = InputMap::new().with_inp().with_pre();
        let packed = pack_inputs(&map, &[c.clone()], &[i.clone()], &[p.clone()], &[]);
        assert_eq!(packed, vec![c, i, p]);
    }
}
