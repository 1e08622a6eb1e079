mod read;
mod write;

pub use write::write_api;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;
use crate::graph::GraphInstance;
use crate::store::Store;

/// The environment graph.
pub const PRIMARY_GRAPH: &str = "primary";
/// The dependency graph.
pub const DEPENDENCY_GRAPH: &str = "dependency";

/// The recursive value type returned by every query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RangeStruct {
    Bool(bool),
    Str(String),
    List(Vec<RangeStruct>),
    Tuple(Vec<RangeStruct>),
    Object(BTreeMap<String, RangeStruct>),
}

impl RangeStruct {
    pub fn str(s: impl Into<String>) -> RangeStruct {
        RangeStruct::Str(s.into())
    }

    /// The contained strings of a List/Tuple of Str values, if that is what
    /// this value is.
    pub fn as_strings(&self) -> Option<Vec<String>> {
        match self {
            RangeStruct::List(items) | RangeStruct::Tuple(items) => items
                .iter()
                .map(|v| match v {
                    RangeStruct::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }
}

/// Compiles and evaluates range expressions. The compiler itself lives
/// outside this crate; the daemon installs one, everything else gets the
/// default which reports expressions unsupported.
pub trait ExprCompiler: Send + Sync {
    fn expand(&self, env: &str, expression: &str) -> CResult<RangeStruct>;
}

/// The default compiler seam: no expression support.
pub struct NullCompiler;

impl ExprCompiler for NullCompiler {
    fn expand(&self, _env: &str, expression: &str) -> CResult<RangeStruct> {
        Err(crate::error::Error::Value(format!(
            "range expression support not available: {}",
            expression
        )))
    }
}

/// The graph query and write surface.
///
/// Reads resolve against the currently selected wanted version (default
/// head). Writes route through [`write_api`] and a range transaction; on a
/// replicated daemon they arrive here from the paxos learner.
pub struct RangeAPI {
    store: Arc<Store>,
    compiler: Box<dyn ExprCompiler>,
    wanted_version: Option<u64>,
}

impl RangeAPI {
    pub fn new(store: Arc<Store>) -> RangeAPI {
        RangeAPI { store, compiler: Box::new(NullCompiler), wanted_version: None }
    }

    pub fn with_compiler(store: Arc<Store>, compiler: Box<dyn ExprCompiler>) -> RangeAPI {
        RangeAPI { store, compiler, wanted_version: None }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Selects the graph version reads resolve against; None returns to
    /// head. Returns false when the version cannot be selected.
    pub fn set_wanted_version(&mut self, version: Option<u64>) -> CResult<bool> {
        if let Some(v) = version {
            // Probe selectability against the primary graph before adopting.
            let mut primary = self.primary()?;
            if !primary.set_wanted_version(v)? {
                return Ok(false);
            }
        }
        self.wanted_version = version;
        Ok(true)
    }

    /// Opens the environment graph at the selected wanted version.
    pub fn primary(&self) -> CResult<GraphInstance> {
        self.graph(PRIMARY_GRAPH)
    }

    /// Opens the dependency graph at the selected wanted version.
    pub(crate) fn dependency(&self) -> CResult<GraphInstance> {
        self.graph(DEPENDENCY_GRAPH)
    }

    fn graph(&self, name: &str) -> CResult<GraphInstance> {
        let mut graph = GraphInstance::open(&self.store, name)?;
        if let Some(v) = self.wanted_version {
            // Version counters are per graph; a graph whose head is still
            // behind the selection reads at its own head.
            if !graph.set_wanted_version(v)? {
                log::debug!("graph {} cannot select version {}, reading at head", name, v);
            }
        }
        Ok(graph)
    }
}

/// The stored name of a cluster: `env#cluster`, unless the argument is
/// already qualified. Hosts are stored bare.
pub fn qualify(env: &str, cluster: &str) -> String {
    if cluster.contains('#') {
        cluster.to_string()
    } else {
        format!("{}#{}", env, cluster)
    }
}

/// Strips the `env#` qualifier, if present.
pub fn unqualify(name: &str) -> &str {
    match name.split_once('#') {
        Some((_, bare)) => bare,
        None => name,
    }
}
