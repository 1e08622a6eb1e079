use std::sync::Arc;

use crate::api::read::resolve_node;
use crate::api::{qualify, RangeAPI};
use crate::error::{CResult, Error};
use crate::graph::GraphInstance;
use crate::msg::{Request, RequestType};
use crate::node::Node;
use crate::record::NodeType;
use crate::txn::RangeTxn;

/// The signature shared by every write operation: positional string
/// arguments in, success out. Graph errors propagate so the learner can
/// encode them as result codes.
pub type WriteFn = fn(&RangeAPI, &[String]) -> CResult<bool>;

/// The write-API symbol table: maps a request's method name to its
/// operation. Every operation here routes through paxos when submitted via
/// the daemon.
pub fn write_api(method: &str) -> Option<WriteFn> {
    Some(match method {
        "create_env" => op_create_env,
        "remove_env" => op_remove_env,
        "add_cluster_to_env" => op_add_cluster_to_env,
        "remove_cluster_from_env" => op_remove_cluster_from_env,
        "add_host_to_cluster" => op_add_host_to_cluster,
        "remove_host_from_cluster" => op_remove_host_from_cluster,
        "add_node_ext_dependency" => op_add_node_ext_dependency,
        "remove_node_ext_dependency" => op_remove_node_ext_dependency,
        "update_node_tag" => op_update_node_tag,
        "delete_node_tag" => op_delete_node_tag,
        _ => return None,
    })
}

impl RangeAPI {
    /// Applies a captured write request: symbol-table dispatch inside one
    /// range transaction. This is the learner's and the replay path's entry
    /// point; the transaction records the request in the transaction log.
    pub fn apply_request(&self, req: &Request) -> CResult<bool> {
        let op = write_api(&req.method)
            .ok_or_else(|| Error::Value(format!("unknown write method: {}", req.method)))?;
        let txn = RangeTxn::begin(Arc::clone(self.store()), req.clone())?;
        let result = op(self, &req.args)?;
        txn.commit()?;
        Ok(result)
    }

    fn submit_local(&self, method: &str, args: &[&str]) -> CResult<bool> {
        let mut req = Request::new(RequestType::Request, method);
        req.args = args.iter().map(|a| a.to_string()).collect();
        self.apply_request(&req)
    }

    /// Creates an environment node.
    pub fn create_env(&self, env: &str) -> CResult<bool> {
        self.submit_local("create_env", &[env])
    }

    /// Removes an environment node; its history remains queryable.
    pub fn remove_env(&self, env: &str) -> CResult<bool> {
        self.submit_local("remove_env", &[env])
    }

    /// Adds a cluster under an environment, creating the cluster node when
    /// needed.
    pub fn add_cluster_to_env(&self, env: &str, cluster: &str) -> CResult<bool> {
        self.submit_local("add_cluster_to_env", &[env, cluster])
    }

    /// Detaches a cluster from its environment.
    pub fn remove_cluster_from_env(&self, env: &str, cluster: &str) -> CResult<bool> {
        self.submit_local("remove_cluster_from_env", &[env, cluster])
    }

    /// Adds a host under a cluster, creating the host node when needed.
    pub fn add_host_to_cluster(&self, env: &str, cluster: &str, host: &str) -> CResult<bool> {
        self.submit_local("add_host_to_cluster", &[env, cluster, host])
    }

    /// Detaches a host from a cluster.
    pub fn remove_host_from_cluster(
        &self,
        env: &str,
        cluster: &str,
        host: &str,
    ) -> CResult<bool> {
        self.submit_local("remove_host_from_cluster", &[env, cluster, host])
    }

    /// Records a dependency edge between two nodes in the dependency graph.
    pub fn add_node_ext_dependency(
        &self,
        env: &str,
        name: &str,
        dependency: &str,
    ) -> CResult<bool> {
        self.submit_local("add_node_ext_dependency", &[env, name, dependency])
    }

    /// Removes a dependency edge.
    pub fn remove_node_ext_dependency(
        &self,
        env: &str,
        name: &str,
        dependency: &str,
    ) -> CResult<bool> {
        self.submit_local("remove_node_ext_dependency", &[env, name, dependency])
    }

    /// Replaces the values of a tag on a node.
    pub fn update_node_tag(
        &self,
        env: &str,
        name: &str,
        key: &str,
        values: &[&str],
    ) -> CResult<bool> {
        let mut args = vec![env, name, key];
        args.extend_from_slice(values);
        self.submit_local("update_node_tag", &args)
    }

    /// Removes a tag from a node.
    pub fn delete_node_tag(&self, env: &str, name: &str, key: &str) -> CResult<bool> {
        self.submit_local("delete_node_tag", &[env, name, key])
    }
}

fn want_args(args: &[String], n: usize, method: &str) -> CResult<()> {
    if args.len() != n {
        return Err(Error::Value(format!(
            "incorrect number of arguments for {}: got {}, want {}",
            method,
            args.len(),
            n
        )));
    }
    Ok(())
}

fn env_node(graph: &GraphInstance, env: &str) -> CResult<Node> {
    match graph.get_node(env)? {
        Some(node) if node.node_type() == NodeType::Environment => Ok(node),
        _ => Err(Error::InvalidEnvironment(env.to_string())),
    }
}

fn op_create_env(api: &RangeAPI, args: &[String]) -> CResult<bool> {
    want_args(args, 1, "create_env")?;
    let env = &args[0];
    if env.contains('#') {
        return Err(Error::CreateNodeError(env.clone()));
    }
    let primary = api.primary()?;
    primary.create(env, NodeType::Environment)?;
    Ok(true)
}

fn op_remove_env(api: &RangeAPI, args: &[String]) -> CResult<bool> {
    want_args(args, 1, "remove_env")?;
    let env = &args[0];
    let primary = api.primary()?;
    env_node(&primary, env)?;
    primary.remove(env)?;
    Ok(true)
}

fn op_add_cluster_to_env(api: &RangeAPI, args: &[String]) -> CResult<bool> {
    want_args(args, 2, "add_cluster_to_env")?;
    let (env, cluster) = (&args[0], &args[1]);
    let primary = api.primary()?;
    let mut parent = env_node(&primary, env)?;

    let qualified = qualify(env, cluster);
    if primary.get_node(&qualified)?.is_none() {
        primary.create(&qualified, NodeType::Cluster)?;
    }
    if !parent.add_forward_edge(&qualified, true)? {
        return Err(Error::NodeExists(qualified));
    }
    Ok(true)
}

fn op_remove_cluster_from_env(api: &RangeAPI, args: &[String]) -> CResult<bool> {
    want_args(args, 2, "remove_cluster_from_env")?;
    let (env, cluster) = (&args[0], &args[1]);
    let primary = api.primary()?;
    let mut parent = env_node(&primary, env)?;

    let qualified = qualify(env, cluster);
    if primary.get_node(&qualified)?.is_none() {
        return Err(Error::NodeNotFound(qualified));
    }
    if !parent.remove_forward_edge(&qualified, true)? {
        return Err(Error::EdgeNotFound(format!("{} -> {}", env, qualified)));
    }
    Ok(true)
}

fn op_add_host_to_cluster(api: &RangeAPI, args: &[String]) -> CResult<bool> {
    want_args(args, 3, "add_host_to_cluster")?;
    let (env, cluster, host) = (&args[0], &args[1], &args[2]);
    let primary = api.primary()?;
    env_node(&primary, env)?;

    let qualified = qualify(env, cluster);
    let mut parent = primary
        .get_node(&qualified)?
        .ok_or_else(|| Error::NodeNotFound(qualified.clone()))?;
    if parent.node_type() != NodeType::Cluster {
        return Err(Error::IncorrectNodeType(format!(
            "{} is {}, not CLUSTER",
            qualified,
            parent.node_type()
        )));
    }

    match primary.get_node(host)? {
        Some(node) if node.node_type() != NodeType::Host => {
            return Err(Error::IncorrectNodeType(format!(
                "{} is {}, not HOST",
                host,
                node.node_type()
            )));
        }
        Some(_) => {}
        None => {
            primary.create(host, NodeType::Host)?;
        }
    }

    if !parent.add_forward_edge(host, true)? {
        return Err(Error::NodeExists(host.clone()));
    }
    Ok(true)
}

fn op_remove_host_from_cluster(api: &RangeAPI, args: &[String]) -> CResult<bool> {
    want_args(args, 3, "remove_host_from_cluster")?;
    let (env, cluster, host) = (&args[0], &args[1], &args[2]);
    let primary = api.primary()?;

    let qualified = qualify(env, cluster);
    let mut parent = primary
        .get_node(&qualified)?
        .ok_or_else(|| Error::NodeNotFound(qualified.clone()))?;
    if primary.get_node(host)?.is_none() {
        return Err(Error::NodeNotFound(host.clone()));
    }
    if !parent.remove_forward_edge(host, true)? {
        return Err(Error::EdgeNotFound(format!("{} -> {}", qualified, host)));
    }
    Ok(true)
}

/// Dependency-graph nodes mirror the primary graph by name; they are
/// created on demand with the primary node's type when it is known.
fn dependency_node(
    api: &RangeAPI,
    dep_graph: &GraphInstance,
    env: &str,
    name: &str,
) -> CResult<Node> {
    let primary = api.primary()?;
    let stored_name = match resolve_node(&primary, env, name)? {
        Some(node) => node.name().to_string(),
        None => return Err(Error::NodeNotFound(name.to_string())),
    };
    if let Some(node) = dep_graph.get_node(&stored_name)? {
        return Ok(node);
    }
    let node_type = primary
        .get_node(&stored_name)?
        .map(|n| n.node_type())
        .unwrap_or(NodeType::Unknown);
    dep_graph.create(&stored_name, node_type)
}

fn op_add_node_ext_dependency(api: &RangeAPI, args: &[String]) -> CResult<bool> {
    want_args(args, 3, "add_node_ext_dependency")?;
    let (env, name, dep) = (&args[0], &args[1], &args[2]);
    let dep_graph = api.dependency()?;

    let mut from = dependency_node(api, &dep_graph, env, name)?;
    let to = dependency_node(api, &dep_graph, env, dep)?;
    if !from.add_forward_edge(to.name(), true)? {
        return Err(Error::NodeExists(format!("{} -> {}", from.name(), to.name())));
    }
    Ok(true)
}

fn op_remove_node_ext_dependency(api: &RangeAPI, args: &[String]) -> CResult<bool> {
    want_args(args, 3, "remove_node_ext_dependency")?;
    let (env, name, dep) = (&args[0], &args[1], &args[2]);
    let dep_graph = api.dependency()?;
    let primary = api.primary()?;

    let from_name = match resolve_node(&primary, env, name)? {
        Some(node) => node.name().to_string(),
        None => return Err(Error::NodeNotFound(name.to_string())),
    };
    let to_name = match resolve_node(&primary, env, dep)? {
        Some(node) => node.name().to_string(),
        None => return Err(Error::NodeNotFound(dep.to_string())),
    };
    let mut from = dep_graph
        .get_node(&from_name)?
        .ok_or_else(|| Error::NodeNotFound(from_name.clone()))?;
    if !from.remove_forward_edge(&to_name, true)? {
        return Err(Error::EdgeNotFound(format!("{} -> {}", from_name, to_name)));
    }
    Ok(true)
}

fn op_update_node_tag(api: &RangeAPI, args: &[String]) -> CResult<bool> {
    if args.len() < 3 {
        return Err(Error::Value(format!(
            "incorrect number of arguments for update_node_tag: got {}, want at least 3",
            args.len()
        )));
    }
    let (env, name, key) = (&args[0], &args[1], &args[2]);
    let values: Vec<String> = args[3..].to_vec();
    let primary = api.primary()?;
    let mut node = resolve_node(&primary, env, name)?
        .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
    node.update_tag(key, &values)
}

fn op_delete_node_tag(api: &RangeAPI, args: &[String]) -> CResult<bool> {
    want_args(args, 3, "delete_node_tag")?;
    let (env, name, key) = (&args[0], &args[1], &args[2]);
    let primary = api.primary()?;
    let mut node = resolve_node(&primary, env, name)?
        .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
    if !node.delete_tag(key)? {
        return Err(Error::Value(format!("tag {} not found on {}", key, name)));
    }
    Ok(true)
}
