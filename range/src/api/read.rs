use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::api::{qualify, unqualify, RangeAPI, RangeStruct};
use crate::error::{CResult, Error};
use crate::graph::GraphInstance;
use crate::node::Node;
use crate::record::NodeType;

impl RangeAPI {
    /// Names of every environment node.
    pub fn all_environments(&self) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let mut envs = Vec::new();
        for node in primary.nodes()? {
            if node.node_type() == NodeType::Environment {
                envs.push(RangeStruct::str(node.name()));
            }
        }
        Ok(RangeStruct::List(envs))
    }

    /// Names of every cluster reachable from the environment, unqualified.
    pub fn all_clusters(&self, env: &str) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let root = primary
            .get_node(env)?
            .ok_or_else(|| Error::NodeNotFound(env.to_string()))?;

        let mut clusters = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = root.forward_edges().into();
        while let Some(name) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            if let Some(node) = primary.get_node(&name)? {
                if node.node_type() == NodeType::Cluster {
                    clusters.push(RangeStruct::str(unqualify(&name)));
                    queue.extend(node.forward_edges());
                }
            }
        }
        Ok(RangeStruct::List(clusters))
    }

    /// Names of every host node.
    pub fn all_hosts(&self) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let mut hosts = Vec::new();
        for node in primary.nodes()? {
            if node.node_type() == NodeType::Host {
                hosts.push(RangeStruct::str(node.name()));
            }
        }
        Ok(RangeStruct::List(hosts))
    }

    /// One level of forward-edge children of a node, unqualified.
    pub fn simple_expand(&self, env: &str, name: &str) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let node = resolve_node(&primary, env, name)?
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
        Ok(RangeStruct::List(
            node.forward_edges().iter().map(|n| RangeStruct::str(unqualify(n))).collect(),
        ))
    }

    /// One level of children of a cluster.
    pub fn simple_expand_cluster(&self, env: &str, cluster: &str) -> CResult<RangeStruct> {
        self.simple_expand(env, &qualify(env, cluster))
    }

    /// One level of children of an environment.
    pub fn simple_expand_env(&self, env: &str) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let node = primary
            .get_node(env)?
            .ok_or_else(|| Error::InvalidEnvironment(env.to_string()))?;
        Ok(RangeStruct::List(
            node.forward_edges().iter().map(|n| RangeStruct::str(unqualify(n))).collect(),
        ))
    }

    /// Recursive expansion of a node: name, type, tags, children, and
    /// dependencies, depth-first over forward edges.
    pub fn expand(&self, env: &str, name: &str) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let dependency = self.dependency()?;
        let node = resolve_node(&primary, env, name)?
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
        let mut visited = HashSet::new();
        self.expand_node(&primary, &dependency, &node, &mut visited)
    }

    /// Recursive expansion of a cluster.
    pub fn expand_cluster(&self, env: &str, cluster: &str) -> CResult<RangeStruct> {
        self.expand(env, &qualify(env, cluster))
    }

    /// Recursive expansion of an environment.
    pub fn expand_env(&self, env: &str) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let dependency = self.dependency()?;
        let node = primary
            .get_node(env)?
            .ok_or_else(|| Error::InvalidEnvironment(env.to_string()))?;
        let mut visited = HashSet::new();
        self.expand_node(&primary, &dependency, &node, &mut visited)
    }

    fn expand_node(
        &self,
        primary: &GraphInstance,
        dependency: &GraphInstance,
        node: &Node,
        visited: &mut HashSet<String>,
    ) -> CResult<RangeStruct> {
        visited.insert(node.name().to_string());

        let mut children = Vec::new();
        for child_name in node.forward_edges() {
            if visited.contains(&child_name) {
                continue;
            }
            match primary.get_node(&child_name)? {
                Some(child) => {
                    children.push(self.expand_node(primary, dependency, &child, visited)?)
                }
                None => children.push(RangeStruct::str(unqualify(&child_name))),
            }
        }

        let dependencies = match dependency.get_node(node.name())? {
            Some(dep) => {
                dep.forward_edges().iter().map(|d| RangeStruct::str(unqualify(d))).collect()
            }
            None => Vec::new(),
        };

        let mut tags = BTreeMap::new();
        for (key, values) in node.tags() {
            tags.insert(
                key,
                RangeStruct::List(values.into_iter().map(RangeStruct::Str).collect()),
            );
        }

        let mut object = BTreeMap::new();
        object.insert("name".to_string(), RangeStruct::str(unqualify(node.name())));
        object.insert("type".to_string(), RangeStruct::str(node.node_type().to_string()));
        object.insert("tags".to_string(), RangeStruct::Object(tags));
        object.insert("children".to_string(), RangeStruct::List(children));
        object.insert("dependencies".to_string(), RangeStruct::List(dependencies));
        Ok(RangeStruct::Object(object))
    }

    /// Delegates to the installed range-expression compiler.
    pub fn expand_range_expression(&self, env: &str, expression: &str) -> CResult<RangeStruct> {
        self.compiler.expand(env, expression)
    }

    /// The tag keys of a cluster.
    pub fn get_keys(&self, env: &str, cluster: &str) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let name = qualify(env, cluster);
        let node = resolve_node(&primary, env, &name)?
            .ok_or_else(|| Error::NodeNotFound(name.clone()))?;
        Ok(RangeStruct::List(
            node.tags().into_iter().map(|(key, _)| RangeStruct::Str(key)).collect(),
        ))
    }

    /// The values of one tag of a cluster.
    pub fn fetch_key(&self, env: &str, cluster: &str, key: &str) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let name = qualify(env, cluster);
        let node = resolve_node(&primary, env, &name)?
            .ok_or_else(|| Error::NodeNotFound(name.clone()))?;
        match node.tag(key) {
            Some(values) => {
                Ok(RangeStruct::List(values.into_iter().map(RangeStruct::Str).collect()))
            }
            None => Err(Error::Value(format!("tag {} not found on {}", key, name))),
        }
    }

    /// Every tag of a cluster, keyed by name.
    pub fn fetch_all_keys(&self, env: &str, cluster: &str) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let name = qualify(env, cluster);
        let node = resolve_node(&primary, env, &name)?
            .ok_or_else(|| Error::NodeNotFound(name.clone()))?;
        let mut object = BTreeMap::new();
        for (key, values) in node.tags() {
            object.insert(
                key,
                RangeStruct::List(values.into_iter().map(RangeStruct::Str).collect()),
            );
        }
        Ok(RangeStruct::Object(object))
    }

    /// The reverse-edge parents of a node within an environment.
    pub fn get_clusters(&self, env: &str, name: &str) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let node = resolve_node(&primary, env, name)?
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
        let prefix = format!("{}#", env);
        let mut parents = Vec::new();
        for parent in node.reverse_edges() {
            if parent == env || parent.starts_with(&prefix) {
                parents.push(RangeStruct::str(unqualify(&parent)));
            }
        }
        Ok(RangeStruct::List(parents))
    }

    /// Breadth-first search up the reverse edges for the first node carrying
    /// the tag key. Returns (cluster found on, values), or ("", []).
    pub fn bfs_search_parents_for_first_key(
        &self,
        env: &str,
        name: &str,
        key: &str,
    ) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let node = resolve_node(&primary, env, name)?
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(node.name().to_string());
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = primary.get_node(&current)? {
                if let Some(values) = node.tag(key) {
                    return Ok(found_key(&current, values));
                }
                queue.extend(node.reverse_edges());
            }
        }
        Ok(found_key("", Vec::new()))
    }

    /// Depth-first variant of the parent search.
    pub fn dfs_search_parents_for_first_key(
        &self,
        env: &str,
        name: &str,
        key: &str,
    ) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let node = resolve_node(&primary, env, name)?
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;

        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = vec![node.name().to_string()];
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = primary.get_node(&current)? {
                if let Some(values) = node.tag(key) {
                    return Ok(found_key(&current, values));
                }
                // Reversed so the first parent is searched first.
                let mut parents = node.reverse_edges();
                parents.reverse();
                stack.extend(parents);
            }
        }
        Ok(found_key("", Vec::new()))
    }

    /// The nearest common ancestor of two nodes over reverse edges:
    /// the shared ancestor minimizing the combined distance from both
    /// nodes, ties broken by name. Returns (found, ancestor).
    pub fn nearest_common_ancestor(&self, env: &str, a: &str, b: &str) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let a_node = resolve_node(&primary, env, a)?
            .ok_or_else(|| Error::NodeNotFound(a.to_string()))?;
        let b_node = resolve_node(&primary, env, b)?
            .ok_or_else(|| Error::NodeNotFound(b.to_string()))?;

        let a_dist = ancestor_distances(&primary, a_node.name())?;
        let b_dist = ancestor_distances(&primary, b_node.name())?;

        let mut best: Option<(usize, String)> = None;
        for (name, da) in &a_dist {
            if let Some(db) = b_dist.get(name) {
                let cost = da + db;
                let better = match &best {
                    None => true,
                    Some((best_cost, best_name)) => {
                        cost < *best_cost || (cost == *best_cost && name < best_name)
                    }
                };
                if better {
                    best = Some((cost, name.clone()));
                }
            }
        }

        Ok(match best {
            Some((_, name)) => RangeStruct::Tuple(vec![
                RangeStruct::Bool(true),
                RangeStruct::str(unqualify(&name)),
            ]),
            None => {
                RangeStruct::Tuple(vec![RangeStruct::Bool(false), RangeStruct::str("")])
            }
        })
    }

    /// Kahn's topological ordering of the environment's transitive closure
    /// over the dependency graph: every node appears before all of its
    /// forward dependencies.
    pub fn environment_topological_sort(&self, env: &str) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let dependency = self.dependency()?;

        // The environment's transitive closure over containment.
        let root = primary
            .get_node(env)?
            .ok_or_else(|| Error::InvalidEnvironment(env.to_string()))?;
        let mut members: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(root.name().to_string());
        while let Some(current) = queue.pop_front() {
            if !members.insert(current.clone()) {
                continue;
            }
            if let Some(node) = primary.get_node(&current)? {
                queue.extend(node.forward_edges());
            }
        }

        // Dependency edges restricted to the closure. An edge n -> d means
        // n must be ordered before d.
        let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
        let mut indegree: HashMap<String, usize> = HashMap::new();
        for name in &members {
            indegree.entry(name.clone()).or_insert(0);
            if let Some(dep_node) = dependency.get_node(name)? {
                for target in dep_node.forward_edges() {
                    if members.contains(&target) {
                        outgoing.entry(name.clone()).or_default().push(target.clone());
                        *indegree.entry(target).or_insert(0) += 1;
                    }
                }
            }
        }

        // Kahn's algorithm, name-ordered for deterministic output.
        let mut ready: std::collections::BTreeSet<String> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| n.clone())
            .collect();
        let mut order = Vec::new();
        while let Some(name) = ready.iter().next().cloned() {
            ready.remove(&name);
            order.push(RangeStruct::str(unqualify(&name)));
            if let Some(targets) = outgoing.get(&name) {
                for target in targets.clone() {
                    let d = indegree.get_mut(&target).expect("target has indegree");
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(target);
                    }
                }
            }
        }

        if order.len() != indegree.len() {
            return Err(Error::Value(format!(
                "dependency cycle in environment {}",
                env
            )));
        }
        Ok(RangeStruct::List(order))
    }

    /// Non-environment nodes with no reverse edges, as (type, name) tuples.
    pub fn find_orphaned_nodes(&self) -> CResult<RangeStruct> {
        let primary = self.primary()?;
        let mut orphans = Vec::new();
        for node in primary.nodes()? {
            if node.node_type() != NodeType::Environment && node.reverse_edges().is_empty() {
                orphans.push(RangeStruct::Tuple(vec![
                    RangeStruct::str(node.node_type().to_string()),
                    RangeStruct::str(node.name()),
                ]));
            }
        }
        Ok(RangeStruct::List(orphans))
    }
}

fn found_key(cluster: &str, values: Vec<String>) -> RangeStruct {
    RangeStruct::Tuple(vec![
        RangeStruct::str(unqualify(cluster)),
        RangeStruct::List(values.into_iter().map(RangeStruct::Str).collect()),
    ])
}

/// Resolves a caller-supplied node name: already-qualified names and bare
/// host/environment names are looked up as given, everything else is tried
/// with the `env#` qualifier first.
pub(crate) fn resolve_node(
    graph: &GraphInstance,
    env: &str,
    name: &str,
) -> CResult<Option<Node>> {
    if name.contains('#') || name == env {
        return graph.get_node(name);
    }
    if let Some(node) = graph.get_node(&qualify(env, name))? {
        return Ok(Some(node));
    }
    graph.get_node(name)
}

/// BFS distances from a node to every reverse-edge ancestor, the node
/// itself included at distance 0.
fn ancestor_distances(
    graph: &GraphInstance,
    start: &str,
) -> CResult<HashMap<String, usize>> {
    let mut dist: HashMap<String, usize> = HashMap::new();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    queue.push_back((start.to_string(), 0));
    while let Some((current, d)) = queue.pop_front() {
        if dist.contains_key(&current) {
            continue;
        }
        dist.insert(current.clone(), d);
        if let Some(node) = graph.get_node(&current)? {
            for parent in node.reverse_edges() {
                if !dist.contains_key(&parent) {
                    queue.push_back((parent, d + 1));
                }
            }
        }
    }
    Ok(dist)
}
