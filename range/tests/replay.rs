//! Replaying one store's transaction log onto an empty store reproduces the
//! same graph state.

use std::sync::Arc;

use range::api::RangeAPI;
use range::error::CResult;
use range::store::{RecordType, Store};

fn populate(api: &RangeAPI) -> CResult<()> {
    api.create_env("prod")?;
    api.add_cluster_to_env("prod", "web")?;
    api.add_cluster_to_env("prod", "db")?;
    api.add_host_to_cluster("prod", "web", "web1.example.com")?;
    api.add_host_to_cluster("prod", "web", "web2.example.com")?;
    api.add_host_to_cluster("prod", "db", "db1.example.com")?;
    api.remove_host_from_cluster("prod", "web", "web2.example.com")?;
    api.update_node_tag("prod", "web", "owner", &["ops"])?;
    api.add_node_ext_dependency("prod", "web", "db")?;
    Ok(())
}

#[test]
fn log_replay_reproduces_node_records() -> CResult<()> {
    let source = Arc::new(Store::in_memory());
    let source_api = RangeAPI::new(Arc::clone(&source));
    populate(&source_api)?;

    // Stream the source log into a fresh store through the ordinary write
    // path.
    let replica = Arc::new(Store::in_memory());
    let replica_api = RangeAPI::new(Arc::clone(&replica));
    let entries = source.txlog().scan_from(1)?;
    for (_, request) in &entries {
        replica_api.apply_request(request)?;
    }

    // Same high-water sequence.
    assert_eq!(
        source.txlog().last()?.map(|(seq, _)| seq),
        replica.txlog().last()?.map(|(seq, _)| seq),
    );

    // Identical node records in every graph.
    assert_eq!(source.list_graphs()?, replica.list_graphs()?);
    for graph_name in source.list_graphs()? {
        let source_graph = source.graph(&graph_name)?;
        let replica_graph = replica.graph(&graph_name)?;
        assert_eq!(source_graph.node_names()?, replica_graph.node_names()?);
        for name in source_graph.node_names()? {
            assert_eq!(
                source_graph.get_record(RecordType::Node, &name)?,
                replica_graph.get_record(RecordType::Node, &name)?,
                "node {} differs in graph {}",
                name,
                graph_name
            );
        }
        assert_eq!(source_graph.version()?, replica_graph.version()?);
    }

    // And the same answers to queries.
    assert_eq!(
        source_api.simple_expand_cluster("prod", "web")?,
        replica_api.simple_expand_cluster("prod", "web")?
    );
    assert_eq!(
        source_api.environment_topological_sort("prod")?,
        replica_api.environment_topological_sort("prod")?
    );
    Ok(())
}
