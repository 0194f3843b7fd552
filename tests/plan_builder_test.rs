use std::collections::BTreeMap;

use mooring::ops::{
    AppRef, Cluster, DnsConfig, DockerConfig, Operation, OperationState, OperationType,
    OperationVars, Server, HOOK_NETWORK_INSTALL,
};
use mooring::plan::builder::{build_plan, kinds, PlanBuilder};

fn server(hostname: &str, role: &str) -> Server {
    Server {
        hostname: hostname.to_string(),
        advertise_ip: format!("192.168.1.{}", hostname.len()),
        role: role.to_string(),
        mounts: Vec::new(),
        system_device: None,
        docker_device: None,
        cloud_metadata: None,
    }
}

fn cluster(hooks: Vec<String>) -> Cluster {
    Cluster {
        domain: "example.com".to_string(),
        account_id: "system".to_string(),
        app: AppRef {
            name: "telekube".to_string(),
            version: "1.0.0".to_string(),
            hooks,
        },
        dns_config: DnsConfig {
            addrs: vec!["127.0.0.2".to_string()],
            port: 53,
        },
        state: "installing".to_string(),
        docker: DockerConfig::default(),
    }
}

fn operation(op_type: OperationType, servers: Vec<Server>) -> Operation {
    Operation {
        id: "op-1".to_string(),
        cluster_domain: "example.com".to_string(),
        account_id: "system".to_string(),
        op_type,
        state: OperationState::Ready,
        created_at: chrono::Utc::now(),
        created_by: "installer@example.com".to_string(),
        servers,
        vars: OperationVars::default(),
        agents: BTreeMap::new(),
    }
}

#[test]
fn test_plan_is_deterministic() {
    let cluster = cluster(vec![]);
    let operation = operation(
        OperationType::Install,
        vec![
            server("node-2", "node"),
            server("node-1", "master"),
            server("node-3", "node"),
        ],
    );
    let first = build_plan(&cluster, &operation).unwrap();
    let second = build_plan(&cluster, &operation).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_plan_is_well_formed() {
    let cluster = cluster(vec![HOOK_NETWORK_INSTALL.to_string()]);
    let operation = operation(
        OperationType::Install,
        vec![server("node-1", "master"), server("node-2", "node")],
    );
    let plan = build_plan(&cluster, &operation).unwrap();
    plan.validate().unwrap();

    // Every leaf names an executor kind the builder catalog covers.
    for leaf in plan.leaves() {
        assert!(
            kinds::ALL.contains(&leaf.executor.as_str()),
            "unknown executor kind {:?} for {}",
            leaf.executor,
            leaf.id
        );
    }
}

#[test]
fn test_install_top_level_order() {
    let cluster = cluster(vec![]);
    let operation = operation(
        OperationType::Install,
        vec![server("node-1", "master"), server("node-2", "node")],
    );
    let plan = build_plan(&cluster, &operation).unwrap();
    let top: Vec<&str> = plan.phases.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(
        top,
        vec![
            "/checks",
            "/configure",
            "/bootstrap",
            "/pull",
            "/masters",
            "/nodes",
            "/wait",
            "/rbac",
            "/coredns",
            "/resources",
            "/export",
            "/health",
            "/runtime",
            "/app",
            "/connect-installer",
            "/elections",
            "/extra-resources",
        ]
    );

    // Each top-level phase depends on its predecessor.
    for pair in plan.phases.windows(2) {
        assert_eq!(pair[1].requires, vec![pair[0].id.clone()]);
    }
}

#[test]
fn test_masters_group_fans_out_per_server() {
    let cluster = cluster(vec![]);
    let operation = operation(
        OperationType::Install,
        vec![
            server("beta", "master"),
            server("alpha", "master"),
            server("gamma", "node"),
        ],
    );
    let plan = build_plan(&cluster, &operation).unwrap();

    let masters = plan.find("/masters").unwrap();
    let children: Vec<&str> = masters.phases.iter().map(|p| p.id.as_str()).collect();
    // Children ordered by hostname.
    assert_eq!(children, vec!["/masters/alpha", "/masters/beta"]);

    let leaf = plan.find("/masters/alpha/install").unwrap();
    assert_eq!(leaf.executor, kinds::SYSTEM);
    assert_eq!(leaf.node_ref.as_deref(), Some("alpha"));
    assert!(leaf.data.is_some());

    // Nodes run only after all masters completed.
    let nodes = plan.find("/nodes").unwrap();
    assert_eq!(nodes.requires, vec!["/masters"]);
    assert_eq!(nodes.phases.len(), 1);
    assert_eq!(nodes.phases[0].id, "/nodes/gamma");
}

#[test]
fn test_bootstrap_and_pull_fan_out() {
    let cluster = cluster(vec![]);
    let operation = operation(
        OperationType::Install,
        vec![server("node-1", "master"), server("node-2", "node")],
    );
    let plan = build_plan(&cluster, &operation).unwrap();

    for group_id in ["/bootstrap", "/pull"] {
        let group = plan.find(group_id).unwrap();
        let children: Vec<&str> = group.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(
            children,
            vec![
                format!("{}/node-1", group_id),
                format!("{}/node-2", group_id)
            ]
        );
        for child in &group.phases {
            assert!(child.node_ref.is_some());
            // Children carry no ordering between each other.
            assert!(child.requires.is_empty());
        }
    }
}

#[test]
fn test_masters_only_install_has_no_nodes_phase() {
    let cluster = cluster(vec![]);
    let operation = operation(OperationType::Install, vec![server("node-1", "master")]);
    let plan = build_plan(&cluster, &operation).unwrap();
    assert!(plan.find("/nodes").is_none());
    // The wait phase chains to masters directly.
    assert_eq!(plan.find("/wait").unwrap().requires, vec!["/masters"]);
}

#[test]
fn test_overlay_phase_is_conditional_on_manifest_hook() {
    let operation = operation(OperationType::Install, vec![server("node-1", "master")]);

    let without = build_plan(&cluster(vec![]), &operation).unwrap();
    assert!(without.find("/overlay").is_none());
    assert_eq!(without.find("/health").unwrap().requires, vec!["/export"]);

    let with = build_plan(&cluster(vec![HOOK_NETWORK_INSTALL.to_string()]), &operation).unwrap();
    let overlay = with.find("/overlay").unwrap();
    assert_eq!(overlay.executor, kinds::OVERLAY);
    assert_eq!(overlay.requires, vec!["/export"]);
    assert_eq!(with.find("/health").unwrap().requires, vec!["/overlay"]);
}

#[test]
fn test_checks_phase_is_optional() {
    let cluster = cluster(vec![]);
    let operation = operation(OperationType::Install, vec![server("node-1", "master")]);
    let plan = PlanBuilder::new(&cluster, &operation)
        .unwrap()
        .without_preflight_checks()
        .build()
        .unwrap();
    assert!(plan.find("/checks").is_none());
    assert!(plan.find("/configure").unwrap().requires.is_empty());
}

#[test]
fn test_expand_plan_shape() {
    let cluster = cluster(vec![]);
    let operation = operation(OperationType::Expand, vec![server("node-4", "node")]);
    let plan = build_plan(&cluster, &operation).unwrap();
    plan.validate().unwrap();

    let top: Vec<&str> = plan.phases.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(
        top,
        vec![
            "/configure",
            "/bootstrap",
            "/pull",
            "/joins",
            "/wait",
            "/elections"
        ]
    );
    let leaf = plan.find("/joins/node-4/install").unwrap();
    assert_eq!(leaf.executor, kinds::SYSTEM);
    assert_eq!(leaf.node_ref.as_deref(), Some("node-4"));
}

#[test]
fn test_builder_rejects_bad_input() {
    let cluster = cluster(vec![]);
    // No servers at all.
    let empty = operation(OperationType::Install, vec![]);
    assert!(PlanBuilder::new(&cluster, &empty).is_err());

    // Install without a master.
    let no_master = operation(OperationType::Install, vec![server("node-1", "node")]);
    assert!(PlanBuilder::new(&cluster, &no_master).is_err());
}
