//! Bundle definitions shared by the integration tests

/// Cluster `C` with service `svc` (component `cmp`) plus provider `P` with
/// host prototype `H`; hosts carry the maintenance-mode action
pub const BASE_BUNDLE: &str = r#"
- type: cluster
  name: C
  version: "1.0"
  actions:
    noop:
      type: job
      script: playbooks/noop.yaml
      script_type: ansible
      state_available: any
    long:
      type: job
      script: playbooks/long.yaml
      script_type: ansible
      state_available: any
      allow_to_terminate: true
    expand:
      type: job
      script: playbooks/expand.yaml
      script_type: ansible
      state_available: any
      hc_acl:
        - service: svc
          component: cmp
          action: add
    two_steps:
      type: task
      state_available: any
      scripts:
        - name: first
          script: playbooks/first.yaml
          script_type: ansible
        - name: second
          script: playbooks/second.yaml
          script_type: ansible
    on_group:
      type: job
      script: playbooks/on_group.yaml
      script_type: ansible
      state_available: any
      allow_for_action_host_group: true
    fragile:
      type: job
      script: playbooks/fragile.yaml
      script_type: ansible
      state_available: any
      on_fail:
        set_state: degraded
        set_multi_state: [needs_repair]
- type: service
  name: svc
  version: "1.0"
  actions:
    install:
      type: job
      script: playbooks/install.yaml
      script_type: ansible
      state_available: any
  components:
    cmp:
      constraint: [0, +]
- type: provider
  name: P
  version: "1.0"
- type: host
  name: H
  version: "1.0"
  actions:
    adcm_host_turn_on_maintenance_mode:
      type: job
      script: playbooks/mm.yaml
      script_type: ansible
      state_available: any
      allow_in_maintenance_mode: true
"#;

/// Service config with a required field and no default
pub const CONFIG_ISSUE_BUNDLE: &str = r#"
- type: cluster
  name: C
  version: "1.0"
- type: service
  name: svc
  version: "1.0"
  config:
    - name: port
      type: integer
  actions:
    install:
      type: job
      script: playbooks/install.yaml
      script_type: ansible
      state_available: any
  components:
    cmp:
      constraint: [0, +]
- type: provider
  name: P
  version: "1.0"
- type: host
  name: H
  version: "1.0"
"#;

/// `agent` must share hosts with `db.master`
pub const BOUND_BUNDLE: &str = r#"
- type: cluster
  name: C
  version: "1.0"
- type: service
  name: db
  version: "1.0"
  components:
    master:
      constraint: [0, +]
- type: service
  name: svc
  version: "1.0"
  components:
    agent:
      constraint: [0, +]
      bound_to:
        service: db
        component: master
- type: provider
  name: P
  version: "1.0"
- type: host
  name: H
  version: "1.0"
"#;

/// `app` cannot run without service `db`
pub const REQUIRES_BUNDLE: &str = r#"
- type: cluster
  name: C
  version: "1.0"
- type: service
  name: app
  version: "1.0"
  requires:
    - service: db
  components:
    web:
      constraint: [0, +]
- type: service
  name: db
  version: "1.0"
  components:
    master:
      constraint: [0, +]
- type: provider
  name: P
  version: "1.0"
- type: host
  name: H
  version: "1.0"
"#;

/// Cluster config with defaults for every leaf
pub const CONFIGURED_BUNDLE: &str = r#"
- type: cluster
  name: C
  version: "1.0"
  config:
    - name: host
      type: string
      default: localhost
    - name: port
      type: integer
      default: 8080
      group_customization: true
    - name: tuning
      type: group
      subs:
        - name: threads
          type: integer
          default: 4
  actions:
    noop:
      type: job
      script: playbooks/noop.yaml
      script_type: ansible
      state_available: any
- type: service
  name: svc
  version: "1.0"
  components:
    cmp:
      constraint: [0, +]
- type: provider
  name: P
  version: "1.0"
- type: host
  name: H
  version: "1.0"
"#;

/// Playbooks referenced by the bundles; the scripted executor never runs them
pub const PLAYBOOKS: &[&str] = &[
    "noop.yaml",
    "long.yaml",
    "expand.yaml",
    "first.yaml",
    "second.yaml",
    "install.yaml",
    "on_group.yaml",
    "mm.yaml",
    "fragile.yaml",
];
