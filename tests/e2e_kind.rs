use std::error::Error;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use kube::CustomResourceExt;

use cass_access_operator::crd::CassandraAccessPolicy;

const OPERATOR_NAMESPACE: &str = "cass-access-system";
const TEST_NAMESPACE: &str = "cass-access-e2e";
const OPERATOR_NAME: &str = "cass-access-operator";
const CLUSTER_NAME: &str = "demo";
const POLICY_NAME: &str = "demo-direct";
const POD_NAME: &str = "demo-dc1-r1-sts-0";
const HOST_ID: &str = "b8f2960c-1b2f-4d6e-9a3c-5e7f1d2c3b4a";

/// Returns true if the given binary is accessible in PATH.
fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// End-to-end DirectRoute lifecycle on a Kind cluster:
///
/// 1. Start (or reuse) a Kind cluster and install the CRDs.
/// 2. Fake a one-node cass-operator datacenter: a labelled pod plus a
///    `CassandraDatacenter` whose status carries the node's host ID.
/// 3. Apply a DirectRoute policy and wait for one Active route.
/// 4. Delete the policy and verify its route Services are removed.
///
/// Run with: cargo test --test e2e_kind -- --ignored
#[test]
#[ignore]
fn e2e_direct_route_lifecycle() -> Result<(), Box<dyn Error>> {
    for tool in &["kind", "kubectl", "docker"] {
        if !tool_available(tool) {
            eprintln!("Skipping e2e test: `{tool}` not found in PATH.");
            return Ok(());
        }
    }

    let cluster_name =
        std::env::var("KIND_CLUSTER_NAME").unwrap_or_else(|_| "cass-access-e2e".into());
    ensure_kind_cluster(&cluster_name)?;

    kubectl_apply(&serde_yaml::to_string(&CassandraAccessPolicy::crd())?)?;
    kubectl_apply(CASSANDRA_DATACENTER_CRD)?;

    let image =
        std::env::var("E2E_OPERATOR_IMAGE").unwrap_or_else(|_| "cass-access-operator:e2e".into());
    if env_true("E2E_BUILD_IMAGE", true) {
        run_cmd("docker", &["build", "-t", &image, "."])?;
    }
    if env_true("E2E_LOAD_IMAGE", true) {
        run_cmd(
            "kind",
            &["load", "docker-image", &image, "--name", &cluster_name],
        )?;
    }

    let operator_yaml = operator_manifest(&image);
    let _cleanup = Cleanup {
        operator_manifest: operator_yaml.clone(),
    };

    for ns in [OPERATOR_NAMESPACE, TEST_NAMESPACE] {
        kubectl_apply(&format!(
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {ns}\n"
        ))?;
    }
    kubectl_apply(&operator_yaml)?;
    run_cmd(
        "kubectl",
        &[
            "rollout",
            "status",
            &format!("deployment/{OPERATOR_NAME}"),
            "-n",
            OPERATOR_NAMESPACE,
            "--timeout=180s",
        ],
    )?;

    // A Cassandra node as cass-operator would label it
    kubectl_apply(&cassandra_pod_manifest())?;
    run_cmd(
        "kubectl",
        &[
            "wait",
            "--for=condition=Ready",
            &format!("pod/{POD_NAME}"),
            "-n",
            TEST_NAMESPACE,
            "--timeout=120s",
        ],
    )?;
    kubectl_apply(&datacenter_manifest())?;
    run_cmd(
        "kubectl",
        &[
            "patch",
            "cassandradatacenter",
            "dc1",
            "-n",
            TEST_NAMESPACE,
            "--subresource=status",
            "--type=merge",
            "-p",
            &format!(r#"{{"status":{{"nodeStatuses":{{"{POD_NAME}":{{"hostID":"{HOST_ID}"}}}}}}}}"#),
        ],
    )?;

    kubectl_apply(&policy_manifest())?;

    wait_for("one active route", Duration::from_secs(180), || {
        let routes = run_cmd(
            "kubectl",
            &[
                "get",
                "cassandraaccesspolicy",
                POLICY_NAME,
                "-n",
                TEST_NAMESPACE,
                "-o",
                "jsonpath={.status.activeRoutes}",
            ],
        )?;
        Ok(routes == "1")
    })?;

    let services = route_services()?;
    assert!(
        services.contains(HOST_ID),
        "route Service not named after the host ID: {services}"
    );

    run_cmd(
        "kubectl",
        &[
            "delete",
            "cassandraaccesspolicy",
            POLICY_NAME,
            "-n",
            TEST_NAMESPACE,
            "--wait=true",
            "--timeout=120s",
        ],
    )?;
    wait_for("route cleanup", Duration::from_secs(120), || {
        Ok(route_services()?.is_empty())
    })?;

    Ok(())
}

fn route_services() -> Result<String, Box<dyn Error>> {
    run_cmd(
        "kubectl",
        &[
            "get",
            "services",
            "-n",
            TEST_NAMESPACE,
            "-l",
            &format!("access.cassandra.io/policy={POLICY_NAME}"),
            "-o",
            "jsonpath={.items[*].metadata.name}",
        ],
    )
}

fn ensure_kind_cluster(name: &str) -> Result<(), Box<dyn Error>> {
    let clusters = run_cmd("kind", &["get", "clusters"])?;
    if clusters.lines().any(|line| line.trim() == name) {
        return Ok(());
    }
    run_cmd("kind", &["create", "cluster", "--name", name])?;
    Ok(())
}

fn kubectl_apply(manifest: &str) -> Result<(), Box<dyn Error>> {
    run_cmd_with_stdin("kubectl", &["apply", "-f", "-"], manifest)
}

fn command(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    cmd
}

fn check(program: &str, args: &[&str], output: &std::process::Output) -> Result<(), Box<dyn Error>> {
    if output.status.success() {
        return Ok(());
    }
    Err(format!(
        "command failed: {} {:?}\nstdout:\n{}\nstderr:\n{}",
        program,
        args,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
    .into())
}

fn run_cmd(program: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let output = command(program, args).output()?;
    check(program, args, &output)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_cmd_with_stdin(program: &str, args: &[&str], input: &str) -> Result<(), Box<dyn Error>> {
    let mut child = command(program, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        stdin.write_all(input.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    check(program, args, &output)
}

fn wait_for<F>(label: &str, timeout: Duration, mut condition: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut() -> Result<bool, Box<dyn Error>>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if condition()? {
            return Ok(());
        }
        attempts += 1;
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout while waiting for {} after {:?} (attempts={})",
                label, timeout, attempts
            )
            .into());
        }
        sleep(Duration::from_secs(3));
    }
}

fn env_true(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

struct Cleanup {
    operator_manifest: String,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if let Ok(mut child) = command("kubectl", &["delete", "--ignore-not-found=true", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            if let Some(mut stdin) = child.stdin.take() {
                use std::io::Write;
                let _ = stdin.write_all(self.operator_manifest.as_bytes());
            }
            let _ = child.wait();
        }
        for ns in [TEST_NAMESPACE, OPERATOR_NAMESPACE] {
            let _ = command(
                "kubectl",
                &["delete", "namespace", ns, "--ignore-not-found=true"],
            )
            .output();
        }
    }
}

/// Just enough of cass-operator's CRD for the datacenter status to be stored
const CASSANDRA_DATACENTER_CRD: &str = r#"apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: cassandradatacenters.cassandra.datastax.com
spec:
  group: cassandra.datastax.com
  scope: Namespaced
  names:
    kind: CassandraDatacenter
    plural: cassandradatacenters
    singular: cassandradatacenter
  versions:
    - name: v1beta1
      served: true
      storage: true
      subresources:
        status: {}
      schema:
        openAPIV3Schema:
          type: object
          x-kubernetes-preserve-unknown-fields: true
"#;

fn datacenter_manifest() -> String {
    format!(
        r#"apiVersion: cassandra.datastax.com/v1beta1
kind: CassandraDatacenter
metadata:
  name: dc1
  namespace: {TEST_NAMESPACE}
spec:
  clusterName: {CLUSTER_NAME}
"#
    )
}

fn cassandra_pod_manifest() -> String {
    format!(
        r#"apiVersion: v1
kind: Pod
metadata:
  name: {POD_NAME}
  namespace: {TEST_NAMESPACE}
  labels:
    cassandra.datastax.com/cluster: {CLUSTER_NAME}
    cassandra.datastax.com/datacenter: dc1
    cassandra.datastax.com/rack: r1
    cassandra.datastax.com/node-state: Started
    statefulset.kubernetes.io/pod-name: {POD_NAME}
spec:
  containers:
    - name: cassandra
      image: registry.k8s.io/pause:3.9
"#
    )
}

fn policy_manifest() -> String {
    format!(
        r#"apiVersion: access.cassandra.io/v1alpha1
kind: CassandraAccessPolicy
metadata:
  name: {POLICY_NAME}
  namespace: {TEST_NAMESPACE}
spec:
  clusterName: {CLUSTER_NAME}
  mode: DirectRoute
"#
    )
}

fn operator_manifest(image: &str) -> String {
    format!(
        r#"---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: {OPERATOR_NAME}
  namespace: {OPERATOR_NAMESPACE}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: {OPERATOR_NAME}
rules:
  - apiGroups: ["access.cassandra.io"]
    resources: ["cassandraaccesspolicies"]
    verbs: ["get", "list", "watch", "update", "patch"]
  - apiGroups: ["access.cassandra.io"]
    resources: ["cassandraaccesspolicies/status"]
    verbs: ["get", "update", "patch"]
  - apiGroups: ["access.cassandra.io"]
    resources: ["cassandraaccesspolicies/finalizers"]
    verbs: ["update"]
  - apiGroups: ["cassandra.datastax.com"]
    resources: ["cassandradatacenters"]
    verbs: ["get", "list", "watch"]
  - apiGroups: [""]
    resources: ["pods"]
    verbs: ["get", "list", "watch"]
  - apiGroups: [""]
    resources: ["services"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
  - apiGroups: [""]
    resources: ["secrets"]
    verbs: ["get", "list", "watch", "patch"]
  - apiGroups: ["traefik.io"]
    resources: ["ingressroutetcps", "tlsoptions"]
    verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
  - apiGroups: [""]
    resources: ["events"]
    verbs: ["create", "patch"]
  - apiGroups: ["coordination.k8s.io"]
    resources: ["leases"]
    verbs: ["get", "list", "watch", "create", "update", "patch"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: {OPERATOR_NAME}
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: {OPERATOR_NAME}
subjects:
  - kind: ServiceAccount
    name: {OPERATOR_NAME}
    namespace: {OPERATOR_NAMESPACE}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {OPERATOR_NAME}
  namespace: {OPERATOR_NAMESPACE}
spec:
  replicas: 1
  selector:
    matchLabels:
      app: {OPERATOR_NAME}
  template:
    metadata:
      labels:
        app: {OPERATOR_NAME}
    spec:
      serviceAccountName: {OPERATOR_NAME}
      containers:
        - name: operator
          image: {image}
          imagePullPolicy: IfNotPresent
          args: ["run"]
          env:
            - name: OPERATOR_NAMESPACE
              value: {OPERATOR_NAMESPACE}
            - name: POD_NAMESPACE
              value: {OPERATOR_NAMESPACE}
"#
    )
}
