//! Desired/applied route diff and application plan

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::translator::RouteObject;

/// Changes needed to move the applied set to the desired set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteDiff {
    pub created: Vec<RouteObject>,
    pub updated: Vec<RouteObject>,
    pub deleted: Vec<RouteObject>,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Diff two route sets by id
///
/// A route present in both with different content is an update. The result
/// is ordered by id within each list, so `reconcile(d, d)` is empty and the
/// same inputs always yield the same diff.
pub fn reconcile(desired: &[RouteObject], applied: &[RouteObject]) -> RouteDiff {
    let desired_by_id: BTreeMap<&str, &RouteObject> =
        desired.iter().map(|r| (r.id.as_str(), r)).collect();
    let applied_by_id: BTreeMap<&str, &RouteObject> =
        applied.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut diff = RouteDiff::default();
    for (id, route) in &desired_by_id {
        match applied_by_id.get(id) {
            None => diff.created.push((*route).clone()),
            Some(current) if *current != *route => diff.updated.push((*route).clone()),
            Some(_) => {}
        }
    }
    for (id, route) in &applied_by_id {
        if !desired_by_id.contains_key(id) {
            diff.deleted.push((*route).clone());
        }
    }
    diff
}

/// A route to remove, and the route that replaces it if any
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Removal {
    pub route: RouteObject,
    /// Id of a created route targeting the same host; removal waits for it
    pub replaced_by: Option<String>,
}

/// Ordered operations for one pass: upserts first, removals last
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyPlan {
    pub upserts: Vec<RouteObject>,
    pub removals: Vec<Removal>,
}

impl ApplyPlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// Order a diff for make-before-break application
pub fn plan(diff: RouteDiff) -> ApplyPlan {
    let replacements: BTreeMap<Uuid, &str> = diff
        .created
        .iter()
        .map(|r| (r.target_host_id, r.id.as_str()))
        .collect();

    let removals = diff
        .deleted
        .iter()
        .map(|route| Removal {
            route: route.clone(),
            replaced_by: replacements
                .get(&route.target_host_id)
                .map(|id| id.to_string()),
        })
        .collect();

    let mut upserts = diff.created;
    upserts.extend(diff.updated);

    ApplyPlan { upserts, removals }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AccessMode;
    use crate::translator::{route_id, ExternalEndpoint};

    fn route(mode: AccessMode, n: u128, port: i32) -> RouteObject {
        let host_id = Uuid::from_u128(n);
        RouteObject {
            id: route_id(mode, &host_id),
            mode,
            target_host_id: host_id,
            target_pod: format!("demo-dc1-r1-sts-{n}"),
            datacenter: "dc1".to_string(),
            external_endpoint: ExternalEndpoint {
                host: format!("10.0.0.{n}"),
                port,
            },
            backend_port: 9042,
            sni_hostname: None,
            tls_binding: None,
            tls_required: false,
            annotations: Default::default(),
        }
    }

    #[test]
    fn test_identical_sets_yield_empty_diff() {
        let desired = vec![
            route(AccessMode::HostPort, 1, 30000),
            route(AccessMode::HostPort, 2, 30001),
        ];
        let diff = reconcile(&desired, &desired);
        assert!(diff.is_empty());
        assert!(plan(diff).is_empty());
    }

    #[test]
    fn test_diff_classifies_by_id() {
        let applied = vec![
            route(AccessMode::HostPort, 1, 30000),
            route(AccessMode::HostPort, 2, 30001),
        ];
        let desired = vec![
            route(AccessMode::HostPort, 1, 30005),
            route(AccessMode::HostPort, 3, 30002),
        ];

        let diff = reconcile(&desired, &applied);
        assert_eq!(diff.created.len(), 1);
        assert_eq!(diff.created[0].target_host_id, Uuid::from_u128(3));
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].external_endpoint.port, 30005);
        assert_eq!(diff.deleted.len(), 1);
        assert_eq!(diff.deleted[0].target_host_id, Uuid::from_u128(2));
        assert_eq!(diff.len(), 3);
    }

    #[test]
    fn test_applying_diff_converges() {
        let applied = vec![route(AccessMode::DirectRoute, 1, 9042)];
        let desired = vec![
            route(AccessMode::DirectRoute, 2, 9042),
            route(AccessMode::DirectRoute, 3, 9042),
        ];
        let diff = reconcile(&desired, &applied);

        let mut after: Vec<RouteObject> = applied
            .iter()
            .filter(|r| !diff.deleted.iter().any(|d| d.id == r.id))
            .cloned()
            .collect();
        after.extend(diff.created.clone());
        assert!(reconcile(&desired, &after).is_empty());
    }

    #[test]
    fn test_mode_change_is_planned_as_replacement() {
        let applied = vec![route(AccessMode::HostPort, 1, 30000)];
        let desired = vec![route(AccessMode::LoadBalancer, 1, 9042)];

        let plan = plan(reconcile(&desired, &applied));
        assert_eq!(plan.upserts.len(), 1);
        assert_eq!(plan.removals.len(), 1);
        assert_eq!(
            plan.removals[0].replaced_by.as_deref(),
            Some(desired[0].id.as_str())
        );
    }

    #[test]
    fn test_departed_node_removal_has_no_replacement() {
        let applied = vec![
            route(AccessMode::DirectRoute, 1, 9042),
            route(AccessMode::DirectRoute, 2, 9042),
        ];
        let desired = vec![route(AccessMode::DirectRoute, 1, 9042)];

        let plan = plan(reconcile(&desired, &applied));
        assert!(plan.upserts.is_empty());
        assert_eq!(plan.removals.len(), 1);
        assert!(plan.removals[0].replaced_by.is_none());
    }
}
