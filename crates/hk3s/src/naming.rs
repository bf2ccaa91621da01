//! Server identities.
//!
//! A server's role is encoded in its name and nowhere else, so that
//! servers found on a later run are classified exactly as they were
//! created:
//!
//! - masters: `{cluster}-{type}-master{n}`
//! - workers: `{cluster}-{type}-pool-{pool}-worker{n}`

use std::fmt;

/// Node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Master,
    Worker,
}

impl Role {
    /// Label value used on the server.
    #[must_use]
    pub fn as_label(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Name of master `ordinal` (1-based).
#[must_use]
pub fn master_name(cluster: &str, instance_type: &str, ordinal: usize) -> String {
    format!("{cluster}-{instance_type}-master{ordinal}")
}

/// Name of worker `ordinal` (1-based) in `pool`.
#[must_use]
pub fn worker_name(cluster: &str, instance_type: &str, pool: &str, ordinal: usize) -> String {
    format!("{cluster}-{instance_type}-pool-{pool}-worker{ordinal}")
}

/// Node group name the autoscaler uses for `pool`.
#[must_use]
pub fn autoscaler_group(cluster: &str, instance_type: &str, pool: &str) -> String {
    format!("{cluster}-{instance_type}-pool-{pool}-as")
}

/// Placement group of the masters.
#[must_use]
pub fn master_placement_group(cluster: &str) -> String {
    cluster.to_string()
}

/// Placement group of a worker pool.
#[must_use]
pub fn worker_placement_group(cluster: &str, pool: &str) -> String {
    format!("{cluster}-{pool}")
}

/// Name of the API load balancer.
#[must_use]
pub fn load_balancer_name(cluster: &str) -> String {
    format!("{cluster}-api")
}

/// Label selector matching the masters of `cluster`.
#[must_use]
pub fn master_selector(cluster: &str) -> String {
    format!("cluster={cluster},role=master")
}

/// Classify a server by name.
///
/// Returns `None` for names that carry neither suffix, e.g. nodes added by
/// the autoscaler.
#[must_use]
pub fn classify(name: &str) -> Option<Role> {
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if stem.len() == name.len() {
        return None;
    }
    if stem.ends_with("master") {
        Some(Role::Master)
    } else if stem.ends_with("worker") {
        Some(Role::Worker)
    } else {
        None
    }
}

/// Trailing ordinal of a classified name.
#[must_use]
pub fn ordinal(name: &str) -> Option<usize> {
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    name[stem.len()..].parse().ok()
}

/// Order servers by name with numeric ordinals compared as numbers, so
/// `master10` sorts after `master9`.
#[must_use]
pub fn sort_key(name: &str) -> (&str, usize) {
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    (stem, ordinal(name).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(master_name("demo", "cpx21", 1), "demo-cpx21-master1");
        assert_eq!(
            worker_name("demo", "cpx31", "small", 2),
            "demo-cpx31-pool-small-worker2"
        );
        assert_eq!(autoscaler_group("demo", "cpx31", "burst"), "demo-cpx31-pool-burst-as");
        assert_eq!(worker_placement_group("demo", "small"), "demo-small");
        assert_eq!(master_selector("demo"), "cluster=demo,role=master");
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("demo-cpx21-master1"), Some(Role::Master));
        assert_eq!(classify("demo-cpx21-master12"), Some(Role::Master));
        assert_eq!(classify("demo-cpx31-pool-small-worker3"), Some(Role::Worker));
        assert_eq!(classify("demo-cpx21-master"), None);
        assert_eq!(classify("demo-cpx31-pool-burst-as-5f1a"), None);
        assert_eq!(classify("bastion1"), None);
    }

    #[test]
    fn test_classify_roundtrips_generated_names() {
        for i in 1..=12 {
            assert_eq!(classify(&master_name("c", "cx11", i)), Some(Role::Master));
            assert_eq!(classify(&worker_name("c", "cx11", "p", i)), Some(Role::Worker));
            assert_eq!(ordinal(&master_name("c", "cx11", i)), Some(i));
        }
    }

    #[test]
    fn test_sort_key_orders_numerically() {
        let mut names = vec!["c-t-master10", "c-t-master2", "c-t-master1"];
        names.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        assert_eq!(names, vec!["c-t-master1", "c-t-master2", "c-t-master10"]);
    }
}
