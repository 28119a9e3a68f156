//! Store key namespaces.
//!
//! Every key used by a queue or a task engine is derived from one logical
//! name. The name is wrapped in a `{...}` hash tag so all keys of one name
//! land in the same Redis Cluster slot, which multi-key scripts require.
//!
//! ```text
//! redisson_ack_queue:{orders}            list   message ids
//! redisson_ack_queue:{orders}:data       hash   id -> payload
//! redisson_ack_queue:{orders}:timeout    zset   id -> visibility deadline
//! redisson_ack_queue:{orders}:retry      hash   id -> retry count
//! redisson_ack_queue:{orders}:error      zset   id -> dead-letter time
//! redisson_ack_queue:{orders}:channel    pub/sub
//! ```
//!
//! The layout is shared with the Lua scripts under `store/lua/`; renaming a
//! key breaks compatibility with queues already deployed.

use crate::config::{DEFAULT_QUEUE_PREFIX, DEFAULT_TASK_PREFIX};

/// Joins `prefix` and `name`, hash-tagging the name unless the caller already
/// chose a tag.
fn prefixed(prefix: &str, name: &str) -> String {
    if name.contains('{') {
        format!("{}:{}", prefix, name)
    } else {
        format!("{}:{{{}}}", prefix, name)
    }
}

fn suffixed(base: &str, suffix: &str) -> String {
    format!("{}:{}", base, suffix)
}

/// Keys of one acknowledged queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// Logical queue name as given by the caller.
    pub name: String,
    pub queue: String,
    pub data: String,
    pub timeout: String,
    pub retry: String,
    pub error: String,
    pub channel: String,
}

impl QueueKeys {
    /// Builds the keys for `name` under the default prefix.
    pub fn new(name: &str) -> Self {
        Self::with_prefix(DEFAULT_QUEUE_PREFIX, name)
    }

    pub fn with_prefix(prefix: &str, name: &str) -> Self {
        let queue = prefixed(prefix, name);
        Self {
            name: name.to_string(),
            data: suffixed(&queue, "data"),
            timeout: suffixed(&queue, "timeout"),
            retry: suffixed(&queue, "retry"),
            error: suffixed(&queue, "error"),
            channel: suffixed(&queue, "channel"),
            queue,
        }
    }
}

/// Keys of one delayed task engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskKeys {
    /// Logical task name as given by the caller.
    pub name: String,
    /// Namespace root; also the registry key for the engine.
    pub root: String,
    pub schedule: String,
    pub ready: String,
    pub timeout: String,
    pub data: String,
    pub retry: String,
    pub error: String,
    pub schedule_channel: String,
    pub task_channel: String,
}

impl TaskKeys {
    /// Builds the keys for `name` under the default prefix.
    pub fn new(name: &str) -> Self {
        Self::with_prefix(DEFAULT_TASK_PREFIX, name)
    }

    pub fn with_prefix(prefix: &str, name: &str) -> Self {
        let root = prefixed(prefix, name);
        Self {
            name: name.to_string(),
            schedule: suffixed(&root, "schedule"),
            ready: suffixed(&root, "task_queue"),
            timeout: suffixed(&root, "task_timeout_queue"),
            data: suffixed(&root, "data"),
            retry: suffixed(&root, "retry"),
            error: suffixed(&root, "error"),
            schedule_channel: suffixed(&root, "schedule_channel"),
            task_channel: suffixed(&root, "task_channel"),
            root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_queue_key_layout() {
        let keys = QueueKeys::new("demo");

        assert_eq!(keys.queue, "redisson_ack_queue:{demo}");
        assert_eq!(keys.data, "redisson_ack_queue:{demo}:data");
        assert_eq!(keys.timeout, "redisson_ack_queue:{demo}:timeout");
        assert_eq!(keys.retry, "redisson_ack_queue:{demo}:retry");
        assert_eq!(keys.error, "redisson_ack_queue:{demo}:error");
        assert_eq!(keys.channel, "redisson_ack_queue:{demo}:channel");
    }

    #[test]
    fn test_task_key_layout() {
        let keys = TaskKeys::with_prefix("jobs", "mail");

        assert_eq!(keys.root, "jobs:{mail}");
        assert_eq!(keys.schedule, "jobs:{mail}:schedule");
        assert_eq!(keys.ready, "jobs:{mail}:task_queue");
        assert_eq!(keys.timeout, "jobs:{mail}:task_timeout_queue");
        assert_eq!(keys.schedule_channel, "jobs:{mail}:schedule_channel");
        assert_eq!(keys.task_channel, "jobs:{mail}:task_channel");
    }

    #[test]
    fn test_existing_hash_tag_is_kept() {
        let keys = QueueKeys::new("{tenant-1}:orders");
        assert_eq!(keys.queue, "redisson_ack_queue:{tenant-1}:orders");
        assert_eq!(keys.data, "redisson_ack_queue:{tenant-1}:orders:data");
    }

    #[test]
    fn test_sibling_names_do_not_collide() {
        // "a:data" must not alias the data hash of queue "a".
        let a = QueueKeys::new("a");
        let b = QueueKeys::new("a:data");

        let left: HashSet<_> = [&a.queue, &a.data, &a.timeout, &a.retry, &a.error, &a.channel]
            .into_iter()
            .collect();
        for key in [&b.queue, &b.data, &b.timeout, &b.retry, &b.error, &b.channel] {
            assert!(!left.contains(key), "{} collides", key);
        }
    }
}
