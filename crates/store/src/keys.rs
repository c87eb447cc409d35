//! Key layout of the shared store.

/// Ordered set of gateway ids scored by `load * 1000`.
pub const GATEWAY_RANKING: &str = "registry:gateway:ranking";
/// Set of registered gateway ids (records may expire independently).
pub const GATEWAY_INSTANCES: &str = "registry:gateway:instances";
/// Set of registered send instance ids.
pub const SEND_INSTANCES: &str = "registry:send:instances";
/// Ordered set of room ids whose cached membership diverged from MySQL,
/// scored by the time of first mutation.
pub const GROUPS_DIRTY: &str = "groups:dirty";
/// Ordered set of user ids whose cached joined-rooms diverged from MySQL.
pub const USERS_DIRTY: &str = "users:dirty";
/// Write-behind queue of chat messages awaiting MySQL insertion.
pub const MESSAGE_CACHE: &str = "cache:send:messages";

pub fn registry_gateway(gateway_id: &str) -> String {
    format!("registry:gateway:{gateway_id}")
}

pub fn registry_send(instance_id: &str) -> String {
    format!("registry:send:{instance_id}")
}

pub fn route_user(user_id: i64) -> String {
    format!("route:user:{user_id}")
}

pub fn offline_push(user_id: i64) -> String {
    format!("offline:push:{user_id}")
}

pub fn wait_push(user_id: i64) -> String {
    format!("wait:push:{user_id}")
}

pub fn group_members(room_id: i64) -> String {
    format!("groups:members:{room_id}")
}

pub fn user_joined(user_id: i64) -> String {
    format!("users:joined:{user_id}")
}

/// Durable per-gateway delivery queue.
pub fn stream(gateway_id: &str) -> String {
    format!("stream:{gateway_id}")
}

/// Consumer group a gateway reads its stream with.
pub fn stream_group(gateway_id: &str) -> String {
    format!("push:{gateway_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_families_are_stable() {
        assert_eq!(registry_gateway("gw-1"), "registry:gateway:gw-1");
        assert_eq!(route_user(42), "route:user:42");
        assert_eq!(offline_push(7), "offline:push:7");
        assert_eq!(wait_push(7), "wait:push:7");
        assert_eq!(group_members(3), "groups:members:3");
        assert_eq!(user_joined(3), "users:joined:3");
        assert_eq!(stream("gw-1"), "stream:gw-1");
        assert_eq!(stream_group("gw-1"), "push:gw-1");
    }
}
