//! Tenant-scoped key namespace.
//!
//! All fast-store keys follow `tempo:{tenant_id}:{resource_type}:{resource_id}`
//! and every bus channel follows `tempo:{tenant_id}:events`, so tenant
//! isolation is a property of key construction rather than call-site
//! discipline.

const PREFIX: &str = "tempo";

/// Build a tenant-scoped store key.
///
/// `key("t_001", "session", "abc")` → `tempo:t_001:session:abc`
pub fn key(tenant_id: &str, resource_type: &str, resource_id: &str) -> String {
    format!("{PREFIX}:{tenant_id}:{resource_type}:{resource_id}")
}

/// Build the tenant-scoped bus channel name.
pub fn channel(tenant_id: &str) -> String {
    format!("{PREFIX}:{tenant_id}:events")
}

/// Key of the session state hash.
pub fn session(tenant_id: &str, session_id: &str) -> String {
    key(tenant_id, "session", session_id)
}

/// Key of the artifact-id set belonging to a session.
pub fn session_artifacts(tenant_id: &str, session_id: &str) -> String {
    key(tenant_id, "session", &format!("{session_id}:artifacts"))
}

/// Key of one artifact blob. Artifact identifiers are unique within a
/// session, so the owning session is part of the key.
pub fn artifact(tenant_id: &str, session_id: &str, artifact_id: &str) -> String {
    key(tenant_id, "artifact", &format!("{session_id}:{artifact_id}"))
}

/// Key of the accumulated result list for one (session, tool).
pub fn results(tenant_id: &str, session_id: &str, tool: &str) -> String {
    key(tenant_id, "results", &format!("{session_id}:{tool}"))
}

/// Key of the abort marker for a session.
pub fn abort(tenant_id: &str, session_id: &str) -> String {
    key(tenant_id, "abort", session_id)
}

/// Key of the per-session tick counter.
pub fn tick(tenant_id: &str, session_id: &str) -> String {
    key(tenant_id, "tick", session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_tenant_scoped() {
        assert_eq!(session("t_001", "abc"), "tempo:t_001:session:abc");
        assert_eq!(
            session_artifacts("t_001", "abc"),
            "tempo:t_001:session:abc:artifacts"
        );
        assert_eq!(artifact("t_001", "abc", "f1"), "tempo:t_001:artifact:abc:f1");
        assert_eq!(channel("t_001"), "tempo:t_001:events");
        assert_ne!(session("t_001", "abc"), session("t_002", "abc"));
        // The same artifact id in two sessions names two different blobs.
        assert_ne!(artifact("t_001", "s1", "f1"), artifact("t_001", "s2", "f1"));
    }
}
