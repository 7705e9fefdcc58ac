use crate::domain::UserId;

/// Allowlist check evaluated before any registry call is reachable from a
/// command. An empty allowlist denies everyone.
pub fn is_authorized(user_id: Option<UserId>, allowed_users: &[i64]) -> bool {
    let Some(user_id) = user_id else {
        return false;
    };
    if allowed_users.is_empty() {
        return false;
    }
    allowed_users.contains(&user_id.0)
}
