//! The single membership check guarding group rooms and group-scoped reads.

use crate::error::{CoreError, CoreResult};
use crate::store::Store;
use crate::store::model::{GroupId, Role, UserId};

/// Proof that `user_id` belonged to `group_id` when it was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAccess {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub role: Role,
}

impl GroupAccess {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> CoreResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(CoreError::Forbidden("admin access required".into()))
        }
    }
}

/// Grants access to a group only to its current members.
pub async fn authorize_group(store: &Store, user_id: &str, group_id: &str) -> CoreResult<GroupAccess> {
    if store.group(group_id).await.is_none() {
        return Err(CoreError::not_found("group", group_id));
    }
    match store.role_of(group_id, user_id).await {
        Some(role) => Ok(GroupAccess {
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            role,
        }),
        None => {
            tracing::warn!(group_id, user_id, "Group access denied to non-member");
            Err(CoreError::Forbidden("not a member of this group".into()))
        }
    }
}
