mod handler;
mod model;

pub use handler::{
    approve_request,
    create_group,
    delete_group,
    group_detail,
    group_info,
    leave_all,
    leave_group,
    list_members,
    pending_requests,
    reject_request,
    remove_member,
    submit_join_request,
    transfer_admin,
    update_center,
};
pub use model::{GroupDetail, GroupInfo, MemberInfo};
