mod handler;
mod model;

pub use handler::{me, my_admin_groups, my_groups, refresh_token, update_profile};
