mod handler;
mod model;

pub use handler::{
    dashboard,
    group_locations,
    ingest_location,
    members_with_locations,
    post_group_location,
    purge_my_locations,
    recent_locations,
};
