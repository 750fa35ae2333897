//! Canonical in-memory object graph, mirrored to a JSON file.
//!
//! Mutators take the graph write lock for their whole critical section and
//! finish by calling [`Store::schedule_save`]. Disk writes are debounced and
//! single-flight; a failed write never replaces the previous good file.

pub mod model;
pub mod persist;
mod save;


use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use model::{
    GeoPoint, Group, GroupId, JoinRequest, LocationSample, Membership, RequestStatus, Role,
    Snapshot, Track, User, UserId, Visibility, DEFAULT_WORK_RADIUS_M,
};
use persist::LoadSource;
use save::SaveFlight;

const GROUP_CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const GROUP_CODE_LEN: usize = 6;

pub const DEFAULT_HISTORY_LIMIT: usize = 500;
pub const MAX_HISTORY_LIMIT: usize = 2000;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub path: PathBuf,
    pub save_debounce: Duration,
    pub history_cap: usize,
}

impl From<&Config> for StoreOptions {
    fn from(config: &Config) -> Self {
        Self {
            path: config.data_file.clone(),
            save_debounce: config.save_debounce(),
            history_cap: config.history_cap,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGroup {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub center: Option<GeoPoint>,
    #[serde(default)]
    pub work_radius: Option<f64>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
}

/// A group as seen by one of its members.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGroup {
    pub group: Group,
    pub role: Role,
    pub member_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveAllSummary {
    pub left: Vec<GroupId>,
    /// Groups destroyed because the user was their last admin.
    pub deleted: Vec<GroupId>,
}

pub struct Store {
    graph: RwLock<Snapshot>,
    path: PathBuf,
    history_cap: usize,
    load_source: LoadSource,
    /// Whether the primary file holds a snapshot that parsed or that this
    /// process wrote. Only then may it replace the backup.
    primary_good: AtomicBool,
    flight: Mutex<SaveFlight>,
    save_trigger: mpsc::UnboundedSender<()>,
    saves_completed: AtomicU64,
}

fn validate_radius(radius: f64) -> CoreResult<()> {
    if radius.is_finite() && radius > 0.0 {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "work radius must be a positive number of meters, got {radius}"
        )))
    }
}

fn generate_group_code(graph: &Snapshot) -> String {
    let mut rng = rand::rng();
    loop {
        let code: String = (0..GROUP_CODE_LEN)
            .map(|_| GROUP_CODE_CHARS[rng.random_range(0..GROUP_CODE_CHARS.len())] as char)
            .collect();
        if !graph
            .groups
            .values()
            .any(|g| g.code.eq_ignore_ascii_case(&code))
        {
            return code;
        }
    }
}

fn require_group<'a>(graph: &'a Snapshot, group_id: &str) -> CoreResult<&'a Group> {
    graph
        .groups
        .get(group_id)
        .ok_or_else(|| CoreError::not_found("group", group_id))
}

fn require_admin(graph: &Snapshot, group_id: &str, actor: &str) -> CoreResult<()> {
    require_group(graph, group_id)?;
    match graph.membership(group_id, actor) {
        Some(m) if m.role == Role::Admin => Ok(()),
        _ => Err(CoreError::Forbidden("admin access required".into())),
    }
}

fn remove_group_records(graph: &mut Snapshot, group_id: &str) -> Option<Group> {
    graph.group_members.remove(group_id);
    graph.group_requests.remove(group_id);
    graph.groups.remove(group_id)
}

fn insert_member(
    graph: &mut Snapshot,
    group_id: &str,
    user_id: &str,
    role: Role,
) -> CoreResult<Membership> {
    require_group(graph, group_id)?;
    if graph.membership(group_id, user_id).is_some() {
        return Err(CoreError::Conflict("already a member of this group".into()));
    }
    let membership = Membership {
        user_id: user_id.to_string(),
        role,
        joined_at: Utc::now(),
    };
    graph
        .group_members
        .entry(group_id.to_string())
        .or_default()
        .push(membership.clone());
    Ok(membership)
}

/// Removes `user_id` from the group unless they are its last admin.
fn detach_member(
    graph: &mut Snapshot,
    group_id: &str,
    user_id: &str,
    last_admin_msg: &str,
) -> CoreResult<()> {
    let membership = graph
        .membership(group_id, user_id)
        .ok_or_else(|| CoreError::not_found("member", user_id))?;
    if membership.role == Role::Admin && graph.admin_count(group_id) <= 1 {
        return Err(CoreError::Conflict(last_admin_msg.into()));
    }
    if let Some(members) = graph.group_members.get_mut(group_id) {
        members.retain(|m| m.user_id != user_id);
    }
    Ok(())
}

fn window(
    history: Option<&VecDeque<LocationSample>>,
    since: Option<i64>,
    limit: Option<usize>,
) -> Vec<LocationSample> {
    let Some(history) = history else {
        return Vec::new();
    };
    let limit = limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let since = since.unwrap_or(i64::MIN);
    let matching: Vec<LocationSample> = history
        .iter()
        .filter(|s| s.timestamp >= since)
        .copied()
        .collect();
    let skip = matching.len().saturating_sub(limit);
    matching.into_iter().skip(skip).collect()
}

impl Store {
    /// Loads state from disk (primary, then backup, then empty) and starts the
    /// save debouncer. Must be called inside a Tokio runtime.
    pub async fn open(options: StoreOptions) -> Arc<Self> {
        let (mut graph, load_source) = persist::load(&options.path).await;
        let repairs = graph.repair(options.history_cap);

        tracing::info!(
            path = %options.path.display(),
            source = ?load_source,
            repairs,
            groups = graph.groups.len(),
            devices = graph.location_history.len(),
            "Store loaded"
        );

        let (save_trigger, triggers) = mpsc::unbounded_channel();
        let store = Arc::new(Self {
            graph: RwLock::new(graph),
            path: options.path,
            history_cap: options.history_cap,
            load_source,
            primary_good: AtomicBool::new(load_source == LoadSource::Primary),
            flight: Mutex::new(SaveFlight::default()),
            save_trigger,
            saves_completed: AtomicU64::new(0),
        });
        save::spawn_debouncer(Arc::downgrade(&store), triggers, options.save_debounce);
        store
    }

    pub fn load_source(&self) -> LoadSource {
        self.load_source
    }

    /// Number of snapshot writes that reached disk since startup.
    pub fn saves_completed(&self) -> u64 {
        self.saves_completed.load(Ordering::Relaxed)
    }

    /// Requests a debounced save. Bursts of calls collapse into one write.
    pub fn schedule_save(&self) {
        if self.save_trigger.send(()).is_err() {
            tracing::warn!("Save debouncer is gone, change will be persisted by the next save");
        }
    }

    /// Writes the current graph to disk, at most one write at a time.
    ///
    /// Callers arriving while a write is in flight are queued; once it
    /// finishes they are served by one follow-up write that captures their
    /// changes, and all of them receive its result.
    pub async fn save(&self) -> CoreResult<()> {
        let queued = {
            let mut flight = self.flight.lock().await;
            if flight.running {
                let (tx, rx) = oneshot::channel();
                flight.waiters.push(tx);
                Some(rx)
            } else {
                flight.running = true;
                None
            }
        };

        if let Some(rx) = queued {
            return rx
                .await
                .unwrap_or_else(|_| Err(CoreError::Persistence("save was abandoned".into())));
        }

        let result = self.write_snapshot().await;
        loop {
            let waiters = {
                let mut flight = self.flight.lock().await;
                if flight.waiters.is_empty() {
                    flight.running = false;
                    break;
                }
                std::mem::take(&mut flight.waiters)
            };
            let follow_up = self.write_snapshot().await;
            for waiter in waiters {
                let _ = waiter.send(follow_up.clone());
            }
        }
        result
    }

    async fn write_snapshot(&self) -> CoreResult<()> {
        let bytes = {
            let graph = self.graph.read().await;
            serde_json::to_vec_pretty(&*graph)
                .map_err(|e| CoreError::Persistence(format!("serializing snapshot: {e}")))?
        };
        let refresh_backup = self.primary_good.load(Ordering::Acquire);
        persist::write_atomic(&self.path, &bytes, refresh_backup).await?;
        self.primary_good.store(true, Ordering::Release);
        self.saves_completed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "Snapshot saved");
        Ok(())
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.graph.read().await.clone()
    }

    // ---- users ----

    pub async fn upsert_user(&self, user: User) {
        self.graph
            .write()
            .await
            .users
            .insert(user.id.clone(), user);
        self.schedule_save();
    }

    pub async fn user(&self, user_id: &str) -> Option<User> {
        self.graph.read().await.users.get(user_id).cloned()
    }

    // ---- groups ----

    pub async fn create_group(&self, creator: &str, new: NewGroup) -> CoreResult<Group> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(CoreError::Validation("group name is required".into()));
        }
        if let Some(center) = &new.center {
            center.validate()?;
        }
        let work_radius = new.work_radius.unwrap_or(DEFAULT_WORK_RADIUS_M);
        validate_radius(work_radius)?;

        let group = {
            let mut graph = self.graph.write().await;
            let group = Group {
                id: Uuid::new_v4().to_string(),
                code: generate_group_code(&graph),
                name: name.to_string(),
                address: new.address.filter(|a| !a.trim().is_empty()),
                center: new.center,
                work_radius,
                visibility: new.visibility.unwrap_or_default(),
                created_by: creator.to_string(),
                created_at: Utc::now(),
            };
            graph.groups.insert(group.id.clone(), group.clone());
            graph.group_requests.insert(group.id.clone(), Vec::new());
            graph.group_members.insert(
                group.id.clone(),
                vec![Membership {
                    user_id: creator.to_string(),
                    role: Role::Admin,
                    joined_at: group.created_at,
                }],
            );
            group
        };

        tracing::info!(group_id = %group.id, code = %group.code, creator, "Group created");
        self.schedule_save();
        Ok(group)
    }

    pub async fn group(&self, group_id: &str) -> Option<Group> {
        self.graph.read().await.groups.get(group_id).cloned()
    }

    /// Looks a group up by join code, ignoring case.
    pub async fn group_by_code(&self, code: &str) -> Option<Group> {
        let code = code.trim();
        self.graph
            .read()
            .await
            .groups
            .values()
            .find(|g| g.code.eq_ignore_ascii_case(code))
            .cloned()
    }

    /// Moves the geofence. `center: None` keeps the current center; pass
    /// `clear_center` to disable geofencing.
    pub async fn update_group_center(
        &self,
        group_id: &str,
        actor: &str,
        center: Option<GeoPoint>,
        work_radius: Option<f64>,
        clear_center: bool,
    ) -> CoreResult<Group> {
        if let Some(center) = &center {
            center.validate()?;
        }
        if let Some(radius) = work_radius {
            validate_radius(radius)?;
        }

        let updated = {
            let mut graph = self.graph.write().await;
            require_admin(&graph, group_id, actor)?;
            let group = graph
                .groups
                .get_mut(group_id)
                .ok_or_else(|| CoreError::not_found("group", group_id))?;
            if clear_center {
                group.center = None;
            } else if center.is_some() {
                group.center = center;
            }
            if let Some(radius) = work_radius {
                group.work_radius = radius;
            }
            group.clone()
        };

        self.schedule_save();
        Ok(updated)
    }

    pub async fn delete_group(&self, group_id: &str, actor: &str) -> CoreResult<Group> {
        let removed = {
            let mut graph = self.graph.write().await;
            require_admin(&graph, group_id, actor)?;
            remove_group_records(&mut graph, group_id)
                .ok_or_else(|| CoreError::not_found("group", group_id))?
        };
        tracing::info!(group_id, actor, "Group deleted");
        self.schedule_save();
        Ok(removed)
    }

    // ---- join requests ----

    pub async fn submit_join_request(
        &self,
        code: &str,
        user_id: &str,
        display_name: &str,
    ) -> CoreResult<JoinRequest> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(CoreError::Validation("display name is required".into()));
        }

        let request = {
            let mut graph = self.graph.write().await;
            let code = code.trim();
            let group_id = graph
                .groups
                .values()
                .find(|g| g.code.eq_ignore_ascii_case(code))
                .map(|g| g.id.clone())
                .ok_or_else(|| CoreError::not_found("group", code))?;

            if graph.membership(&group_id, user_id).is_some() {
                return Err(CoreError::Conflict("already a member of this group".into()));
            }
            let requests = graph.group_requests.entry(group_id.clone()).or_default();
            if requests
                .iter()
                .any(|r| r.user_id == user_id && r.status == RequestStatus::Pending)
            {
                return Err(CoreError::Conflict("a join request is already pending".into()));
            }

            let request = JoinRequest {
                id: Uuid::new_v4().to_string(),
                group_id,
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                status: RequestStatus::Pending,
                requested_at: Utc::now(),
            };
            requests.push(request.clone());
            request
        };

        self.schedule_save();
        Ok(request)
    }

    pub async fn pending_requests(&self, group_id: &str, actor: &str) -> CoreResult<Vec<JoinRequest>> {
        let graph = self.graph.read().await;
        require_admin(&graph, group_id, actor)?;
        Ok(graph
            .group_requests
            .get(group_id)
            .map(|requests| {
                requests
                    .iter()
                    .filter(|r| r.status == RequestStatus::Pending)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn pending_request_mut<'a>(
        graph: &'a mut Snapshot,
        group_id: &str,
        request_id: &str,
    ) -> CoreResult<&'a mut JoinRequest> {
        let request = graph
            .group_requests
            .get_mut(group_id)
            .and_then(|requests| requests.iter_mut().find(|r| r.id == request_id))
            .ok_or_else(|| CoreError::not_found("join request", request_id))?;
        if request.status != RequestStatus::Pending {
            return Err(CoreError::Conflict(format!(
                "join request is already {:?}",
                request.status
            )
            .to_lowercase()));
        }
        Ok(request)
    }

    /// Approves a pending request, creating the membership.
    pub async fn approve_request(
        &self,
        group_id: &str,
        request_id: &str,
        actor: &str,
    ) -> CoreResult<(JoinRequest, Membership)> {
        let approved = {
            let mut graph = self.graph.write().await;
            require_admin(&graph, group_id, actor)?;
            let user_id = Self::pending_request_mut(&mut graph, group_id, request_id)?
                .user_id
                .clone();
            let membership = insert_member(&mut graph, group_id, &user_id, Role::Member)?;
            let request = Self::pending_request_mut(&mut graph, group_id, request_id)?;
            request.status = RequestStatus::Approved;
            (request.clone(), membership)
        };

        tracing::info!(group_id, request_id, user_id = %approved.0.user_id, "Join request approved");
        self.schedule_save();
        Ok(approved)
    }

    pub async fn reject_request(
        &self,
        group_id: &str,
        request_id: &str,
        actor: &str,
    ) -> CoreResult<JoinRequest> {
        let rejected = {
            let mut graph = self.graph.write().await;
            require_admin(&graph, group_id, actor)?;
            let request = Self::pending_request_mut(&mut graph, group_id, request_id)?;
            request.status = RequestStatus::Rejected;
            request.clone()
        };
        self.schedule_save();
        Ok(rejected)
    }

    // ---- membership ----

    /// Adds a member directly. Callers are trusted to have authorized this.
    pub async fn add_member(&self, group_id: &str, user_id: &str, role: Role) -> CoreResult<Membership> {
        let membership = insert_member(&mut *self.graph.write().await, group_id, user_id, role)?;
        self.schedule_save();
        Ok(membership)
    }

    /// Admin removes another member. The last admin cannot be removed.
    pub async fn remove_member(&self, group_id: &str, actor: &str, target: &str) -> CoreResult<()> {
        {
            let mut graph = self.graph.write().await;
            require_admin(&graph, group_id, actor)?;
            detach_member(&mut graph, group_id, target, "cannot remove the last admin")?;
        }
        tracing::info!(group_id, actor, target, "Member removed");
        self.schedule_save();
        Ok(())
    }

    /// Member leaves voluntarily. The last admin must transfer the role first.
    pub async fn leave_group(&self, group_id: &str, user_id: &str) -> CoreResult<()> {
        {
            let mut graph = self.graph.write().await;
            require_group(&graph, group_id)?;
            detach_member(
                &mut graph,
                group_id,
                user_id,
                "last admin cannot leave; transfer admin first",
            )?;
        }
        tracing::info!(group_id, user_id, "Member left group");
        self.schedule_save();
        Ok(())
    }

    /// Hands the admin role from `current` to `new_admin`, who must already
    /// be a member. `current` becomes a regular member.
    pub async fn transfer_admin(&self, group_id: &str, current: &str, new_admin: &str) -> CoreResult<()> {
        if current == new_admin {
            return Err(CoreError::Conflict("cannot transfer admin to yourself".into()));
        }
        {
            let mut graph = self.graph.write().await;
            require_admin(&graph, group_id, current)?;
            if graph.membership(group_id, new_admin).is_none() {
                return Err(CoreError::not_found("member", new_admin));
            }
            if let Some(members) = graph.group_members.get_mut(group_id) {
                for member in members.iter_mut() {
                    if member.user_id == current {
                        member.role = Role::Member;
                    } else if member.user_id == new_admin {
                        member.role = Role::Admin;
                    }
                }
            }
        }
        tracing::info!(group_id, from = current, to = new_admin, "Admin transferred");
        self.schedule_save();
        Ok(())
    }

    /// Removes the user from every group. Groups where they are the last
    /// admin are deleted instead.
    pub async fn leave_all_groups(&self, user_id: &str) -> LeaveAllSummary {
        let mut summary = LeaveAllSummary::default();
        {
            let mut graph = self.graph.write().await;
            let joined: Vec<GroupId> = graph
                .group_members
                .iter()
                .filter(|(_, members)| members.iter().any(|m| m.user_id == user_id))
                .map(|(id, _)| id.clone())
                .collect();

            for group_id in joined {
                let last_admin = graph
                    .membership(&group_id, user_id)
                    .is_some_and(|m| m.role == Role::Admin)
                    && graph.admin_count(&group_id) <= 1;
                if last_admin {
                    remove_group_records(&mut graph, &group_id);
                    summary.deleted.push(group_id);
                } else if let Some(members) = graph.group_members.get_mut(&group_id) {
                    members.retain(|m| m.user_id != user_id);
                    summary.left.push(group_id);
                }
            }
        }
        tracing::info!(
            user_id,
            left = summary.left.len(),
            deleted = summary.deleted.len(),
            "User left all groups"
        );
        self.schedule_save();
        summary
    }

    pub async fn members(&self, group_id: &str) -> CoreResult<Vec<Membership>> {
        let graph = self.graph.read().await;
        require_group(&graph, group_id)?;
        Ok(graph.group_members.get(group_id).cloned().unwrap_or_default())
    }

    pub async fn role_of(&self, group_id: &str, user_id: &str) -> Option<Role> {
        self.graph
            .read()
            .await
            .membership(group_id, user_id)
            .map(|m| m.role)
    }

    pub async fn groups_for_user(&self, user_id: &str) -> Vec<UserGroup> {
        let graph = self.graph.read().await;
        graph
            .groups
            .values()
            .filter_map(|group| {
                let members = graph.group_members.get(&group.id)?;
                let role = members.iter().find(|m| m.user_id == user_id)?.role;
                Some(UserGroup {
                    group: group.clone(),
                    role,
                    member_count: members.len(),
                })
            })
            .collect()
    }

    pub async fn admin_groups(&self, user_id: &str) -> Vec<UserGroup> {
        let mut groups = self.groups_for_user(user_id).await;
        groups.retain(|g| g.role == Role::Admin);
        groups
    }

    pub async fn group_ids_for_user(&self, user_id: &str) -> Vec<GroupId> {
        self.graph
            .read()
            .await
            .group_members
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m.user_id == user_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every current (group, member) pair.
    pub async fn member_pairs(&self) -> HashSet<(GroupId, UserId)> {
        self.graph
            .read()
            .await
            .group_members
            .iter()
            .flat_map(|(group_id, members)| {
                members
                    .iter()
                    .map(move |m| (group_id.clone(), m.user_id.clone()))
            })
            .collect()
    }

    // ---- location history ----

    /// Whether `id` names a user this service knows: a profile or any
    /// membership.
    pub async fn is_known_user(&self, id: &str) -> bool {
        let graph = self.graph.read().await;
        graph.users.contains_key(id)
            || graph
                .group_members
                .values()
                .any(|members| members.iter().any(|m| m.user_id == id))
    }

    /// Appends samples to the track's history in the given order.
    ///
    /// Invalid samples and exact repeats of the newest entry are skipped;
    /// the oldest entries are evicted beyond the history cap. Returns how
    /// many samples were stored.
    pub async fn append_locations<I>(&self, track: &Track, samples: I) -> usize
    where
        I: IntoIterator<Item = LocationSample>,
    {
        let device_id = track.id();
        let appended = {
            let mut graph = self.graph.write().await;
            let histories = match track {
                Track::Member(_) => &mut graph.location_history,
                Track::Device(_) => &mut graph.device_history,
            };
            let history = histories.entry(device_id.to_string()).or_default();
            let mut appended = 0;
            for sample in samples {
                if let Err(e) = sample.validate() {
                    tracing::debug!(device_id, error = %e, "Dropping invalid sample");
                    continue;
                }
                if history.back() == Some(&sample) {
                    continue;
                }
                history.push_back(sample);
                appended += 1;
            }
            while history.len() > self.history_cap {
                history.pop_front();
            }
            if history.is_empty() {
                histories.remove(device_id);
            }
            appended
        };

        if appended > 0 {
            self.schedule_save();
        }
        appended
    }

    /// A member's samples with `timestamp >= since`, newest `limit` of them,
    /// in stored order.
    pub async fn location_history(
        &self,
        user_id: &str,
        since: Option<i64>,
        limit: Option<usize>,
    ) -> Vec<LocationSample> {
        let graph = self.graph.read().await;
        window(graph.location_history.get(user_id), since, limit)
    }

    /// Same as [`Store::location_history`] for a free-standing device.
    pub async fn device_history(
        &self,
        device_id: &str,
        since: Option<i64>,
        limit: Option<usize>,
    ) -> Vec<LocationSample> {
        let graph = self.graph.read().await;
        window(graph.device_history.get(device_id), since, limit)
    }

    /// The member's sample with the greatest timestamp; on ties the later
    /// arrival wins.
    pub async fn latest_location(&self, user_id: &str) -> Option<LocationSample> {
        self.graph
            .read()
            .await
            .location_history
            .get(user_id)?
            .iter()
            .max_by_key(|s| s.timestamp)
            .copied()
    }

    pub async fn purge_locations(&self, device_id: &str) -> bool {
        let removed = self
            .graph
            .write()
            .await
            .location_history
            .remove(device_id)
            .is_some();
        if removed {
            self.schedule_save();
        }
        removed
    }
}
