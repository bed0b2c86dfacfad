//! Group directory: invite-code lookup and membership records kept outside
//! the peer mesh.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::session::SessionBuilder;
use crate::types::{GroupIdentity, InviteCode, PeerId, Role};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("group {0} not found")]
    NotFound(InviteCode),

    #[error("group {0} is no longer active")]
    Inactive(InviteCode),

    #[error("nickname is required")]
    NicknameRequired,
}

/// What a joiner learns about a group before connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub invite_code: InviteCode,
    pub name: Option<String>,
    pub leader_nickname: String,
    pub active: bool,
    pub member_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub peer_id: PeerId,
    pub nickname: String,
    pub is_leader: bool,
}

pub trait GroupDirectory: Send + Sync + 'static {
    /// Register a new group led by `leader`, assigning its invite code
    fn create_group(
        &self,
        name: Option<String>,
        leader: Member,
    ) -> impl Future<Output = GroupSummary> + Send;

    /// Case-insensitive through `InviteCode`'s normalization
    fn lookup(&self, code: InviteCode) -> impl Future<Output = Option<GroupSummary>> + Send;

    /// Add a member, or refresh one rejoining under the same peer id
    fn upsert_member(
        &self,
        code: InviteCode,
        member: Member,
    ) -> impl Future<Output = Result<(), DirectoryError>> + Send;
}

struct GroupRecord {
    name: Option<String>,
    leader_nickname: String,
    active: bool,
    members: BTreeMap<PeerId, Member>,
}

impl GroupRecord {
    fn summary(&self, invite_code: InviteCode) -> GroupSummary {
        GroupSummary {
            invite_code,
            name: self.name.clone(),
            leader_nickname: self.leader_nickname.clone(),
            active: self.active,
            member_count: self.members.len(),
        }
    }
}

/// In-process directory; clones share the same groups.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    groups: Arc<Mutex<HashMap<InviteCode, GroupRecord>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a group inactive so it can no longer be joined
    pub async fn deactivate(&self, code: InviteCode) -> bool {
        let mut groups = self.groups.lock().await;
        match groups.get_mut(&code) {
            Some(group) => {
                group.active = false;
                info!("Group {} deactivated", code);
                true
            }
            None => false,
        }
    }

    pub async fn members(&self, code: InviteCode) -> Vec<Member> {
        let groups = self.groups.lock().await;
        groups
            .get(&code)
            .map(|g| g.members.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl GroupDirectory for MemoryDirectory {
    async fn create_group(&self, name: Option<String>, leader: Member) -> GroupSummary {
        let mut groups = self.groups.lock().await;

        let mut code = InviteCode::generate();
        while groups.contains_key(&code) {
            code = InviteCode::generate();
        }

        let record = GroupRecord {
            name,
            leader_nickname: leader.nickname.clone(),
            active: true,
            members: BTreeMap::from([(leader.peer_id, leader)]),
        };
        let summary = record.summary(code);
        groups.insert(code, record);

        info!("Group {} created by {}", code, summary.leader_nickname);
        summary
    }

    async fn lookup(&self, code: InviteCode) -> Option<GroupSummary> {
        let groups = self.groups.lock().await;
        groups.get(&code).map(|g| g.summary(code))
    }

    async fn upsert_member(&self, code: InviteCode, member: Member) -> Result<(), DirectoryError> {
        let mut groups = self.groups.lock().await;
        let group = groups.get_mut(&code).ok_or(DirectoryError::NotFound(code))?;

        debug!("Member {} ({}) recorded in {}", member.nickname, member.peer_id, code);
        group.members.insert(member.peer_id, member);
        Ok(())
    }
}

fn required_nickname(nickname: &str) -> Result<String, DirectoryError> {
    match nickname.trim() {
        "" => Err(DirectoryError::NicknameRequired),
        trimmed => Ok(trimmed.to_string()),
    }
}

/// Create a group and the identity its leader will run under
pub async fn create_group<D: GroupDirectory>(
    directory: &D,
    name: Option<&str>,
    nickname: &str,
) -> Result<GroupIdentity, DirectoryError> {
    let nickname = required_nickname(nickname)?;
    let peer_id = PeerId::generate();

    let name = name.map(str::trim).filter(|n| !n.is_empty()).map(String::from);
    let leader = Member {
        peer_id,
        nickname: nickname.clone(),
        is_leader: true,
    };
    let summary = directory.create_group(name, leader).await;

    Ok(GroupIdentity {
        invite_code: summary.invite_code,
        peer_id,
        nickname,
        role: Role::Leader,
    })
}

/// A rider's identity in a group, plus what it needs to show the leader
#[derive(Debug, Clone)]
pub struct JoinedGroup {
    pub identity: GroupIdentity,
    pub leader_nickname: String,
}

impl JoinedGroup {
    /// Session options for this membership
    pub fn session(self) -> SessionBuilder {
        SessionBuilder::new(self.identity).leader_nickname(self.leader_nickname)
    }
}

/// Look up an active group by invite code and record a new rider in it
pub async fn join_group<D: GroupDirectory>(
    directory: &D,
    code: InviteCode,
    nickname: &str,
) -> Result<JoinedGroup, DirectoryError> {
    let nickname = required_nickname(nickname)?;

    let summary = directory
        .lookup(code)
        .await
        .ok_or(DirectoryError::NotFound(code))?;
    if !summary.active {
        return Err(DirectoryError::Inactive(code));
    }

    let identity = GroupIdentity::rider(summary.invite_code, nickname);
    let member = Member {
        peer_id: identity.peer_id,
        nickname: identity.nickname.clone(),
        is_leader: false,
    };
    directory.upsert_member(code, member).await?;

    Ok(JoinedGroup {
        identity,
        leader_nickname: summary.leader_nickname,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionHandle;
    use crate::signaling::MemoryFabric;
    use crate::transport::MemoryNetwork;

    #[tokio::test]
    async fn create_then_join() {
        let directory = MemoryDirectory::new();
        let leader = create_group(&directory, Some("Weekend ride"), "  Ayse ")
            .await
            .unwrap();
        assert_eq!(leader.role, Role::Leader);
        assert_eq!(leader.nickname, "Ayse");

        let summary = directory.lookup(leader.invite_code).await.unwrap();
        assert_eq!(summary.name.as_deref(), Some("Weekend ride"));
        assert_eq!(summary.leader_nickname, "Ayse");
        assert_eq!(summary.member_count, 1);

        let joined = join_group(&directory, leader.invite_code, "Bora").await.unwrap();
        assert_eq!(joined.identity.role, Role::Rider);
        assert_eq!(joined.identity.invite_code, leader.invite_code);
        assert_eq!(joined.leader_nickname, "Ayse");

        let members = directory.members(leader.invite_code).await;
        assert_eq!(members.len(), 2);
        assert_eq!(members.iter().filter(|m| m.is_leader).count(), 1);
    }

    #[tokio::test]
    async fn lookup_ignores_case() {
        let directory = MemoryDirectory::new();
        let leader = create_group(&directory, None, "Ayse").await.unwrap();

        let lower = leader.invite_code.as_str().to_lowercase();
        let joined = join_group(&directory, lower.parse().unwrap(), "Bora").await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn join_errors() {
        let directory = MemoryDirectory::new();
        let missing = InviteCode::try_from("ZZZZZZ").unwrap();
        assert!(matches!(
            join_group(&directory, missing, "Bora").await,
            Err(DirectoryError::NotFound(code)) if code == missing
        ));

        let leader = create_group(&directory, None, "Ayse").await.unwrap();
        assert!(matches!(
            join_group(&directory, leader.invite_code, "   ").await,
            Err(DirectoryError::NicknameRequired)
        ));

        assert!(directory.deactivate(leader.invite_code).await);
        assert!(matches!(
            join_group(&directory, leader.invite_code, "Bora").await,
            Err(DirectoryError::Inactive(_))
        ));

        assert!(matches!(
            create_group(&directory, None, "").await,
            Err(DirectoryError::NicknameRequired)
        ));
    }

    #[tokio::test]
    async fn rejoin_refreshes_member() {
        let directory = MemoryDirectory::new();
        let leader = create_group(&directory, None, "Ayse").await.unwrap();
        let joined = join_group(&directory, leader.invite_code, "Bora").await.unwrap();

        let member = Member {
            peer_id: joined.identity.peer_id,
            nickname: "Bora B".to_string(),
            is_leader: false,
        };
        directory
            .upsert_member(leader.invite_code, member)
            .await
            .unwrap();

        let members = directory.members(leader.invite_code).await;
        assert_eq!(members.len(), 2);
        assert!(members.iter().any(|m| m.nickname == "Bora B"));
    }

    #[tokio::test]
    async fn joined_session_uses_directory_leader_nickname() {
        let directory = MemoryDirectory::new();
        let fabric = MemoryFabric::new();
        let net = MemoryNetwork::new();

        let identity = create_group(&directory, None, "Ayse").await.unwrap();
        let leader_factory = net.factory(identity.peer_id);
        let leader = SessionHandle::start(identity.clone(), &fabric, leader_factory)
            .await
            .unwrap();

        let joined = join_group(&directory, identity.invite_code, "Bora").await.unwrap();
        let factory = net.factory(joined.identity.peer_id);
        let rider = joined.session().start(&fabric, factory).await.unwrap();

        let mut roster = rider.subscribe_roster();
        let snapshot = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            roster.wait_for(|r| r.connected),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(snapshot.get(&leader.peer_id()).unwrap().nickname, "Ayse");

        rider.disconnect().await;
        leader.disconnect().await;
    }
}
