//! Session coordination: one actor per participant owning its peer
//! connections, roster and location map, with hub-and-spoke relay through
//! the leader.

mod actor;
mod arena;
mod handle;
mod types;

pub use handle::{SessionBuilder, SessionHandle};
pub use types::{DEFAULT_LEADER_NICKNAME, LocationMap, RiderInfo, RosterSnapshot, SessionError};

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::protocol::{LocationSample, Negotiation, SessionDescription};
    use crate::signaling::{MemoryFabric, SignalingClient, SignalingError};
    use crate::transport::MemoryNetwork;
    use crate::types::{GroupIdentity, InviteCode, PeerId, Role};

    const WAIT: Duration = Duration::from_secs(5);

    struct Group {
        code: InviteCode,
        fabric: MemoryFabric,
        net: MemoryNetwork,
    }

    impl Group {
        fn new() -> Self {
            Self {
                code: InviteCode::try_from("RYDE42").unwrap(),
                fabric: MemoryFabric::new(),
                net: MemoryNetwork::new(),
            }
        }

        async fn start(&self, identity: GroupIdentity) -> SessionHandle {
            let factory = self.net.factory(identity.peer_id);
            SessionHandle::start(identity, &self.fabric, factory)
                .await
                .unwrap()
        }

        async fn leader(&self, nickname: &str) -> SessionHandle {
            self.start(GroupIdentity::leader(self.code, nickname)).await
        }

        /// Start a rider and wait until it is connected to the leader
        async fn rider(&self, leader: &SessionHandle, nickname: &str) -> SessionHandle {
            let rider = self.start(GroupIdentity::rider(self.code, nickname)).await;
            let id = rider.peer_id();
            wait_roster(leader, |r| r.get(&id).is_some_and(|i| i.is_connected)).await;
            wait_roster(&rider, |r| r.connected).await;
            rider
        }
    }

    async fn wait_roster(
        session: &SessionHandle,
        f: impl Fn(&RosterSnapshot) -> bool,
    ) -> RosterSnapshot {
        let mut rx = session.subscribe_roster();
        let snapshot = tokio::time::timeout(WAIT, rx.wait_for(|r| f(r)))
            .await
            .expect("roster condition not reached")
            .unwrap();
        snapshot.clone()
    }

    async fn wait_locations(
        session: &SessionHandle,
        f: impl Fn(&LocationMap) -> bool,
    ) -> LocationMap {
        let mut rx = session.subscribe_locations();
        let locations = tokio::time::timeout(WAIT, rx.wait_for(|l| f(l)))
            .await
            .expect("location condition not reached")
            .unwrap();
        locations.clone()
    }

    /// Keep sending until `observer` has our position. Channels open shortly
    /// after the connection is reported, so the first sends may reach no one.
    async fn send_until_seen(
        sender: &SessionHandle,
        observer: &SessionHandle,
        lat: f64,
        lng: f64,
    ) {
        let id = sender.peer_id();
        tokio::time::timeout(WAIT, async {
            loop {
                sender.send_location(lat, lng, Some(90.0), None).await;
                let seen = observer
                    .locations()
                    .get(&id)
                    .is_some_and(|l| l.lat == lat && l.lng == lng);
                if seen {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("location never observed");
    }

    #[tokio::test]
    async fn leader_and_riders_form_a_star() {
        let group = Group::new();
        let leader = group.leader("Ayse").await;

        let mut riders = Vec::new();
        for nickname in ["Bora", "Cem", "Deniz"] {
            riders.push(group.rider(&leader, nickname).await);
        }

        let roster = wait_roster(&leader, |r| r.len() == 3).await;
        assert!(roster.connected);
        assert!(roster.riders.values().all(|i| !i.is_leader && i.is_connected));
        assert_eq!(leader.peer_count().await, 3);

        for rider in &riders {
            assert_eq!(rider.peer_count().await, 1);
            let roster = rider.roster();
            assert_eq!(roster.len(), 1);
            let entry = roster.get(&leader.peer_id()).unwrap();
            assert!(entry.is_leader);
            assert_eq!(entry.nickname, DEFAULT_LEADER_NICKNAME);
        }
        assert_eq!(group.net.endpoint_count(), 6);
    }

    #[tokio::test]
    async fn rider_shows_configured_leader_nickname() {
        let group = Group::new();
        let leader = group.leader("Ayse").await;

        let identity = GroupIdentity::rider(group.code, "Bora");
        let factory = group.net.factory(identity.peer_id);
        let rider = SessionBuilder::new(identity)
            .leader_nickname("Ayse")
            .start(&group.fabric, factory)
            .await
            .unwrap();

        let roster = wait_roster(&rider, |r| r.connected).await;
        assert_eq!(roster.get(&leader.peer_id()).unwrap().nickname, "Ayse");

        let roster = wait_roster(&leader, |r| r.connected).await;
        assert_eq!(roster.get(&rider.peer_id()).unwrap().nickname, "Bora");
    }

    #[tokio::test]
    async fn locations_relay_through_the_leader() {
        let group = Group::new();
        let leader = group.leader("L").await;
        let r1 = group.rider(&leader, "R1").await;

        send_until_seen(&leader, &r1, 41.0, 29.0).await;
        let seen = r1.locations();
        let from_leader = seen.get(&leader.peer_id()).unwrap();
        assert_eq!(from_leader.nickname, "L");
        assert_eq!(from_leader.heading, Some(90.0));

        let r2 = group.rider(&leader, "R2").await;
        send_until_seen(&r1, &r2, 40.5, 29.5).await;

        // R2 learned R1 only through the leader
        assert_eq!(r2.peer_count().await, 1);
        let roster = wait_roster(&r2, |r| r.get(&r1.peer_id()).is_some()).await;
        let learned = roster.get(&r1.peer_id()).unwrap();
        assert_eq!(learned.nickname, "R1");
        assert!(!learned.is_leader);
        assert!(learned.is_connected);

        let at_leader = wait_locations(&leader, |l| l.contains_key(&r1.peer_id())).await;
        assert_eq!(at_leader[&r1.peer_id()].lat, 40.5);

        // anything echoed back to R1 would arrive ahead of R2's position
        send_until_seen(&r2, &r1, 39.0, 28.0).await;
        assert!(!r1.locations().contains_key(&r1.peer_id()));
        assert!(!r2.locations().contains_key(&r2.peer_id()));
    }

    #[tokio::test]
    async fn send_reaches_only_open_direct_peers() {
        let group = Group::new();
        let leader = group.leader("L").await;
        assert_eq!(leader.send_location(1.0, 2.0, None, None).await, 0);

        let r1 = group.rider(&leader, "R1").await;
        let _r2 = group.rider(&leader, "R2").await;
        send_until_seen(&r1, &leader, 5.0, 6.0).await;

        let delivered = tokio::time::timeout(WAIT, async {
            loop {
                let n = leader.send_location(1.0, 2.0, None, None).await;
                if n == 2 {
                    break n;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(r1.send_location(3.0, 4.0, None, None).await, 1);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_clears_state() {
        let group = Group::new();
        let leader = group.leader("L").await;
        let rider = group.rider(&leader, "R1").await;
        send_until_seen(&leader, &rider, 41.0, 29.0).await;

        rider.disconnect().await;
        rider.disconnect().await;

        assert!(!rider.is_connected());
        assert!(rider.roster().is_empty());
        assert!(rider.locations().is_empty());
        assert_eq!(rider.peer_count().await, 0);
        assert_eq!(rider.send_location(1.0, 1.0, None, None).await, 0);

        let roster = wait_roster(&leader, |r| r.is_empty()).await;
        assert!(!roster.connected);
        assert_eq!(leader.peer_count().await, 0);
        assert_eq!(
            group
                .fabric
                .subscriber_count(&group.code.signaling_topic())
                .await,
            1
        );
    }

    #[tokio::test]
    async fn leader_leaving_clears_rider_view() {
        let group = Group::new();
        let leader = group.leader("L").await;
        let rider = group.rider(&leader, "R1").await;
        send_until_seen(&leader, &rider, 41.0, 29.0).await;

        leader.disconnect().await;

        let roster = wait_roster(&rider, |r| r.is_empty()).await;
        assert!(!roster.connected);
        wait_locations(&rider, |l| l.is_empty()).await;
        assert_eq!(rider.peer_count().await, 0);
    }

    #[tokio::test]
    async fn transport_failure_removes_peer() {
        let group = Group::new();
        let leader = group.leader("L").await;
        let rider = group.rider(&leader, "R1").await;

        assert!(group.net.fail(leader.peer_id(), rider.peer_id()));

        wait_roster(&leader, |r| r.is_empty() && !r.connected).await;
        wait_roster(&rider, |r| r.is_empty() && !r.connected).await;
        assert_eq!(leader.peer_count().await, 0);
        assert_eq!(rider.peer_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_payload_changes_nothing() {
        let group = Group::new();
        let leader = group.leader("L").await;
        let rider = group.rider(&leader, "R1").await;
        let before = rider.roster();

        assert!(group.net.inject(rider.peer_id(), leader.peer_id(), "not json"));
        assert!(group.net.inject(
            rider.peer_id(),
            leader.peer_id(),
            r#"{"type":"location","id":"peer_x"}"#
        ));

        send_until_seen(&leader, &rider, 41.0, 29.0).await;
        assert_eq!(rider.locations().len(), 1);
        assert_eq!(rider.roster(), before);
        assert!(rider.is_connected());
    }

    #[tokio::test]
    async fn roster_does_not_depend_on_join_order() {
        let code = InviteCode::try_from("PACK23").unwrap();
        let identity = |nickname: &str, id: &str| GroupIdentity {
            invite_code: code,
            peer_id: PeerId::try_from(id).unwrap(),
            nickname: nickname.to_string(),
            role: Role::Rider,
        };

        let mut snapshots = Vec::new();
        for order in [["a", "b"], ["b", "a"]] {
            let group = Group {
                code,
                fabric: MemoryFabric::new(),
                net: MemoryNetwork::new(),
            };
            let leader = group
                .start(GroupIdentity {
                    peer_id: PeerId::try_from("peer_leader").unwrap(),
                    ..GroupIdentity::leader(code, "L")
                })
                .await;

            let mut riders = Vec::new();
            for key in order {
                let rider = group.start(identity(key, &format!("peer_{key}"))).await;
                let id = rider.peer_id();
                wait_roster(&leader, |r| r.get(&id).is_some_and(|i| i.is_connected)).await;
                riders.push((key, rider));
            }
            let joined = wait_roster(&leader, |r| r.len() == 2).await;
            assert!(joined.riders.values().all(|i| i.is_connected));

            let a = peer_a_of(&riders);
            let a_id = a.peer_id();
            a.disconnect().await;
            snapshots.push(wait_roster(&leader, |r| r.get(&a_id).is_none()).await);
        }

        assert_eq!(snapshots[0], snapshots[1]);
        let remaining: Vec<_> = snapshots[0].riders.keys().map(PeerId::as_str).collect();
        assert_eq!(remaining, ["peer_b"]);
        assert!(snapshots[0].connected);
    }

    fn peer_a_of(riders: &[(&str, SessionHandle)]) -> SessionHandle {
        riders
            .iter()
            .find(|(key, _)| *key == "a")
            .map(|(_, rider)| rider.clone())
            .unwrap()
    }

    #[tokio::test]
    async fn signals_for_the_other_role_are_ignored() {
        let group = Group::new();
        let leader = group.leader("L").await;
        let rider = group.start(GroupIdentity::rider(group.code, "R1")).await;
        // the rider's join reaches the leader before anything below
        wait_roster(&leader, |r| r.len() == 1).await;

        let stranger = PeerId::try_from("peer_stranger").unwrap();
        let (client, _rx) = SignalingClient::connect(&group.fabric, group.code, stranger)
            .await
            .unwrap();
        client.send_join("Mallory").await;
        let offer = Negotiation {
            description: SessionDescription::offer("v=0"),
            candidates: vec![],
        };
        client.send_offer(leader.peer_id(), offer).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the join opened a record on the leader; the offer and the join
        // reaching the rider did nothing
        assert_eq!(leader.peer_count().await, 2);
        assert_eq!(rider.peer_count().await, 1);

        client.send_leave(None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(leader.peer_count().await, 1);
    }

    #[tokio::test]
    async fn forwarded_samples_reach_peers() {
        let group = Group::new();
        let leader = group.leader("L").await;
        let rider = group.rider(&leader, "R1").await;
        send_until_seen(&rider, &leader, 1.0, 1.0).await;

        let (tx, rx) = mpsc::channel(8);
        let task = rider.forward_samples(rx);
        let sample = LocationSample {
            speed: Some(12.5),
            ..LocationSample::new(41.5, 29.5)
        };
        tx.send(sample).await.unwrap();

        let locations = wait_locations(&leader, |l| {
            l.get(&rider.peer_id()).is_some_and(|loc| loc.lat == 41.5)
        })
        .await;
        let loc = &locations[&rider.peer_id()];
        assert_eq!(loc.speed, Some(12.5));
        assert_eq!(loc.timestamp, sample.timestamp);

        drop(tx);
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn start_surfaces_signaling_errors() {
        let fabric = MemoryFabric::rejecting("channel error");
        let net = MemoryNetwork::new();
        let identity = GroupIdentity::rider(InviteCode::try_from("GHST99").unwrap(), "R1");
        let factory = net.factory(identity.peer_id);

        let result = SessionHandle::start(identity, &fabric, factory).await;
        assert!(matches!(
            result.err(),
            Some(SessionError::Signaling(SignalingError::SubscriptionRejected { .. }))
        ));
    }
}
