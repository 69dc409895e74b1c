//! Chunk streamer tests

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use quarry_world::protocol::{ErrorCode, Hello, ServerFrame, Subscribe};
    use quarry_world::store::{MemStore, Store, WorldMeta};
    use quarry_world::types::ServerConfig;
    use quarry_world::world::{Outbound, WorldHandle, WorldRegistry};
    use quarry_world::streamer;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::sync::mpsc;

    // -----------------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------------

    struct Client {
        world: Arc<WorldHandle>,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Client {
        fn frames(&mut self) -> Vec<ServerFrame> {
            let mut out = Vec::new();
            while let Ok(outbound) = self.rx.try_recv() {
                if let Outbound::Frame(frame) = outbound {
                    out.push(frame);
                }
            }
            out
        }

        fn section_ids(&mut self) -> Vec<String> {
            self.frames()
                .into_iter()
                .filter_map(|f| match f {
                    ServerFrame::SectionData(data) => Some(data.section_id),
                    _ => None,
                })
                .collect()
        }
    }

    fn base_config() -> ServerConfig {
        ServerConfig {
            allow_unsigned_tokens: true,
            ..Default::default()
        }
    }

    struct Harness {
        store: Arc<MemStore>,
        registry: Arc<WorldRegistry>,
        config: Arc<ServerConfig>,
    }

    impl Harness {
        fn with_config(config: ServerConfig) -> Self {
            let store = Arc::new(MemStore::new());
            store.add_world(WorldMeta {
                id: "w1".into(),
                name: "w1".into(),
                owner: None,
                is_public: true,
                max_players: 8,
                generator_version: 1,
                registry_version: 1,
            });
            let config = Arc::new(config);
            let registry = Arc::new(WorldRegistry::new(
                config.clone(),
                store.clone() as Arc<dyn Store>,
            ));
            Self {
                store,
                registry,
                config,
            }
        }

        fn new() -> Self {
            Self::with_config(base_config())
        }

        fn dyn_store(&self) -> Arc<dyn Store> {
            self.store.clone()
        }

        async fn join(&self, user: &str) -> Client {
            let issued_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs();
            let jwt = BASE64.encode(
                serde_json::to_vec(&json!({
                    "user_id": user,
                    "display_name": user,
                    "issued_at": issued_at,
                }))
                .unwrap(),
            );
            let hello = Hello {
                protocol_version: 1,
                registry_version: 1,
                generator_version: 1,
                jwt,
                world_id: "w1".into(),
            };
            let (tx, rx) = mpsc::unbounded_channel();
            let admission = self.registry.admit(&hello, tx).await.unwrap();
            Client {
                world: admission.world,
                rx,
            }
        }

        async fn subscribe(&self, client: &Client, user: &str, ids: &[&str]) {
            streamer::handle_subscribe(
                &client.world,
                &self.dyn_store(),
                &self.config,
                user,
                &Subscribe {
                    protocol_version: 1,
                    subscribe: ids.iter().map(|s| s.to_string()).collect(),
                    unsubscribe: vec![],
                },
            )
            .await;
        }
    }

    /// The two sides of the subscription state must agree.
    fn assert_index_agreement(world: &WorldHandle) {
        let data = world.data.lock();
        for (user, p) in &data.participants {
            for coord in &p.subscribed {
                assert!(
                    data.subs
                        .get(coord)
                        .is_some_and(|set| set.contains(user)),
                    "index missing {coord} for {user}"
                );
            }
        }
        for (coord, set) in &data.subs {
            for user in set {
                assert!(
                    data.participants
                        .get(user)
                        .is_some_and(|p| p.subscribed.contains(coord)),
                    "participant {user} missing {coord}"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Subscribe
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn explicit_subscribe_delivers_immediately() {
        let h = Harness::new();
        let mut a = h.join("alice").await;
        h.subscribe(&a, "alice", &["0:0:0"]).await;

        let ids = a.section_ids();
        assert_eq!(ids, vec!["0:0:0".to_string()]);
        assert_index_agreement(&a.world);
    }

    #[tokio::test]
    async fn baseline_sections_are_flagged() {
        let h = Harness::new();
        let mut a = h.join("alice").await;
        h.subscribe(&a, "alice", &["3:3:3"]).await;
        let frame = a.frames().remove(0);
        match frame {
            ServerFrame::SectionData(data) => {
                assert!(data.baseline);
                assert_eq!(data.version, 0);
            }
            other => panic!("expected section data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivery_is_paced_by_the_tick_quota() {
        let h = Harness::new();
        let mut a = h.join("alice").await;
        let ids: Vec<String> = (0..8).map(|sy| format!("0:0:{sy}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        h.subscribe(&a, "alice", &id_refs).await;

        let quota = h.config.sections_per_tick();
        assert_eq!(a.section_ids().len(), quota, "explicit subscribe sends one quota");

        streamer::pump_world(&a.world, &h.dyn_store(), &h.config).await;
        assert_eq!(a.section_ids().len(), quota, "each tick drains one quota");

        // Remaining queue drains over subsequent ticks.
        let mut received = 2 * quota;
        while received < 8 {
            streamer::pump_world(&a.world, &h.dyn_store(), &h.config).await;
            let got = a.section_ids().len();
            assert!(got <= quota);
            received += got;
        }
        assert_eq!(received, 8);
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_ignored() {
        let h = Harness::new();
        let mut a = h.join("alice").await;
        h.subscribe(&a, "alice", &["0:0:0"]).await;
        a.frames();
        h.subscribe(&a, "alice", &["0:0:0"]).await;
        assert!(a.section_ids().is_empty(), "no duplicate delivery");
        let data = a.world.data.lock();
        assert_eq!(data.participants["alice"].subscribed.len(), 1);
    }

    #[tokio::test]
    async fn invalid_section_id_stops_the_message_but_keeps_prior_entries() {
        let h = Harness::new();
        let mut a = h.join("alice").await;
        h.subscribe(&a, "alice", &["0:0:0", "bogus", "0:0:1"]).await;

        let frames = a.frames();
        let errored = frames.iter().any(|f| {
            matches!(f, ServerFrame::Error(e) if e.code == ErrorCode::InvalidRequest && !e.fatal)
        });
        assert!(errored, "invalid id produces a non-fatal error frame");

        let data = a.world.data.lock();
        let subscribed = &data.participants["alice"].subscribed;
        assert_eq!(subscribed.len(), 1, "entries after the bad id are dropped");
    }

    #[tokio::test]
    async fn subscription_cap_is_enforced() {
        let mut config = base_config();
        config.max_subscriptions = 4;
        let h = Harness::with_config(config);
        let mut a = h.join("alice").await;

        let ids: Vec<String> = (0..6).map(|sy| format!("1:1:{sy}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        h.subscribe(&a, "alice", &id_refs).await;

        let frames = a.frames();
        assert!(frames.iter().any(|f| {
            matches!(f, ServerFrame::Error(e) if e.code == ErrorCode::RateLimited)
        }));
        let data = a.world.data.lock();
        assert_eq!(
            data.participants["alice"].subscribed.len(),
            4,
            "already-processed subscriptions are kept"
        );
    }

    #[tokio::test]
    async fn subscribe_rate_is_limited_per_second() {
        let mut config = base_config();
        config.subscribes_per_second = 3;
        let h = Harness::with_config(config);
        let mut a = h.join("alice").await;

        let ids: Vec<String> = (0..5).map(|sy| format!("2:2:{sy}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        h.subscribe(&a, "alice", &id_refs).await;

        let frames = a.frames();
        assert!(frames.iter().any(|f| {
            matches!(f, ServerFrame::Error(e) if e.code == ErrorCode::RateLimited)
        }));
        let data = a.world.data.lock();
        assert_eq!(data.participants["alice"].subscribed.len(), 3);
    }

    // -----------------------------------------------------------------------
    // Unsubscribe
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unsubscribe_updates_both_sides_and_cancels_delivery() {
        let h = Harness::new();
        let mut a = h.join("alice").await;
        let ids: Vec<String> = (0..8).map(|sy| format!("0:0:{sy}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        h.subscribe(&a, "alice", &id_refs).await;
        a.frames();

        streamer::handle_subscribe(
            &a.world,
            &h.dyn_store(),
            &h.config,
            "alice",
            &Subscribe {
                protocol_version: 1,
                subscribe: vec![],
                unsubscribe: ids.clone(),
            },
        )
        .await;

        assert_index_agreement(&a.world);
        {
            let data = a.world.data.lock();
            assert!(data.participants["alice"].subscribed.is_empty());
            assert!(data.subs.is_empty());
        }

        // Nothing left to deliver.
        streamer::pump_world(&a.world, &h.dyn_store(), &h.config).await;
        assert!(a.section_ids().is_empty());
    }

    #[tokio::test]
    async fn two_subscribers_share_the_index_entry() {
        let h = Harness::new();
        let a = h.join("alice").await;
        let _b = h.join("bob").await;
        h.subscribe(&a, "alice", &["0:0:0"]).await;
        h.subscribe(&a, "bob", &["0:0:0"]).await;

        assert_index_agreement(&a.world);
        {
            let data = a.world.data.lock();
            assert_eq!(data.subs.len(), 1);
            assert_eq!(data.subs.values().next().unwrap().len(), 2);
        }
    }
}
