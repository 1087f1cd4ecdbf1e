//! Room driver behaviour over an in-memory channel and a fake backend

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use socialstream_core::api::{ApiError, MemberResponse, QueueItem, Role, RoomApi, RoomStateResponse, UserRef, Video};
use socialstream_core::config::ClientConfig;
use socialstream_core::playback::{LocalEvent, MediaType, Player, PlayerEvent};
use socialstream_core::sync::{
    room_topic, CatchUpDecision, CatchUpOutcome, RoomAction, RoomClient, RoomEvent, RoomFrame, RoomHandle,
};
use socialstream_core::transport::MemoryTransport;

const ROOM: i64 = 10;
const HOST: i64 = 1;
const VIEWER: i64 = 2;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Load(String),
    Play,
    Pause,
    Seek(f64),
}

#[derive(Clone, Default)]
struct FakePlayer {
    calls: Arc<Mutex<Vec<Call>>>,
    position: Arc<Mutex<f64>>,
}

impl FakePlayer {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn clear(&self) {
        self.calls.lock().clear();
    }

    fn set_position(&self, position: f64) {
        *self.position.lock() = position;
    }
}

impl Player for FakePlayer {
    fn load_source(&mut self, url: &str, _media_type: MediaType) {
        self.calls.lock().push(Call::Load(url.to_string()));
        *self.position.lock() = 0.0;
    }

    fn play(&mut self) {
        self.calls.lock().push(Call::Play);
    }

    fn pause(&mut self) {
        self.calls.lock().push(Call::Pause);
    }

    fn seek(&mut self, position: f64) {
        self.calls.lock().push(Call::Seek(position));
        *self.position.lock() = position;
    }

    fn position(&self) -> f64 {
        *self.position.lock()
    }
}

struct FakeRoomApi {
    state: Mutex<RoomStateResponse>,
    queue: Mutex<Vec<QueueItem>>,
}

impl FakeRoomApi {
    fn new(video_id: i64, position: f64, playing: bool) -> Self {
        Self {
            state: Mutex::new(RoomStateResponse {
                room_id: Some(ROOM),
                current_video_id: Some(video_id),
                playback_position: Some(position),
                is_playing: Some(playing),
                ..Default::default()
            }),
            queue: Mutex::new(Vec::new()),
        }
    }
}

fn video(id: i64) -> Video {
    Video {
        id,
        title: format!("Video {}", id),
        media_url: Some(format!("https://cdn.example/{}.m3u8", id)),
        thumbnail_url: None,
    }
}

fn queue_item(id: i64, video_id: i64, votes: u32) -> QueueItem {
    QueueItem {
        id,
        video: video(video_id),
        position: Some(id),
        added_by: None,
        total_votes: votes,
        has_voted: None,
    }
}

impl RoomApi for FakeRoomApi {
    async fn room_state(&self, _room_id: i64) -> Result<RoomStateResponse, ApiError> {
        Ok(self.state.lock().clone())
    }

    async fn queue(&self, _room_id: i64) -> Result<Vec<QueueItem>, ApiError> {
        Ok(self.queue.lock().clone())
    }

    async fn add_to_queue(&self, _room_id: i64, video_id: i64) -> Result<QueueItem, ApiError> {
        let mut queue = self.queue.lock();
        let item = queue_item(100 + queue.len() as i64, video_id, 0);
        queue.push(item.clone());
        Ok(item)
    }

    async fn remove_from_queue(&self, _room_id: i64, entry_id: i64) -> Result<(), ApiError> {
        self.queue.lock().retain(|i| i.id != entry_id);
        Ok(())
    }

    async fn toggle_vote(&self, _room_id: i64, entry_id: i64) -> Result<(), ApiError> {
        for item in self.queue.lock().iter_mut().filter(|i| i.id == entry_id) {
            item.total_votes += 1;
            item.has_voted = Some(true);
        }
        Ok(())
    }

    async fn members(&self, _room_id: i64) -> Result<Vec<MemberResponse>, ApiError> {
        Ok(vec![
            MemberResponse {
                user: UserRef {
                    id: HOST,
                    username: "host".to_string(),
                },
                role: Role::Host,
            },
            MemberResponse {
                user: UserRef {
                    id: VIEWER,
                    username: "viewer".to_string(),
                },
                role: Role::Member,
            },
        ])
    }

    async fn video(&self, video_id: i64) -> Result<Video, ApiError> {
        Ok(video(video_id))
    }
}

fn config() -> ClientConfig {
    ClientConfig::for_base_url("http://localhost:8080").with_sync_interval(Duration::from_secs(3600))
}

struct Room {
    handle: RoomHandle,
    events: mpsc::UnboundedReceiver<RoomEvent>,
    transport: MemoryTransport,
    player: FakePlayer,
    player_tx: mpsc::UnboundedSender<PlayerEvent>,
}

fn enter(user_id: i64, api: FakeRoomApi, transport: MemoryTransport, config: ClientConfig) -> Room {
    let player = FakePlayer::default();
    let (player_tx, player_rx) = mpsc::unbounded_channel();
    let (handle, events) =
        RoomClient::new(config, transport.clone(), Arc::new(api), ROOM, user_id).spawn(player.clone(), player_rx);
    Room {
        handle,
        events,
        transport,
        player,
        player_tx,
    }
}

/// Let the room task run until it is idle
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn wait_for(events: &mut mpsc::UnboundedReceiver<RoomEvent>, want: impl Fn(&RoomEvent) -> bool) -> RoomEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Some(event) if want(&event) => return event,
                Some(_) => continue,
                None => panic!("room task stopped"),
            }
        }
    })
    .await
    .expect("timed out waiting for room event")
}

fn host_frame(action: RoomAction) -> RoomFrame {
    RoomFrame::new(action).from_sender(HOST)
}

#[tokio::test(start_paused = true)]
async fn test_entry_subscribes_and_announces() {
    let mut room = enter(VIEWER, FakeRoomApi::new(7, 0.0, false), MemoryTransport::new(true), config());
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(true))).await;

    assert_eq!(room.transport.subscriber_count(&room_topic(ROOM)), 1);
    assert_eq!(
        room.transport.published_to("/app/room/10/join"),
        vec![json!({"userId": VIEWER})]
    );
    assert_eq!(
        room.player.calls(),
        vec![Call::Load("https://cdn.example/7.m3u8".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_viewer_mirrors_host_play() {
    let mut room = enter(VIEWER, FakeRoomApi::new(7, 0.0, false), MemoryTransport::new(true), config());
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(_))).await;
    room.player.clear();

    room.transport
        .deliver(&room_topic(ROOM), &host_frame(RoomAction::Play).at(42.0).for_video(7));

    let event = wait_for(&mut room.events, |e| matches!(e, RoomEvent::Playback(_))).await;
    let RoomEvent::Playback(view) = event else {
        unreachable!()
    };
    assert!(view.is_playing);
    assert_eq!(room.player.calls(), vec![Call::Seek(42.0), Call::Play]);

    // The player's own events are echoes and a viewer never broadcasts anyway
    room.player_tx.send(PlayerEvent::Seeked { position: 42.0 }).unwrap();
    room.player_tx.send(PlayerEvent::Play { position: 42.0 }).unwrap();
    settle().await;
    assert!(room.transport.published_to("/app/room/10/play").is_empty());
    assert!(room.transport.published_to("/app/room/10/seek").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_host_broadcasts_local_play() {
    let mut room = enter(HOST, FakeRoomApi::new(7, 0.0, false), MemoryTransport::new(true), config());
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(_))).await;

    // Past the ignore window opened by the source load
    tokio::time::sleep(Duration::from_secs(1)).await;
    room.player_tx.send(PlayerEvent::Play { position: 42.0 }).unwrap();
    settle().await;

    assert_eq!(
        room.transport.published_to("/app/room/10/play"),
        vec![json!({"position": 42.0})]
    );
}

#[tokio::test(start_paused = true)]
async fn test_programmatic_load_is_not_rebroadcast() {
    let mut room = enter(HOST, FakeRoomApi::new(7, 0.0, false), MemoryTransport::new(true), config());
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(_))).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    room.handle.change_video(8).await.unwrap();
    assert_eq!(
        room.transport.published_to("/app/room/10/changeVideo"),
        vec![json!({"videoId": 8})]
    );

    // The player reports the new source as a seek to zero
    room.player_tx.send(PlayerEvent::Seeked { position: 0.0 }).unwrap();
    settle().await;
    assert!(room.transport.published_to("/app/room/10/seek").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_self_echo_is_dropped() {
    let mut room = enter(HOST, FakeRoomApi::new(7, 5.0, false), MemoryTransport::new(true), config());
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(_))).await;
    room.player.clear();

    room.transport
        .deliver(&room_topic(ROOM), &host_frame(RoomAction::Play).at(99.0).for_video(7));
    settle().await;

    assert!(room.player.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sync_snaps_only_past_threshold() {
    let mut room = enter(VIEWER, FakeRoomApi::new(7, 0.0, false), MemoryTransport::new(true), config());
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(_))).await;
    room.player.set_position(10.0);
    room.player.clear();

    room.transport
        .deliver(&room_topic(ROOM), &host_frame(RoomAction::Sync).at(11.5).for_video(7));
    settle().await;
    assert!(room.player.calls().is_empty());

    room.transport
        .deliver(&room_topic(ROOM), &host_frame(RoomAction::Sync).at(13.0).for_video(7));
    settle().await;
    assert_eq!(room.player.calls(), vec![Call::Seek(13.0)]);
}

#[tokio::test(start_paused = true)]
async fn test_host_publishes_periodic_sync() {
    let config = config().with_sync_interval(Duration::from_secs(5));
    let mut room = enter(HOST, FakeRoomApi::new(7, 0.0, false), MemoryTransport::new(true), config);
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(_))).await;
    room.player.set_position(3.0);

    tokio::time::sleep(Duration::from_millis(5100)).await;
    assert_eq!(
        room.transport.published_to("/app/room/10/sync"),
        vec![json!({"position": 3.0})]
    );
}

#[tokio::test(start_paused = true)]
async fn test_late_join_prompt_times_out_into_join() {
    let mut room = enter(VIEWER, FakeRoomApi::new(7, 120.0, true), MemoryTransport::new(true), config());

    let event = wait_for(&mut room.events, |e| matches!(e, RoomEvent::Prompt(_))).await;
    let RoomEvent::Prompt(prompt) = event else {
        unreachable!()
    };
    assert_eq!(prompt.video_id, Some(7));
    assert_eq!(prompt.position, 120.0);
    // Only the source is loaded while the viewer decides
    assert_eq!(
        room.player.calls(),
        vec![Call::Load("https://cdn.example/7.m3u8".to_string())]
    );

    let event = wait_for(&mut room.events, |e| matches!(e, RoomEvent::PromptClosed(_))).await;
    assert!(matches!(event, RoomEvent::PromptClosed(CatchUpOutcome::Join { .. })));
    let calls = room.player.calls();
    assert_eq!(&calls[1..], &[Call::Seek(120.0), Call::Play]);
}

#[tokio::test(start_paused = true)]
async fn test_browse_leaves_player_alone() {
    let mut room = enter(VIEWER, FakeRoomApi::new(7, 120.0, true), MemoryTransport::new(true), config());
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Prompt(_))).await;
    room.player.clear();

    room.handle
        .resolve_prompt(CatchUpDecision::BrowseIndependently)
        .unwrap();
    let event = wait_for(&mut room.events, |e| matches!(e, RoomEvent::PromptClosed(_))).await;
    assert!(matches!(event, RoomEvent::PromptClosed(CatchUpOutcome::Browse)));

    // Later host frames still apply
    room.transport
        .deliver(&room_topic(ROOM), &host_frame(RoomAction::Pause).at(130.0).for_video(7));
    settle().await;
    assert_eq!(room.player.calls(), vec![Call::Seek(130.0), Call::Pause]);
}

#[tokio::test(start_paused = true)]
async fn test_queue_follows_votes() {
    let api = FakeRoomApi::new(7, 0.0, false);
    let items = vec![queue_item(1, 20, 0), queue_item(2, 21, 0)];
    api.state.lock().queue = items.clone();
    *api.queue.lock() = items;
    let mut room = enter(VIEWER, api, MemoryTransport::new(true), config());
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(_))).await;

    room.handle.toggle_vote(2).await.unwrap();

    let mut last = None;
    while let Ok(event) = room.events.try_recv() {
        if let RoomEvent::Queue(entries) = event {
            last = Some(entries);
        }
    }
    let entries = last.expect("queue event");
    assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 1]);
    assert_eq!(entries[0].vote_count, 1);
    assert!(entries[0].viewer_has_voted);
}

#[tokio::test(start_paused = true)]
async fn test_viewer_cannot_change_video() {
    let mut room = enter(VIEWER, FakeRoomApi::new(7, 0.0, false), MemoryTransport::new(true), config());
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(_))).await;

    assert!(room.handle.change_video(8).await.is_err());
    assert!(room.handle.remove_from_queue(1).await.is_err());
    assert!(room.transport.published_to("/app/room/10/changeVideo").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_offline_controls_are_dropped_and_join_waits_for_connect() {
    let transport = MemoryTransport::new(false);
    let mut room = enter(HOST, FakeRoomApi::new(7, 0.0, false), transport, config());
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(false))).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    room.player_tx.send(PlayerEvent::Pause { position: 12.0 }).unwrap();
    settle().await;
    assert_eq!(room.transport.pending_len(), 0);

    room.transport.set_connected(true);
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(true))).await;
    assert!(room.transport.published_to("/app/room/10/pause").is_empty());
    assert_eq!(
        room.transport.published_to("/app/room/10/join"),
        vec![json!({"userId": HOST})]
    );
}

#[tokio::test(start_paused = true)]
async fn test_user_control_is_broadcast_by_host() {
    let mut room = enter(HOST, FakeRoomApi::new(7, 0.0, false), MemoryTransport::new(true), config());
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(_))).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    room.handle.control(LocalEvent::Seek(30.0)).unwrap();
    settle().await;
    assert_eq!(room.player.calls().last(), Some(&Call::Seek(30.0)));

    // The resulting player event is intent, not an echo
    room.player_tx.send(PlayerEvent::Seeked { position: 30.0 }).unwrap();
    settle().await;
    assert_eq!(
        room.transport.published_to("/app/room/10/seek"),
        vec![json!({"position": 30.0})]
    );
}

#[tokio::test(start_paused = true)]
async fn test_leave_sends_farewell_and_stops() {
    let mut room = enter(VIEWER, FakeRoomApi::new(7, 0.0, false), MemoryTransport::new(true), config());
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Connection(_))).await;

    room.handle.leave().await.unwrap();
    wait_for(&mut room.events, |e| matches!(e, RoomEvent::Left)).await;

    assert_eq!(
        room.transport.farewells(),
        vec![("/app/room/10/leave".to_string(), json!({"userId": VIEWER}))]
    );
    assert!(room.transport.is_closed());
    settle().await;
    assert!(room.handle.is_closed());
    assert_eq!(room.transport.subscriber_count(&room_topic(ROOM)), 0);
}
